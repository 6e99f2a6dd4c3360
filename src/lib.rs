//! Coverart - A multi-tier cover art cache for music streaming clients.
//!
//! This crate fetches album and artist artwork from a Subsonic-compatible
//! media server and serves it from memory, disk or derived variants,
//! collapsing concurrent requests into a single network fetch.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing caches and adapters for external services.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "coverart";
