//! Network adapters for the artwork fetch port.

mod media_server;

pub use media_server::MediaServerFetcher;
