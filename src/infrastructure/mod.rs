//! Infrastructure layer with external service adapters.

/// Application configuration.
pub mod config;
/// Media server fetch adapters.
pub mod fetch;
/// Image caching, derivation and request coordination.
pub mod image;
/// Server reachability tracking.
pub mod network_monitor;

pub use config::{AppConfig, CacheConfig, CliArgs, Command, LogLevel, ServerConfig, StorageManager};
pub use fetch::MediaServerFetcher;
pub use image::{CacheEvent, CacheStats, RequestCoordinator};
pub use network_monitor::NetworkMonitor;
