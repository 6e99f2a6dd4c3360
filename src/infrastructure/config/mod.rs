//! Application configuration.

pub mod app_config;
pub mod args;
pub mod cache_config;
pub mod server_config;
pub mod storage;

pub use app_config::{AppConfig, LogLevel};
pub use args::{CliArgs, Command};
pub use cache_config::CacheConfig;
pub use server_config::ServerConfig;
pub use storage::{ConfigError, StorageManager};
