//! Application configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::args::CliArgs;
use super::cache_config::CacheConfig;
use super::server_config::ServerConfig;

pub(super) const APP_NAME: &str = "coverart";
pub(super) const APP_QUALIFIER: &str = "org";
pub(super) const APP_ORGANIZATION: &str = "coverart";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Application configuration, from file and CLI.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[serde(skip)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Cache tuning.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Media server connection.
    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(cache_dir) = &args.cache_dir {
            self.cache.directory = Some(cache_dir.clone());
        }
        if let Some(max_disk_mb) = args.max_disk_mb {
            self.cache.max_disk_bytes = max_disk_mb.saturating_mul(1024 * 1024);
        }
        if let Some(max_fetches) = args.max_concurrent_fetches {
            self.cache.max_concurrent_fetches = max_fetches;
        }
        if let Some(url) = &args.server_url {
            self.server.url.clone_from(url);
        }
        if let Some(username) = &args.username {
            self.server.username.clone_from(username);
        }
        if let Some(password) = &args.password {
            self.server.password = Some(password.clone());
        }
        if let Some(api_key) = &args.api_key {
            self.server.api_key = Some(api_key.clone());
        }
    }

    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default config file path.
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Returns default log file path.
    #[must_use]
    pub fn default_log_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.data_dir().join("coverart.log"))
    }

    /// Returns effective config path.
    #[must_use]
    pub fn effective_config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(Self::default_config_path)
    }

    /// Returns effective log path.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone().or_else(Self::default_log_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_config_with_tables() {
        let toml_content = r#"
            log_level = "debug"

            [cache]
            max_disk_bytes = 1048576
            size_tiers = [100, 200]

            [server]
            url = "https://music.example.com"
            username = "alice"
        "#;

        let config: AppConfig = toml::from_str(toml_content).expect("Failed to parse config");

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.cache.max_disk_bytes, 1_048_576);
        assert_eq!(config.cache.size_tiers, vec![100, 200]);
        assert_eq!(config.cache.natural_size, 500);
        assert_eq!(config.server.url, "https://music.example.com");
        assert_eq!(config.server.username, "alice");
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.cache, CacheConfig::default());
        assert!(config.server.password.is_none());
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut config = AppConfig::default();
        let args = CliArgs::parse_from([
            "coverart",
            "--max-disk-mb",
            "50",
            "--max-concurrent-fetches",
            "6",
            "--server-url",
            "http://nas:4533",
            "--log-level",
            "trace",
            "stats",
        ]);

        config.merge_with_args(&args);

        assert_eq!(config.cache.max_disk_bytes, 50 * 1024 * 1024);
        assert_eq!(config.cache.max_concurrent_fetches, 6);
        assert_eq!(config.server.url, "http://nas:4533");
        assert_eq!(config.log_level, LogLevel::Trace);
    }
}
