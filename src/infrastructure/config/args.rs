use super::app_config::LogLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "coverart",
    version,
    about = "Cover art cache for Subsonic-compatible media servers",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Cache directory.
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Disk cache limit in megabytes.
    #[arg(long)]
    pub max_disk_mb: Option<u64>,

    /// Maximum concurrent network fetches.
    #[arg(long)]
    pub max_concurrent_fetches: Option<usize>,

    /// Media server base URL.
    #[arg(long, env = "COVERART_SERVER_URL")]
    pub server_url: Option<String>,

    /// Media server user name.
    #[arg(long, env = "COVERART_USERNAME")]
    pub username: Option<String>,

    /// Media server password.
    #[arg(long, env = "COVERART_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Media server API key.
    #[arg(long, env = "COVERART_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Cache operations exposed on the command line.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print memory and disk cache statistics.
    Stats,
    /// Run an expiry, orphan and size maintenance pass.
    Sweep,
    /// Delete every cached image.
    Clear,
    /// Load one cover through the cache.
    Fetch {
        /// Album or artist id.
        id: String,
        /// Treat the id as an artist.
        #[arg(long)]
        artist: bool,
        /// Requested edge length in pixels.
        #[arg(short, long, default_value_t = 300)]
        size: u32,
        /// Write the image to this file.
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Warm the cache for many covers at once.
    Prefetch {
        /// Album or artist ids.
        #[arg(required = true)]
        ids: Vec<String>,
        /// Treat the ids as artists.
        #[arg(long)]
        artist: bool,
        /// Requested edge length in pixels.
        #[arg(short, long, default_value_t = 150)]
        size: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch() {
        let args = CliArgs::parse_from(["coverart", "fetch", "42", "--size", "80", "--artist"]);
        match args.command {
            Command::Fetch {
                id, artist, size, ..
            } => {
                assert_eq!(id, "42");
                assert!(artist);
                assert_eq!(size, 80);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_prefetch_requires_ids() {
        assert!(CliArgs::try_parse_from(["coverart", "prefetch"]).is_err());
    }
}
