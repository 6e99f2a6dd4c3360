//! Media server connection settings loaded from the `[server]` table.

use serde::{Deserialize, Serialize};

/// Subsonic API version sent with every request.
pub const DEFAULT_API_VERSION: &str = "1.16.1";

/// Media server configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the server, e.g. `https://music.example.com`.
    pub url: String,
    /// Account name.
    pub username: String,
    /// Account password. Sent hex-encoded when no API key is set.
    pub password: Option<String>,
    /// API key, preferred over the password when present.
    pub api_key: Option<String>,
    /// Client name reported to the server.
    pub client_name: String,
    /// API version reported to the server.
    pub api_version: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Seconds between reachability probes.
    pub probe_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:4533".to_string(),
            username: String::new(),
            password: None,
            api_key: None,
            client_name: crate::NAME.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout_secs: 30,
            probe_interval_secs: 30,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("client_name", &self.client_name)
            .field("api_version", &self.api_version)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Returns true if credentials are present.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() || (!self.username.is_empty() && self.password.is_some())
    }
}
