//! Cache error types.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors raised by the artwork cache.
///
/// `Clone` so a single shared fetch outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum CacheError {
    #[error("failed to decode image: {message}")]
    Decode { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("disk cache I/O error: {message}")]
    DiskIo { message: String },

    #[error("disk cache over capacity: {total_bytes} of {max_bytes} bytes")]
    CapacityExceeded { total_bytes: u64, max_bytes: u64 },

    #[error("media server unreachable (offline)")]
    Offline,

    #[error("artwork not found: {key}")]
    NotFound { key: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl CacheError {
    /// Creates decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates disk I/O error.
    #[must_use]
    pub fn disk_io(message: impl Into<String>) -> Self {
        Self::DiskIo {
            message: message.into(),
        }
    }

    /// Creates not found error.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates invalid request error.
    #[must_use]
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Returns whether a later retry may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Offline | Self::DiskIo { .. } | Self::NotFound { .. }
        )
    }

    /// Returns whether the error came from the network layer.
    #[must_use]
    pub const fn is_network_error(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Offline)
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::disk_io(err.to_string())
    }
}

impl From<image::ImageError> for CacheError {
    fn from(err: image::ImageError) -> Self {
        Self::decode(err.to_string())
    }
}
