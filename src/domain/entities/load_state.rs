//! Reactive load state consumed by the UI layer.

use std::fmt;

/// Status of one cache key in the loading pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadState {
    /// Nothing has been requested yet.
    #[default]
    Idle,
    /// A lookup or network fetch is in progress.
    Loading,
    /// The image is available from the cache.
    Loaded,
    /// Loading failed; the reason is suitable for display and retry.
    Error(String),
}

impl LoadState {
    /// Returns true if the image is ready.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }

    /// Returns true if loading failed.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns true when this state settles a load (loaded or error).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Loaded | Self::Error(_))
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// `loaded -> loading` is only valid for an explicit refresh.
    #[must_use]
    pub const fn can_transition_to(&self, next: &Self, refresh: bool) -> bool {
        match (self, next) {
            (Self::Idle | Self::Error(_), Self::Loading)
            | (Self::Loading, Self::Loaded | Self::Error(_))
            | (Self::Idle | Self::Error(_), Self::Loaded)
            | (Self::Loaded, Self::Loaded) => true,
            (Self::Loaded, Self::Loading) => refresh,
            (_, Self::Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Loaded => write!(f, "loaded"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}
