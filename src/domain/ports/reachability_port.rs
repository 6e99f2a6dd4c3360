//! Port definition for the network reachability signal.

/// Reports whether the media server can currently be reached.
#[cfg_attr(test, mockall::automock)]
pub trait ReachabilityPort: Send + Sync {
    /// Returns false while the client is offline or in offline mode.
    fn is_reachable(&self) -> bool;
}

/// Reachability source that always reports online.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

impl ReachabilityPort for AlwaysReachable {
    fn is_reachable(&self) -> bool {
        true
    }
}
