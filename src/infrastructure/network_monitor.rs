//! Server reachability tracking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::domain::ports::ReachabilityPort;

/// Default interval between reachability probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Holds the current reachability of the media server.
///
/// Updated explicitly via [`NetworkMonitor::set_reachable`] or by a probe
/// task started with [`NetworkMonitor::spawn_probe`].
#[derive(Debug)]
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    /// Creates a monitor with the given initial state.
    #[must_use]
    pub fn new(reachable: bool) -> Arc<Self> {
        let (tx, _) = watch::channel(reachable);
        Arc::new(Self { tx })
    }

    /// Updates reachability, waking observers on change.
    pub fn set_reachable(&self, reachable: bool) {
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != reachable;
            *current = reachable;
            changed
        });
        if changed {
            if reachable {
                info!("Media server reachable");
            } else {
                warn!("Media server unreachable, serving cached artwork only");
            }
        }
    }

    /// Stream of reachability changes, starting with the current state.
    #[must_use]
    pub fn observe(&self) -> WatchStream<bool> {
        WatchStream::new(self.tx.subscribe())
    }

    /// Periodically pings `url` and records whether it answered.
    ///
    /// The task stops once every handle to the monitor is dropped.
    pub fn spawn_probe(
        self: &Arc<Self>,
        client: reqwest::Client,
        url: String,
        period: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = match client.head(&url).send().await {
                    Ok(response) => !response.status().is_server_error(),
                    Err(e) => {
                        debug!(error = %e, "Reachability probe failed");
                        false
                    }
                };
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.set_reachable(reachable);
            }
        })
    }
}

impl ReachabilityPort for NetworkMonitor {
    fn is_reachable(&self) -> bool {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_initial_state() {
        assert!(NetworkMonitor::new(true).is_reachable());
        assert!(!NetworkMonitor::new(false).is_reachable());
    }

    #[tokio::test]
    async fn test_observe_sees_changes() {
        let monitor = NetworkMonitor::new(true);
        let mut stream = monitor.observe();
        assert_eq!(stream.next().await, Some(true));

        monitor.set_reachable(false);
        assert_eq!(stream.next().await, Some(false));
        assert!(!monitor.is_reachable());
    }

    #[tokio::test]
    async fn test_repeated_state_does_not_notify() {
        let monitor = NetworkMonitor::new(true);
        let mut stream = monitor.observe();
        let _ = stream.next().await;

        monitor.set_reachable(true);
        let next = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(next.is_err());
    }
}
