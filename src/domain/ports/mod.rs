mod artwork_fetch_port;
mod reachability_port;

pub use artwork_fetch_port::ArtworkFetchPort;
pub use reachability_port::{AlwaysReachable, ReachabilityPort};
