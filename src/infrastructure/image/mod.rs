//! Image handling infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU eviction
//! - Disk caching with an atomic metadata index
//! - Per-entity variant derivation
//! - Request coordination with deduplicated network fetches

pub mod codec;
pub mod coordinator;
pub mod disk_index;
pub mod disk_store;
pub mod load_states;
pub mod memory_store;
pub mod persistent_cache;
pub mod variant_generator;

mod coordinator_test;

pub use codec::{EncodePolicy, Quality};
pub use coordinator::{BatchReport, RequestCoordinator};
pub use disk_store::{DiskStats, DiskStore, DiskStoreConfig, MaintenanceReport};
pub use load_states::{CacheEvent, LoadStateRegistry};
pub use memory_store::{MemoryStats, MemoryStore};
pub use persistent_cache::{CacheStats, PersistentCache};
pub use variant_generator::VariantGenerator;
