//! Cache tuning loaded from the `[cache]` table.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use super::app_config::{APP_NAME, APP_ORGANIZATION, APP_QUALIFIER};
use crate::infrastructure::image::codec::{
    DEFAULT_LOSSLESS_MIN_SIZE, DEFAULT_LOSSY_QUALITY, EncodePolicy,
};
use crate::infrastructure::image::disk_store::DiskStoreConfig;

/// Size tiers requested by the UI, smallest first.
pub const DEFAULT_SIZE_TIERS: [u32; 6] = [80, 150, 200, 300, 400, 800];

/// Default network fetch resolution.
pub const DEFAULT_NATURAL_SIZE: u32 = 500;

/// Artwork cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory. Defaults to the platform cache dir.
    pub directory: Option<PathBuf>,
    /// Maximum bytes on disk.
    pub max_disk_bytes: u64,
    /// Entries older than this many days are expired.
    pub max_age_days: u64,
    /// Maximum decoded images held in memory.
    pub memory_max_items: usize,
    /// Maximum decoded bytes held in memory.
    pub memory_max_bytes: u64,
    /// Variants kept per entity besides the base image.
    pub max_variants_per_entity: usize,
    /// Global cap on concurrent network fetches.
    pub max_concurrent_fetches: usize,
    /// Minimum size fetched from the server.
    pub natural_size: u32,
    /// Sizes the UI requests.
    pub size_tiers: Vec<u32>,
    /// Device pixel scale used for memory accounting.
    pub device_scale: f32,
    /// JPEG quality for derived variants.
    pub lossy_quality: u8,
    /// Derived variants at or above this size are stored losslessly.
    pub lossless_min_size: u32,
    /// Seconds between disk maintenance passes.
    pub maintenance_interval_secs: u64,
    /// Milliseconds between index flushes of access-time updates.
    pub index_flush_ms: u64,
    /// Unreferenced files younger than this are not swept.
    pub orphan_grace_secs: u64,
    /// Milliseconds between batched load notifications.
    pub notify_batch_ms: u64,
    /// Upper bound on ids accepted by one batch preload.
    pub max_batch_preload: usize,
    /// Entities whose variant generators stay resident.
    pub tracked_entities: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_disk_bytes: 200 * 1024 * 1024,
            max_age_days: 30,
            memory_max_items: 100,
            memory_max_bytes: 80 * 1024 * 1024,
            max_variants_per_entity: 3,
            max_concurrent_fetches: 3,
            natural_size: DEFAULT_NATURAL_SIZE,
            size_tiers: DEFAULT_SIZE_TIERS.to_vec(),
            device_scale: 2.0,
            lossy_quality: DEFAULT_LOSSY_QUALITY,
            lossless_min_size: DEFAULT_LOSSLESS_MIN_SIZE,
            maintenance_interval_secs: 60 * 60,
            index_flush_ms: 5_000,
            orphan_grace_secs: 60,
            notify_batch_ms: 100,
            max_batch_preload: 60,
            tracked_entities: 64,
        }
    }
}

impl CacheConfig {
    /// Returns default cache directory.
    #[must_use]
    pub fn default_directory() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.cache_dir().join("artwork"))
    }

    /// Returns effective cache directory.
    #[must_use]
    pub fn effective_directory(&self) -> PathBuf {
        self.directory
            .clone()
            .or_else(Self::default_directory)
            .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME).join("artwork"))
    }

    /// Size fetched from the network to satisfy a request for `size`.
    #[must_use]
    pub fn natural_size_for(&self, size: u32) -> u32 {
        size.max(self.natural_size)
    }

    /// Smallest configured tier strictly larger than `size`.
    #[must_use]
    pub fn next_tier_above(&self, size: u32) -> Option<u32> {
        self.size_tiers.iter().copied().filter(|t| *t > size).min()
    }

    /// Sizes worth probing on disk for a source at least as large as `size`,
    /// ascending.
    #[must_use]
    pub fn larger_sources(&self, size: u32) -> Vec<u32> {
        let mut sizes: Vec<u32> = self
            .size_tiers
            .iter()
            .copied()
            .chain(std::iter::once(self.natural_size))
            .filter(|s| *s > size)
            .collect();
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    /// Disk store tuning.
    #[must_use]
    pub fn disk_store_config(&self) -> DiskStoreConfig {
        DiskStoreConfig {
            max_bytes: self.max_disk_bytes,
            max_age: Duration::from_secs(self.max_age_days.saturating_mul(24 * 60 * 60)),
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs),
            flush_interval: Duration::from_millis(self.index_flush_ms),
            orphan_grace: Duration::from_secs(self.orphan_grace_secs),
        }
    }

    /// Encode policy for derived variants.
    #[must_use]
    pub const fn encode_policy(&self) -> EncodePolicy {
        EncodePolicy {
            lossy_quality: self.lossy_quality,
            lossless_min_size: self.lossless_min_size,
        }
    }

    /// Interval between batched load notifications.
    #[must_use]
    pub const fn notify_batch_interval(&self) -> Duration {
        Duration::from_millis(self.notify_batch_ms)
    }
}
