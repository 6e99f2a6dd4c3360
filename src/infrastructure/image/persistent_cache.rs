//! Memory + disk cache behind one key scheme.

use std::sync::Arc;

use bytes::Bytes;
use image::DynamicImage;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::codec::{self, EncodePolicy, Quality};
use super::disk_store::{DiskStats, DiskStore, MaintenanceReport};
use super::memory_store::{MemoryStats, MemoryStore};
use crate::domain::entities::{ArtworkEntity, CacheKey};
use crate::domain::errors::{CacheError, CacheResult};

/// Combined statistics for both tiers.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// In-memory tier.
    pub memory: MemoryStats,
    /// On-disk tier.
    pub disk: DiskStats,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}; {}", self.memory, self.disk)
    }
}

/// The single writer of truth for cached artwork.
///
/// Reads go memory first, then disk (promoting hits). Writes land in memory
/// synchronously and on disk in the background.
pub struct PersistentCache {
    memory: MemoryStore,
    disk: DiskStore,
    policy: EncodePolicy,
    pending_writes: Arc<watch::Sender<usize>>,
}

impl std::fmt::Debug for PersistentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCache")
            .field("disk", &self.disk)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PersistentCache {
    /// Creates a cache over the given tiers.
    #[must_use]
    pub fn new(memory: MemoryStore, disk: DiskStore, policy: EncodePolicy) -> Self {
        Self {
            memory,
            disk,
            policy,
            pending_writes: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Returns the encode policy.
    #[must_use]
    pub const fn policy(&self) -> &EncodePolicy {
        &self.policy
    }

    /// Returns the disk tier.
    #[must_use]
    pub const fn disk(&self) -> &DiskStore {
        &self.disk
    }

    /// Memory-only lookup that neither promotes nor touches disk.
    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        self.memory.peek(key)
    }

    /// Looks up `key` in memory, then on disk.
    ///
    /// Memory hits still refresh the disk entry's access time. Disk hits are
    /// decoded off the async threads and promoted into memory. Blobs that
    /// fail to decode are removed and reported as a miss.
    pub async fn image(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        if let Some(img) = self.memory.get(key) {
            self.disk.touch(key);
            return Some(img);
        }

        let bytes = self.disk.get(key).await?;
        match tokio::task::spawn_blocking(move || codec::decode(&bytes)).await {
            Ok(Ok(img)) => {
                debug!(key = %key, "Decoded image from disk cache");
                let img = Arc::new(img);
                self.memory.put(key.clone(), img.clone());
                Some(img)
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Failed to decode cached image, removing");
                self.disk.remove(key).await;
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Decode task failed");
                None
            }
        }
    }

    /// Refreshes the disk access time of `key` for a hit served elsewhere.
    pub fn touch(&self, key: &CacheKey) {
        self.disk.touch(key);
    }

    /// Clear generation; see [`DiskStore::generation`].
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.disk.generation()
    }

    /// Stores an image: memory now, disk in the background.
    pub fn store(&self, key: CacheKey, image: Arc<DynamicImage>, quality: Quality) {
        let generation = self.generation();
        self.memory.put(key.clone(), image.clone());

        let disk = self.disk.clone();
        self.spawn_disk_write(key.clone(), async move {
            disk.put_in(generation, &key, image, quality).await
        });
    }

    /// Stores a decoded image together with the bytes it was decoded from,
    /// persisting those bytes as-is.
    pub fn store_encoded(&self, key: CacheKey, image: Arc<DynamicImage>, bytes: Bytes) {
        self.store_encoded_in(self.generation(), key, image, bytes);
    }

    /// Like [`PersistentCache::store_encoded`] for data obtained in
    /// `generation`. Returns false, storing nothing, if the cache has been
    /// cleared since.
    pub fn store_encoded_in(
        &self,
        generation: u64,
        key: CacheKey,
        image: Arc<DynamicImage>,
        bytes: Bytes,
    ) -> bool {
        if generation != self.generation() {
            debug!(key = %key, "Cache cleared during fetch, not storing");
            return false;
        }
        self.memory.put(key.clone(), image);

        let disk = self.disk.clone();
        self.spawn_disk_write(key.clone(), async move {
            disk.put_encoded_in(generation, &key, bytes).await
        });
        true
    }

    /// Stores an image and waits for the disk write.
    ///
    /// # Errors
    /// Returns error if encoding or writing fails. The memory tier is
    /// populated either way.
    pub async fn store_durable(
        &self,
        key: CacheKey,
        image: Arc<DynamicImage>,
        quality: Quality,
    ) -> CacheResult<()> {
        self.memory.put(key.clone(), image.clone());
        self.disk.put(&key, image, quality).await
    }

    /// Removes `key` from both tiers.
    pub async fn remove(&self, key: &CacheKey) {
        self.memory.remove(key);
        self.disk.remove(key).await;
    }

    /// Drops every memory entry belonging to `entity`.
    pub fn forget_entity_in_memory(&self, entity: &ArtworkEntity) -> usize {
        self.memory.remove_where(|key| key.entity() == entity)
    }

    /// Clears both tiers. Background writes issued before the clear are
    /// discarded rather than landing afterwards.
    ///
    /// # Errors
    /// Returns error if the disk tier cannot be cleared.
    pub async fn remove_all(&self) -> CacheResult<()> {
        self.memory.clear();
        self.disk.clear().await
    }

    /// Returns statistics for both tiers.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            memory: self.memory.stats(),
            disk: self.disk.stats().await,
        }
    }

    /// Waits for background disk writes to finish, then flushes the index.
    ///
    /// # Errors
    /// Returns error if the disk worker has stopped.
    pub async fn settle(&self) -> CacheResult<()> {
        let mut rx = self.pending_writes.subscribe();
        let _ = rx.wait_for(|pending| *pending == 0).await;
        self.disk.flush().await
    }

    /// Runs a disk maintenance pass.
    ///
    /// # Errors
    /// Returns error if the disk worker has stopped.
    pub async fn maintain(&self) -> CacheResult<MaintenanceReport> {
        self.disk.maintain().await
    }

    /// Runs a disk write on the current runtime, logging failures.
    fn spawn_disk_write<F>(&self, key: CacheKey, write: F)
    where
        F: Future<Output = Result<(), CacheError>> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            trace!(key = %key, "No runtime available, skipping disk write");
            return;
        };

        let pending = Arc::clone(&self.pending_writes);
        pending.send_modify(|n| *n += 1);
        handle.spawn(async move {
            if let Err(e) = write.await {
                warn!(key = %key, error = %e, "Failed to cache to disk");
            }
            pending.send_modify(|n| *n -= 1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::image::disk_store::DiskStoreConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn create_cache(dir: &TempDir) -> PersistentCache {
        let disk = DiskStore::open(dir.path().to_path_buf(), DiskStoreConfig::default())
            .await
            .unwrap();
        PersistentCache::new(MemoryStore::default(), disk, EncodePolicy::default())
    }

    fn gradient(edge: u32) -> Arc<DynamicImage> {
        let img = image::RgbImage::from_fn(edge, edge, |x, y| {
            image::Rgb([(x * 3 % 256) as u8, (y * 5 % 256) as u8, 128])
        });
        Arc::new(DynamicImage::ImageRgb8(img))
    }

    fn key(size: u32) -> CacheKey {
        CacheKey::new(ArtworkEntity::album("42"), size)
    }

    #[tokio::test]
    async fn test_lossless_round_trip_through_disk() {
        let temp = TempDir::new().unwrap();
        let original = gradient(40);
        {
            let cache = create_cache(&temp).await;
            cache
                .store_durable(key(800), original.clone(), Quality::Lossless)
                .await
                .unwrap();
            cache.disk().flush().await.unwrap();
        }

        // A fresh instance has an empty memory tier, so this reads from disk.
        let cache = create_cache(&temp).await;
        assert!(cache.peek(&key(800)).is_none());
        let loaded = cache.image(&key(800)).await.unwrap();
        assert_eq!(loaded.to_rgb8().as_raw(), original.to_rgb8().as_raw());

        // Promoted into memory.
        assert!(cache.peek(&key(800)).is_some());
    }

    #[tokio::test]
    async fn test_lossy_round_trip_is_tolerant() {
        let temp = TempDir::new().unwrap();
        let original = Arc::new(DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            24,
            24,
            image::Rgb([10, 200, 30]),
        )));
        {
            let cache = create_cache(&temp).await;
            cache
                .store_durable(key(150), original.clone(), Quality::Lossy(90))
                .await
                .unwrap();
        }

        let cache = create_cache(&temp).await;
        let loaded = cache.image(&key(150)).await.unwrap().to_rgb8();
        assert_eq!(loaded.dimensions(), (24, 24));
        let max_diff = loaded
            .as_raw()
            .iter()
            .zip(original.to_rgb8().as_raw())
            .map(|(a, b)| a.abs_diff(*b))
            .max()
            .unwrap_or(0);
        assert!(max_diff <= 8);
    }

    #[tokio::test]
    async fn test_store_is_visible_immediately() {
        let temp = TempDir::new().unwrap();
        let cache = create_cache(&temp).await;

        cache.store(key(300), gradient(30), Quality::Lossy(85));
        assert!(cache.peek(&key(300)).is_some());
    }

    #[tokio::test]
    async fn test_background_disk_write_lands() {
        let temp = TempDir::new().unwrap();
        let cache = create_cache(&temp).await;

        cache.store(key(300), gradient(30), Quality::Lossy(85));

        let mut persisted = false;
        for _ in 0..50 {
            if cache.disk().contains(&key(300)).await {
                persisted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(persisted);
    }

    #[tokio::test]
    async fn test_settle_waits_for_background_writes() {
        let temp = TempDir::new().unwrap();
        let cache = create_cache(&temp).await;

        for size in [80, 150, 300] {
            cache.store(key(size), gradient(16), Quality::Lossless);
        }
        cache.settle().await.unwrap();

        assert_eq!(cache.stats().await.disk.count, 3);
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_removed() {
        let temp = TempDir::new().unwrap();
        let cache = create_cache(&temp).await;
        cache
            .disk()
            .put_encoded(&key(80), Bytes::from_static(b"not an image"))
            .await
            .unwrap();

        assert!(cache.image(&key(80)).await.is_none());
        assert!(!cache.disk().contains(&key(80)).await);
    }

    #[tokio::test]
    async fn test_memory_hits_keep_disk_entry_warm() {
        let temp = TempDir::new().unwrap();
        let config = DiskStoreConfig {
            max_bytes: 1000,
            ..DiskStoreConfig::default()
        };
        let disk = DiskStore::open(temp.path().to_path_buf(), config)
            .await
            .unwrap();
        let cache = PersistentCache::new(MemoryStore::default(), disk, EncodePolicy::default());

        for size in [80, 150, 300] {
            cache.store_encoded(key(size), gradient(4), Bytes::from(vec![1u8; 300]));
            cache.settle().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for _ in 0..5 {
            assert!(cache.image(&key(80)).await.is_some());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        cache.store_encoded(key(400), gradient(4), Bytes::from(vec![1u8; 300]));
        cache.settle().await.unwrap();

        assert!(cache.disk().contains(&key(80)).await);
        assert!(cache.disk().contains(&key(400)).await);
        assert!(!cache.disk().contains(&key(150)).await);
    }

    #[tokio::test]
    async fn test_write_pending_at_clear_does_not_come_back() {
        let temp = TempDir::new().unwrap();
        let cache = create_cache(&temp).await;

        cache.store(key(300), gradient(64), Quality::Lossless);
        cache.remove_all().await.unwrap();
        cache.settle().await.unwrap();

        assert_eq!(cache.stats().await.disk.count, 0);
        assert!(!temp.path().join(key(300).blob_filename()).exists());
    }

    #[tokio::test]
    async fn test_fetch_from_before_clear_is_not_stored() {
        let temp = TempDir::new().unwrap();
        let cache = create_cache(&temp).await;
        let generation = cache.generation();

        cache.remove_all().await.unwrap();
        let stored =
            cache.store_encoded_in(generation, key(500), gradient(8), Bytes::from_static(b"x"));
        cache.settle().await.unwrap();

        assert!(!stored);
        assert!(cache.peek(&key(500)).is_none());
        assert_eq!(cache.stats().await.disk.count, 0);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let temp = TempDir::new().unwrap();
        let cache = create_cache(&temp).await;
        cache
            .store_durable(key(80), gradient(8), Quality::Lossless)
            .await
            .unwrap();

        cache.remove_all().await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.memory.count, 0);
        assert_eq!(stats.disk.count, 0);
        assert!(cache.image(&key(80)).await.is_none());
    }
}
