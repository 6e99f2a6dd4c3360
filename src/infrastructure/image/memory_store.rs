//! In-memory LRU store for decoded artwork.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::{DynamicImage, GenericImageView};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::codec;

use crate::domain::entities::CacheKey;

/// Default maximum number of images to hold in memory.
pub const DEFAULT_MAX_ITEMS: usize = 100;

/// Default maximum decoded bytes to hold in memory (80 MB).
pub const DEFAULT_MAX_BYTES: u64 = 80 * 1024 * 1024;

/// Bounded LRU of decoded images, evicting under count or byte pressure.
///
/// Byte cost is the image's footprint at the device pixel scale. Uses a
/// synchronous lock so `peek` can be served from UI code without an
/// await point.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_items: usize,
    max_bytes: u64,
    device_scale: f32,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct Inner {
    entries: LruCache<CacheKey, Arc<DynamicImage>>,
    total_bytes: u64,
}

impl MemoryStore {
    /// Creates a store with the given bounds.
    #[must_use]
    pub fn new(max_items: usize, max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            max_items: max_items.max(1),
            max_bytes,
            device_scale: 1.0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Charges images at `scale` device pixels per logical pixel.
    #[must_use]
    pub fn with_device_scale(mut self, scale: f32) -> Self {
        self.device_scale = scale;
        self
    }

    fn cost_of(&self, image: &DynamicImage) -> u64 {
        let (w, h) = image.dimensions();
        codec::footprint_bytes(w, h, self.device_scale)
    }

    /// Gets an image and marks it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        let mut inner = self.inner.lock();
        if let Some(img) = inner.entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
            Some(img.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
            None
        }
    }

    /// Peeks at an image without promoting it or touching statistics.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        self.inner.lock().entries.peek(key).cloned()
    }

    /// Returns true if `key` is held.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Stores an image, evicting least recently used entries as needed.
    pub fn put(&self, key: CacheKey, image: Arc<DynamicImage>) {
        let cost = self.cost_of(&image);
        let mut inner = self.inner.lock();

        if let Some(old) = inner.entries.put(key.clone(), image) {
            inner.total_bytes = inner.total_bytes.saturating_sub(self.cost_of(&old));
        }
        inner.total_bytes += cost;
        debug!(key = %key, cost, "Stored image in memory cache");

        // The entry just inserted is never evicted by its own put.
        while inner.entries.len() > 1
            && (inner.entries.len() > self.max_items || inner.total_bytes > self.max_bytes)
        {
            let Some((evicted, img)) = inner.entries.pop_lru() else {
                break;
            };
            inner.total_bytes = inner.total_bytes.saturating_sub(self.cost_of(&img));
            trace!(key = %evicted, "Evicted image from memory cache");
        }
    }

    /// Removes an image.
    pub fn remove(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(img) = inner.entries.pop(key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(self.cost_of(&img));
            debug!(key = %key, "Removed image from memory cache");
        }
    }

    /// Removes every image whose key matches `predicate`, returning the count.
    pub fn remove_where(&self, mut predicate: impl FnMut(&CacheKey) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            if let Some(img) = inner.entries.pop(key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(self.cost_of(&img));
            }
        }
        doomed.len()
    }

    /// Clears all images.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
        debug!("Cleared memory image cache");
    }

    /// Number of cached images.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if no images are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> MemoryStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let inner = self.inner.lock();
        MemoryStats {
            hits,
            misses,
            hit_rate,
            count: inner.entries.len(),
            total_bytes: inner.total_bytes,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS, DEFAULT_MAX_BYTES)
    }
}

/// Statistics about memory cache performance.
#[derive(Debug, Clone)]
pub struct MemoryStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub count: usize,
    /// Decoded bytes held.
    pub total_bytes: u64,
}

impl std::fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Memory: {} images, {} bytes, {:.1}% hit rate ({} hits, {} misses)",
            self.count, self.total_bytes, self.hit_rate, self.hits, self.misses
        )
    }
}
