//! Per-entity derivation of downscaled artwork variants.
//!
//! A generator holds one base image (the network-resolution fetch) plus a
//! small set of variants derived from it. A variant is only ever produced
//! from a cached source of the same or larger nominal size.

use std::collections::BTreeMap;
use std::sync::Arc;

use image::{DynamicImage, GenericImageView};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::codec;
use super::persistent_cache::PersistentCache;
use crate::domain::entities::{ArtworkEntity, CacheKey};

/// Default cap on cached variants per entity.
pub const DEFAULT_MAX_VARIANTS: usize = 3;

/// Base image plus on-demand variants for one entity.
pub struct VariantGenerator {
    entity: ArtworkEntity,
    base: Arc<DynamicImage>,
    base_size: u32,
    variants: Mutex<BTreeMap<u32, Arc<DynamicImage>>>,
    max_variants: usize,
    device_scale: f32,
    cache: Option<Arc<PersistentCache>>,
}

impl std::fmt::Debug for VariantGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariantGenerator")
            .field("entity", &self.entity)
            .field("base_size", &self.base_size)
            .field("variants", &self.cached_sizes())
            .finish_non_exhaustive()
    }
}

impl VariantGenerator {
    /// Creates a generator around `base`, which was fetched at `base_size`.
    ///
    /// Derived variants are written through `cache` when one is given.
    #[must_use]
    pub fn new(
        entity: ArtworkEntity,
        base: Arc<DynamicImage>,
        base_size: u32,
        max_variants: usize,
        device_scale: f32,
        cache: Option<Arc<PersistentCache>>,
    ) -> Self {
        Self {
            entity,
            base,
            base_size,
            variants: Mutex::new(BTreeMap::new()),
            max_variants: max_variants.max(1),
            device_scale,
            cache,
        }
    }

    /// Returns the entity.
    #[must_use]
    pub const fn entity(&self) -> &ArtworkEntity {
        &self.entity
    }

    /// Nominal size of the base image.
    #[must_use]
    pub const fn base_size(&self) -> u32 {
        self.base_size
    }

    /// Sizes of cached variants, ascending. The base is not included.
    #[must_use]
    pub fn cached_sizes(&self) -> Vec<u32> {
        self.variants.lock().keys().copied().collect()
    }

    /// Returns the image for `size`, deriving it from the nearest larger
    /// cached source when needed.
    ///
    /// Returns `None` if every cached source is smaller than `size`; the
    /// caller must then go to the network. Derivation runs on the calling
    /// thread; persisting the result does not.
    pub fn get_image(&self, size: u32) -> Option<Arc<DynamicImage>> {
        if size == self.base_size {
            return Some(self.base.clone());
        }

        let (source_size, source) = {
            let variants = self.variants.lock();
            if let Some(img) = variants.get(&size) {
                trace!(entity = %self.entity, size, "Variant hit");
                return Some(img.clone());
            }
            self.nearest_source(&variants, size)?
        };

        let derived = Arc::new(codec::downscale(&source, size));
        debug!(
            entity = %self.entity,
            size,
            source_size,
            "Derived variant"
        );

        let derived = self.insert_variant(size, derived);
        self.persist(size, derived.clone());
        Some(derived)
    }

    /// Derives and caches `size` in the background.
    ///
    /// Returns `None` without doing anything if `size` is larger than the
    /// base, already cached, or no runtime is available.
    pub fn preload(self: &Arc<Self>, size: u32) -> Option<JoinHandle<()>> {
        if size > self.base_size || size == self.base_size || self.has_variant(size) {
            return None;
        }
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let this = Arc::clone(self);
        Some(handle.spawn_blocking(move || {
            let _ = this.get_image(size);
        }))
    }

    /// Returns true if `size` is cached exactly (base or variant).
    #[must_use]
    pub fn has_variant(&self, size: u32) -> bool {
        size == self.base_size || self.variants.lock().contains_key(&size)
    }

    /// Returns true if `size` can be served without the network.
    #[must_use]
    pub fn can_serve(&self, size: u32) -> bool {
        size <= self.base_size || self.variants.lock().range(size..).next().is_some()
    }

    /// Decoded memory footprint of base and variants at the device scale.
    #[must_use]
    pub fn memory_footprint(&self) -> u64 {
        let (w, h) = self.base.dimensions();
        let base = codec::footprint_bytes(w, h, self.device_scale);
        let variants: u64 = self
            .variants
            .lock()
            .values()
            .map(|img| {
                let (w, h) = img.dimensions();
                codec::footprint_bytes(w, h, self.device_scale)
            })
            .sum();
        base + variants
    }

    fn nearest_source(
        &self,
        variants: &BTreeMap<u32, Arc<DynamicImage>>,
        size: u32,
    ) -> Option<(u32, Arc<DynamicImage>)> {
        let from_variants = variants
            .range(size..)
            .next()
            .map(|(s, img)| (*s, img.clone()));
        let from_base = (self.base_size >= size).then(|| (self.base_size, self.base.clone()));

        match (from_variants, from_base) {
            (Some(v), Some(b)) => Some(if v.0 <= b.0 { v } else { b }),
            (v, b) => v.or(b),
        }
    }

    /// Inserts a variant, evicting the smallest when over the cap. Returns
    /// whichever image is now cached for `size` (a concurrent derivation may
    /// have won).
    fn insert_variant(&self, size: u32, image: Arc<DynamicImage>) -> Arc<DynamicImage> {
        let mut variants = self.variants.lock();
        let image = variants.entry(size).or_insert(image).clone();
        while variants.len() > self.max_variants {
            if let Some((evicted, _)) = variants.pop_first() {
                trace!(entity = %self.entity, size = evicted, "Evicted smallest variant");
            }
        }
        image
    }

    fn persist(&self, size: u32, image: Arc<DynamicImage>) {
        let Some(cache) = &self.cache else {
            return;
        };
        let quality = cache.policy().quality_for(size);
        cache.store(CacheKey::new(self.entity.clone(), size), image, quality);
    }
}
