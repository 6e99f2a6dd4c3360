//! Request coordination for cover art.
//!
//! Implements the lookup order: persistent cache -> variant derivation ->
//! larger cached tiers -> network. Network fetches are deduplicated per
//! fetch key and capped globally.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures_util::future::join_all;
use image::DynamicImage;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, trace, warn};

use super::codec;
use super::disk_store::{DiskStore, MaintenanceReport};
use super::load_states::{CacheEvent, LoadStateRegistry};
use super::memory_store::MemoryStore;
use super::persistent_cache::{CacheStats, PersistentCache};
use super::variant_generator::VariantGenerator;
use crate::domain::entities::{ArtworkEntity, CacheKey, LoadState};
use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::ports::{ArtworkFetchPort, ReachabilityPort};
use crate::infrastructure::config::CacheConfig;

type FetchOutcome = Result<Arc<VariantGenerator>, CacheError>;

/// A fetch shared by every caller that needs the same base image.
struct InFlight {
    rx: watch::Receiver<Option<FetchOutcome>>,
    requested: BTreeSet<u32>,
}

/// Outcome counts of a batch preload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Entities that ended up loaded.
    pub loaded: usize,
    /// Entities whose load failed.
    pub failed: usize,
    /// Entities dropped because the batch exceeded the preload limit.
    pub skipped: usize,
}

enum Join {
    Wait(watch::Receiver<Option<FetchOutcome>>),
    Ready(Arc<VariantGenerator>),
}

struct Shared {
    cache: Arc<PersistentCache>,
    fetcher: Arc<dyn ArtworkFetchPort>,
    reachability: Arc<dyn ReachabilityPort>,
    states: Arc<LoadStateRegistry>,
    generators: Mutex<LruCache<ArtworkEntity, Arc<VariantGenerator>>>,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
    fetch_permits: Semaphore,
    config: CacheConfig,
}

/// Entry point for cover art requests.
///
/// Cloning is cheap; clones share caches, in-flight fetches and load states.
#[derive(Clone)]
pub struct RequestCoordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("cache", &self.shared.cache)
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

impl RequestCoordinator {
    /// Creates a coordinator over an existing cache.
    #[must_use]
    pub fn new(
        cache: Arc<PersistentCache>,
        fetcher: Arc<dyn ArtworkFetchPort>,
        reachability: Arc<dyn ReachabilityPort>,
        config: CacheConfig,
    ) -> Self {
        let tracked = NonZeroUsize::new(config.tracked_entities).unwrap_or(NonZeroUsize::MIN);
        let permits = config.max_concurrent_fetches.max(1);

        Self {
            shared: Arc::new(Shared {
                cache,
                fetcher,
                reachability,
                states: LoadStateRegistry::new(config.notify_batch_interval()),
                generators: Mutex::new(LruCache::new(tracked)),
                in_flight: Mutex::new(HashMap::new()),
                fetch_permits: Semaphore::new(permits),
                config,
            }),
        }
    }

    /// Opens the disk cache described by `config` and builds a coordinator
    /// over it.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be created or read.
    pub async fn open(
        config: CacheConfig,
        fetcher: Arc<dyn ArtworkFetchPort>,
        reachability: Arc<dyn ReachabilityPort>,
    ) -> CacheResult<Self> {
        let dir = config.effective_directory();
        let disk = DiskStore::open(dir.clone(), config.disk_store_config()).await?;
        let memory = MemoryStore::new(config.memory_max_items, config.memory_max_bytes)
            .with_device_scale(config.device_scale);
        let cache = Arc::new(PersistentCache::new(memory, disk, config.encode_policy()));
        info!(path = %dir.display(), "Artwork cache ready");

        Ok(Self::new(cache, fetcher, reachability, config))
    }

    /// Returns the underlying cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<PersistentCache> {
        &self.shared.cache
    }

    /// Returns the configuration in use.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Synchronous memory-only lookup. Never derives or touches disk.
    #[must_use]
    pub fn peek(&self, entity: &ArtworkEntity, size: u32) -> Option<Arc<DynamicImage>> {
        let key = CacheKey::new(entity.clone(), size);
        if let Some(img) = self.shared.cache.peek(&key) {
            return Some(img);
        }
        self.shared
            .generators
            .lock()
            .peek(entity)
            .filter(|generator| generator.has_variant(size))
            .and_then(|generator| generator.get_image(size))
    }

    /// Loads the cover art of `entity` at `size`.
    ///
    /// # Errors
    /// Returns error if the image is not cached and cannot be fetched.
    /// Failures are never cached; the next call retries.
    pub async fn load(&self, entity: &ArtworkEntity, size: u32) -> CacheResult<Arc<DynamicImage>> {
        if size == 0 {
            return Err(CacheError::invalid_request("size must be positive"));
        }
        let key = CacheKey::new(entity.clone(), size);

        if let Some(img) = self.shared.lookup(&key).await {
            self.shared.states.transition(&key, LoadState::Loaded, false);
            return Ok(img);
        }

        if self.shared.states.get(&key).is_loaded() {
            trace!(key = %key, "Cached image was evicted");
            self.shared.states.transition(&key, LoadState::Idle, false);
        }
        self.shared.states.transition(&key, LoadState::Loading, false);
        Arc::clone(&self.shared).fetch_and_derive(&key).await
    }

    /// Drops every cached copy of `key` plus the fetch it derives from, then
    /// loads it again from the network.
    ///
    /// # Errors
    /// Returns error if the fetch fails.
    pub async fn refresh(
        &self,
        entity: &ArtworkEntity,
        size: u32,
    ) -> CacheResult<Arc<DynamicImage>> {
        if size == 0 {
            return Err(CacheError::invalid_request("size must be positive"));
        }
        let key = CacheKey::new(entity.clone(), size);
        let fetch_key = key.with_size(self.shared.config.natural_size_for(size));

        self.shared.generators.lock().pop(entity);
        let dropped = self.shared.cache.forget_entity_in_memory(entity);
        self.shared.cache.remove(&key).await;
        self.shared.cache.remove(&fetch_key).await;

        let stale: Vec<CacheKey> = self
            .shared
            .states
            .keys_where(|k| k.entity() == entity && *k != key);
        debug!(key = %key, dropped, stale = stale.len(), "Refreshing artwork");
        self.shared.states.invalidate(stale);

        self.shared.states.transition(&key, LoadState::Loading, true);
        Arc::clone(&self.shared).fetch_and_derive(&key).await
    }

    /// Loads a batch of entities at `size` concurrently.
    ///
    /// Network access stays under the global fetch cap. Entities past the
    /// configured preload limit are skipped.
    pub async fn preload_batch(&self, entities: &[ArtworkEntity], size: u32) -> BatchReport {
        let limit = self.shared.config.max_batch_preload;
        let (batch, skipped) = if entities.len() > limit {
            (&entities[..limit], entities.len() - limit)
        } else {
            (entities, 0)
        };
        if skipped > 0 {
            debug!(limit, skipped, "Preload batch truncated");
        }

        let results = join_all(batch.iter().map(|entity| self.load(entity, size))).await;
        let loaded = results.iter().filter(|r| r.is_ok()).count();

        BatchReport {
            loaded,
            failed: results.len() - loaded,
            skipped,
        }
    }

    /// Warms the next larger size tier above `current_size` in the background.
    ///
    /// Returns `None` when there is no larger tier or no runtime.
    pub fn prefetch_next_tier(
        &self,
        entity: &ArtworkEntity,
        current_size: u32,
    ) -> Option<JoinHandle<()>> {
        let next = self.shared.config.next_tier_above(current_size)?;
        let handle = tokio::runtime::Handle::try_current().ok()?;

        let generator = self.shared.generators.lock().get(entity).cloned();
        if let Some(generator) = generator
            && generator.can_serve(next)
        {
            trace!(entity = %entity, size = next, "Prefetching next tier from base");
            return generator.preload(next);
        }

        let this = self.clone();
        let entity = entity.clone();
        Some(handle.spawn(async move {
            if let Err(e) = this.load(&entity, next).await {
                debug!(entity = %entity, size = next, error = %e, "Tier prefetch failed");
            }
        }))
    }

    /// Current load state of `entity` at `size`.
    #[must_use]
    pub fn load_state(&self, entity: &ArtworkEntity, size: u32) -> LoadState {
        self.shared.states.get(&CacheKey::new(entity.clone(), size))
    }

    /// Stream of load states for `entity` at `size`, starting with the
    /// current state.
    #[must_use]
    pub fn observe(&self, entity: &ArtworkEntity, size: u32) -> WatchStream<LoadState> {
        self.shared.states.observe(&CacheKey::new(entity.clone(), size))
    }

    /// Subscribes to batched cache events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.states.subscribe()
    }

    /// Clears every cached image and resets all load states.
    ///
    /// Fetches still running finish for their callers but are not cached.
    ///
    /// # Errors
    /// Returns error if the disk tier cannot be cleared.
    pub async fn clear_all(&self) -> CacheResult<()> {
        let result = self.shared.cache.remove_all().await;
        self.shared.generators.lock().clear();
        self.shared.states.reset_all();
        info!("Artwork cache cleared");
        result
    }

    /// Returns cache statistics.
    pub async fn stats(&self) -> CacheStats {
        self.shared.cache.stats().await
    }

    /// Runs a disk maintenance pass now.
    ///
    /// # Errors
    /// Returns error if the disk worker has stopped.
    pub async fn maintain(&self) -> CacheResult<MaintenanceReport> {
        self.shared.cache.maintain().await
    }

    /// Waits for pending disk writes and flushes the index.
    ///
    /// # Errors
    /// Returns error if the disk worker has stopped.
    pub async fn flush(&self) -> CacheResult<()> {
        self.shared.cache.settle().await
    }

    /// Number of network fetches currently outstanding.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.lock().len()
    }
}

impl Shared {
    /// Everything short of the network, in order.
    async fn lookup(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        if let Some(img) = self.cache.image(key).await {
            trace!(key = %key, "Cache hit");
            return Some(img);
        }

        let size = key.size();
        if let Some(generator) = self.generator_serving(key.entity(), size) {
            let img = derive(generator, size).await?;
            self.cache.touch(key);
            return Some(img);
        }

        for source_size in self.config.larger_sources(size) {
            let source_key = key.with_size(source_size);
            if let Some(source) = self.cache.image(&source_key).await {
                debug!(key = %key, source_size, "Deriving from larger cached tier");
                let generator = self.register(key.entity(), source, source_size);
                return derive(generator, size).await;
            }
        }

        None
    }

    fn generator_serving(
        &self,
        entity: &ArtworkEntity,
        size: u32,
    ) -> Option<Arc<VariantGenerator>> {
        self.generators
            .lock()
            .get(entity)
            .filter(|generator| generator.can_serve(size))
            .cloned()
    }

    /// Registers a generator for `base`, keeping an existing one whose base is
    /// larger. Returns the generator now registered.
    ///
    /// Least recently used generators are dropped once the registry exceeds
    /// its entity count or the memory byte budget at the device scale.
    fn register(
        &self,
        entity: &ArtworkEntity,
        base: Arc<DynamicImage>,
        base_size: u32,
    ) -> Arc<VariantGenerator> {
        let mut generators = self.generators.lock();
        if let Some(existing) = generators.get(entity)
            && existing.base_size() > base_size
        {
            return existing.clone();
        }
        let generator = self.build_generator(entity, base, base_size);
        generators.put(entity.clone(), generator.clone());
        trim_generators(&mut generators, self.config.memory_max_bytes);
        generator
    }

    /// Registers a freshly fetched base unless the cache was cleared after
    /// the fetch started. The generator is returned either way.
    fn register_fetched(
        &self,
        generation: u64,
        entity: &ArtworkEntity,
        base: Arc<DynamicImage>,
        base_size: u32,
    ) -> Arc<VariantGenerator> {
        if generation == self.cache.generation() {
            return self.register(entity, base, base_size);
        }
        self.build_generator(entity, base, base_size)
    }

    fn build_generator(
        &self,
        entity: &ArtworkEntity,
        base: Arc<DynamicImage>,
        base_size: u32,
    ) -> Arc<VariantGenerator> {
        Arc::new(VariantGenerator::new(
            entity.clone(),
            base,
            base_size,
            self.config.max_variants_per_entity,
            self.config.device_scale,
            Some(self.cache.clone()),
        ))
    }

    /// Joins or starts the network fetch for `key`, then derives `key` from it.
    async fn fetch_and_derive(self: Arc<Self>, key: &CacheKey) -> CacheResult<Arc<DynamicImage>> {
        let size = key.size();
        let fetch_key = key.with_size(self.config.natural_size_for(size));

        let join = {
            let mut in_flight = self.in_flight.lock();
            if let Some(entry) = in_flight.get_mut(&fetch_key) {
                trace!(key = %key, fetch_key = %fetch_key, "Joining in-flight fetch");
                entry.requested.insert(size);
                Join::Wait(entry.rx.clone())
            } else if let Some(generator) = self.generator_serving(key.entity(), size) {
                // A fetch finished between the cache lookup and here.
                Join::Ready(generator)
            } else {
                let (tx, rx) = watch::channel(None);
                in_flight.insert(
                    fetch_key.clone(),
                    InFlight {
                        rx: rx.clone(),
                        requested: BTreeSet::from([size]),
                    },
                );
                tokio::spawn(Arc::clone(&self).run_fetch(fetch_key, tx));
                Join::Wait(rx)
            }
        };

        let generator = match join {
            Join::Ready(generator) => {
                let result = derive(generator, size)
                    .await
                    .ok_or_else(|| CacheError::not_found(key.canonical()));
                self.settle(key, result.as_ref().map(|_| ()));
                return result;
            }
            Join::Wait(mut rx) => {
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => (*outcome).clone(),
                    Err(_) => None,
                };
                outcome
                    .unwrap_or_else(|| Err(CacheError::network("artwork fetch was aborted")))?
            }
        };

        derive(generator, size)
            .await
            .ok_or_else(|| CacheError::not_found(key.canonical()))
    }

    /// Runs one shared fetch to completion, independent of its callers.
    async fn run_fetch(
        self: Arc<Self>,
        fetch_key: CacheKey,
        tx: watch::Sender<Option<FetchOutcome>>,
    ) {
        let outcome = self.fetch_base(&fetch_key).await;

        let requested = self
            .in_flight
            .lock()
            .remove(&fetch_key)
            .map(|entry| entry.requested)
            .unwrap_or_default();

        for size in requested {
            let key = fetch_key.with_size(size);
            match &outcome {
                Ok(generator) => {
                    let missing = CacheError::not_found(key.canonical());
                    let derived = derive(generator.clone(), size).await;
                    self.settle(&key, derived.map(|_| ()).ok_or(&missing));
                }
                Err(e) => self.settle(&key, Err(e)),
            }
        }

        let _ = tx.send(Some(outcome));
    }

    async fn fetch_base(&self, fetch_key: &CacheKey) -> FetchOutcome {
        let entity = fetch_key.entity();
        let size = fetch_key.size();
        let generation = self.cache.generation();

        if let Some(img) = self.cache.image(fetch_key).await {
            return Ok(self.register(entity, img, size));
        }

        if !self.reachability.is_reachable() {
            debug!(key = %fetch_key, "Offline, skipping fetch");
            return Err(CacheError::Offline);
        }

        let bytes = {
            let _permit = self
                .fetch_permits
                .acquire()
                .await
                .map_err(|_| CacheError::network("fetch queue closed"))?;
            debug!(key = %fetch_key, "Downloading artwork");
            self.fetcher.fetch_image(entity, size).await?
        };

        let to_decode = bytes.clone();
        let decoded = tokio::task::spawn_blocking(move || codec::decode(&to_decode))
            .await
            .map_err(|e| CacheError::decode(format!("Decode task panicked: {e}")))??;

        let img = Arc::new(decoded);
        self.cache
            .store_encoded_in(generation, fetch_key.clone(), img.clone(), bytes);
        Ok(self.register_fetched(generation, entity, img, size))
    }

    fn settle(&self, key: &CacheKey, result: Result<(), &CacheError>) {
        match result {
            Ok(()) => {
                self.states.transition(key, LoadState::Loaded, false);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Artwork load failed");
                self.states
                    .transition(key, LoadState::Error(e.to_string()), false);
            }
        }
    }
}

/// Pops least recently used generators while more than one is held and
/// their combined footprint is over `budget`.
fn trim_generators(
    generators: &mut LruCache<ArtworkEntity, Arc<VariantGenerator>>,
    budget: u64,
) {
    let mut footprint: u64 = generators.iter().map(|(_, g)| g.memory_footprint()).sum();
    while generators.len() > 1 && footprint > budget {
        let Some((entity, generator)) = generators.pop_lru() else {
            break;
        };
        footprint = footprint.saturating_sub(generator.memory_footprint());
        trace!(entity = %entity, footprint, "Dropped variant generator over memory budget");
    }
}

/// Gets `size` from `generator`, deriving off the async threads on a miss.
async fn derive(generator: Arc<VariantGenerator>, size: u32) -> Option<Arc<DynamicImage>> {
    if generator.has_variant(size) {
        return generator.get_image(size);
    }
    tokio::task::spawn_blocking(move || generator.get_image(size))
        .await
        .ok()
        .flatten()
}
