//! Disk-based artwork store with a crash-safe metadata index.
//!
//! One worker task owns the [`DiskIndex`]; every mutation, including the
//! periodic maintenance pass, goes through its command channel. Blob encoding
//! and writes happen on the blocking pool before the metadata is committed,
//! and removals drop metadata before deleting the file.
//!
//! Every clear bumps a generation counter. Writes carry the generation they
//! were issued in, and the worker drops commits from an earlier one.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use image::DynamicImage;
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::codec::{self, Quality};
use super::disk_index::{DiskIndex, INDEX_FILE_NAME};
use crate::domain::entities::{CacheEntry, CacheKey};
use crate::domain::errors::{CacheError, CacheResult};

/// Maximum disk cache size in bytes (200 MB default).
pub const DEFAULT_MAX_DISK_BYTES: u64 = 200 * 1024 * 1024;

/// Entries older than this are expired (30 days).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Size-pressure eviction stops at this share of the maximum.
const EVICTION_TARGET_PERCENT: u64 = 80;

/// Tuning for [`DiskStore`].
#[derive(Debug, Clone)]
pub struct DiskStoreConfig {
    /// Upper bound on the sum of blob sizes.
    pub max_bytes: u64,
    /// Age after which entries are expired.
    pub max_age: Duration,
    /// Interval between maintenance passes.
    pub maintenance_interval: Duration,
    /// Debounce for persisting access-time updates.
    pub flush_interval: Duration,
    /// Unreferenced files younger than this are left alone by the sweep.
    pub orphan_grace: Duration,
}

impl Default for DiskStoreConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_DISK_BYTES,
            max_age: DEFAULT_MAX_AGE,
            maintenance_interval: Duration::from_secs(60 * 60),
            flush_interval: Duration::from_secs(5),
            orphan_grace: Duration::from_secs(60),
        }
    }
}

/// Entry count and byte total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskStats {
    /// Number of indexed blobs.
    pub count: usize,
    /// Sum of indexed blob sizes.
    pub total_bytes: u64,
}

impl std::fmt::Display for DiskStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Disk: {} images, {} bytes", self.count, self.total_bytes)
    }
}

/// What a maintenance pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Entries removed for age.
    pub expired: usize,
    /// Entries removed for size pressure.
    pub evicted: usize,
    /// Files deleted because no entry referenced them.
    pub orphans_removed: usize,
    /// Entries dropped because their blob was missing.
    pub dangling_dropped: usize,
    /// Bytes released by expiry and eviction.
    pub bytes_freed: u64,
}

impl MaintenanceReport {
    /// Returns true if the pass changed nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.expired == 0
            && self.evicted == 0
            && self.orphans_removed == 0
            && self.dangling_dropped == 0
    }
}

#[derive(Debug)]
enum DiskCommand {
    Lookup {
        key: String,
        reply: oneshot::Sender<Option<PathBuf>>,
    },
    Contains {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Touch {
        key: String,
    },
    Commit {
        entry: CacheEntry,
        generation: u64,
        reply: oneshot::Sender<()>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    DropDangling {
        key: String,
    },
    Clear {
        reply: oneshot::Sender<CacheResult<()>>,
    },
    Stats {
        reply: oneshot::Sender<DiskStats>,
    },
    Maintain {
        reply: oneshot::Sender<MaintenanceReport>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the disk store. Cheap to clone; the worker stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct DiskStore {
    dir: Arc<PathBuf>,
    generation: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<DiskCommand>,
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl DiskStore {
    /// Opens (or creates) a store in `dir`, runs the startup maintenance
    /// pass, then starts the worker.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be created.
    pub async fn open(dir: PathBuf, config: DiskStoreConfig) -> CacheResult<Self> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::disk_io(format!("Failed to create cache dir: {e}")))?;

        let index_path = dir.join(INDEX_FILE_NAME);
        let index = tokio::task::spawn_blocking(move || DiskIndex::load(&index_path))
            .await
            .map_err(|e| CacheError::disk_io(format!("Index load task failed: {e}")))?;

        let generation = Arc::new(AtomicU64::new(0));
        let mut worker = DiskWorker {
            dir: dir.clone(),
            index,
            config,
            generation: Arc::clone(&generation),
            dirty: false,
        };
        let report = worker.maintain().await;
        info!(
            dir = %dir.display(),
            entries = worker.index.len(),
            total_bytes = worker.index.total_bytes(),
            expired = report.expired,
            evicted = report.evicted,
            orphans = report.orphans_removed,
            dangling = report.dangling_dropped,
            "Opened disk cache"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker.run(rx));

        Ok(Self {
            dir: Arc::new(dir),
            generation,
            tx,
        })
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current clear generation. Writes issued under an older generation
    /// are discarded.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DiskCommand,
    ) -> CacheResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| CacheError::disk_io("disk cache worker stopped"))?;
        rx.await
            .map_err(|_| CacheError::disk_io("disk cache worker dropped the request"))
    }

    /// Encodes `image` and stores it under `key`.
    ///
    /// # Errors
    /// Returns error if encoding or writing fails.
    pub async fn put(
        &self,
        key: &CacheKey,
        image: Arc<DynamicImage>,
        quality: Quality,
    ) -> CacheResult<()> {
        self.put_in(self.generation(), key, image, quality).await
    }

    /// Like [`DiskStore::put`], for a write issued in `generation`.
    ///
    /// # Errors
    /// Returns error if encoding or writing fails.
    pub async fn put_in(
        &self,
        generation: u64,
        key: &CacheKey,
        image: Arc<DynamicImage>,
        quality: Quality,
    ) -> CacheResult<()> {
        if generation != self.generation() {
            trace!(key = %key, "Skipping write issued before a clear");
            return Ok(());
        }
        let bytes = tokio::task::spawn_blocking(move || codec::encode(&image, quality))
            .await
            .map_err(|e| CacheError::disk_io(format!("Encode task failed: {e}")))??;
        self.put_encoded_in(generation, key, bytes).await
    }

    /// Stores already-encoded bytes under `key`.
    ///
    /// The blob is written to a temp file and renamed into place before the
    /// metadata entry is committed.
    ///
    /// # Errors
    /// Returns error if the blob cannot be written.
    pub async fn put_encoded(&self, key: &CacheKey, bytes: Bytes) -> CacheResult<()> {
        self.put_encoded_in(self.generation(), key, bytes).await
    }

    /// Like [`DiskStore::put_encoded`], for a write issued in `generation`.
    ///
    /// # Errors
    /// Returns error if the blob cannot be written.
    pub async fn put_encoded_in(
        &self,
        generation: u64,
        key: &CacheKey,
        bytes: Bytes,
    ) -> CacheResult<()> {
        if generation != self.generation() {
            trace!(key = %key, "Skipping write issued before a clear");
            return Ok(());
        }
        let dir = self.dir.as_ref().clone();
        let path = dir.join(key.blob_filename());
        let len = bytes.len() as u64;

        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &bytes))
            .await
            .map_err(|e| CacheError::disk_io(format!("Write task failed: {e}")))??;

        let entry = CacheEntry::new(key, len);
        self.request(|reply| DiskCommand::Commit {
            entry,
            generation,
            reply,
        })
        .await?;
        debug!(key = %key, size = len, "Stored image in disk cache");
        Ok(())
    }

    /// Reads the blob for `key`, refreshing its access time.
    ///
    /// I/O failures are logged and reported as a miss. A missing blob drops
    /// its metadata entry.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let canonical = key.canonical();
        let path = match self
            .request(|reply| DiskCommand::Lookup {
                key: canonical.clone(),
                reply,
            })
            .await
        {
            Ok(Some(path)) => path,
            Ok(None) => {
                trace!(key = %key, "Disk cache miss");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Disk cache lookup failed");
                return None;
            }
        };

        match fs::read(&path).await {
            Ok(bytes) => {
                trace!(key = %key, path = %path.display(), "Disk cache hit");
                Some(Bytes::from(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key = %key, "Blob missing for indexed entry, dropping metadata");
                let _ = self.tx.send(DiskCommand::DropDangling { key: canonical });
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cached blob");
                None
            }
        }
    }

    /// Refreshes the access time of `key` without waiting. Unknown keys are
    /// ignored.
    pub fn touch(&self, key: &CacheKey) {
        let _ = self.tx.send(DiskCommand::Touch {
            key: key.canonical(),
        });
    }

    /// Checks whether `key` is indexed.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.request(|reply| DiskCommand::Contains {
            key: key.canonical(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Removes an entry and its blob.
    pub async fn remove(&self, key: &CacheKey) -> bool {
        match self
            .request(|reply| DiskCommand::Remove {
                key: key.canonical(),
                reply,
            })
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to remove from disk cache");
                false
            }
        }
    }

    /// Removes every entry and file.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be read.
    pub async fn clear(&self) -> CacheResult<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.request(|reply| DiskCommand::Clear { reply }).await?
    }

    /// Returns entry count and total bytes.
    pub async fn stats(&self) -> DiskStats {
        self.request(|reply| DiskCommand::Stats { reply })
            .await
            .unwrap_or_default()
    }

    /// Runs a maintenance pass now.
    ///
    /// # Errors
    /// Returns error if the worker has stopped.
    pub async fn maintain(&self) -> CacheResult<MaintenanceReport> {
        self.request(|reply| DiskCommand::Maintain { reply }).await
    }

    /// Persists pending access-time updates.
    ///
    /// # Errors
    /// Returns error if the worker has stopped.
    pub async fn flush(&self) -> CacheResult<()> {
        self.request(|reply| DiskCommand::Flush { reply }).await
    }
}

/// Owner of the index; runs on its own task.
struct DiskWorker {
    dir: PathBuf,
    index: DiskIndex,
    config: DiskStoreConfig,
    generation: Arc<AtomicU64>,
    dirty: bool,
}

impl DiskWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DiskCommand>) {
        let period = self.config.maintenance_interval.max(Duration::from_secs(1));
        let mut maintenance = time::interval_at(Instant::now() + period, period);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let flush_period = self.config.flush_interval.max(Duration::from_millis(10));
        let mut flush = time::interval(flush_period);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => break,
                    }
                }
                _ = maintenance.tick() => {
                    let report = self.maintain().await;
                    if report.is_empty() {
                        debug!("Disk cache maintenance: nothing to do");
                    } else {
                        info!(
                            expired = report.expired,
                            evicted = report.evicted,
                            orphans = report.orphans_removed,
                            dangling = report.dangling_dropped,
                            bytes_freed = report.bytes_freed,
                            "Disk cache maintenance complete"
                        );
                    }
                }
                _ = flush.tick(), if self.dirty => {
                    self.save_index().await;
                }
            }
        }

        if self.dirty {
            self.save_index().await;
        }
        debug!("Disk cache worker stopped");
    }

    async fn handle(&mut self, cmd: DiskCommand) {
        match cmd {
            DiskCommand::Lookup { key, reply } => {
                let path = self.index.touch(&key).map(|e| self.dir.join(&e.blob_filename));
                if path.is_some() {
                    self.dirty = true;
                }
                let _ = reply.send(path);
            }
            DiskCommand::Touch { key } => {
                if self.index.touch(&key).is_some() {
                    self.dirty = true;
                }
            }
            DiskCommand::Contains { key, reply } => {
                let _ = reply.send(self.index.get(&key).is_some());
            }
            DiskCommand::Commit {
                entry,
                generation,
                reply,
            } => {
                if generation != self.generation.load(Ordering::SeqCst) {
                    debug!(key = %entry.key, "Dropping write issued before a clear");
                    // A newer write of the same key owns the blob.
                    if self.index.get(&entry.key).is_none() {
                        self.remove_blob(&entry.blob_filename).await;
                    }
                    let _ = reply.send(());
                    return;
                }
                self.index.insert(entry);
                if let Err(CacheError::CapacityExceeded {
                    total_bytes,
                    max_bytes,
                }) = self.index.check_capacity(self.config.max_bytes)
                {
                    debug!(total_bytes, max_bytes, "Disk cache over limit, evicting");
                    self.evict_lru().await;
                }
                self.save_index().await;
                let _ = reply.send(());
            }
            DiskCommand::Remove { key, reply } => {
                let removed = match self.index.remove(&key) {
                    Some(entry) => {
                        self.save_index().await;
                        self.remove_blob(&entry.blob_filename).await;
                        debug!(key = %key, "Evicted from disk cache");
                        true
                    }
                    None => false,
                };
                let _ = reply.send(removed);
            }
            DiskCommand::DropDangling { key } => {
                let blob_present = match self.index.get(&key) {
                    Some(entry) => fs::try_exists(self.dir.join(&entry.blob_filename))
                        .await
                        .unwrap_or(false),
                    None => return,
                };
                if !blob_present {
                    self.index.remove(&key);
                    self.save_index().await;
                }
            }
            DiskCommand::Clear { reply } => {
                let _ = reply.send(self.clear().await);
            }
            DiskCommand::Stats { reply } => {
                let _ = reply.send(DiskStats {
                    count: self.index.len(),
                    total_bytes: self.index.total_bytes(),
                });
            }
            DiskCommand::Maintain { reply } => {
                let report = self.maintain().await;
                let _ = reply.send(report);
            }
            DiskCommand::Flush { reply } => {
                if self.dirty {
                    self.save_index().await;
                }
                let _ = reply.send(());
            }
        }
    }

    /// Evicts least recently accessed entries down to the target share of
    /// the maximum. Returns (count, bytes).
    async fn evict_lru(&mut self) -> (usize, u64) {
        let target = self.config.max_bytes / 100 * EVICTION_TARGET_PERCENT;
        let victims = self.index.lru_victims(target);

        let removed: Vec<CacheEntry> = victims
            .iter()
            .filter_map(|key| self.index.remove(key))
            .collect();
        if removed.is_empty() {
            return (0, 0);
        }
        self.dirty = true;
        self.save_index().await;

        let mut freed_bytes = 0u64;
        let freed_count = removed.len();
        for entry in removed {
            self.remove_blob(&entry.blob_filename).await;
            freed_bytes += entry.size_bytes;
            trace!(key = %entry.key, "Evicted for size pressure");
        }
        debug!(
            freed_size = freed_bytes,
            freed_count = freed_count,
            total_bytes = self.index.total_bytes(),
            "Disk cache eviction complete"
        );
        (freed_count, freed_bytes)
    }

    async fn maintain(&mut self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        // Age expiry.
        let cutoff = chrono::TimeDelta::from_std(self.config.max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            let expired: Vec<CacheEntry> = self
                .index
                .expired(cutoff)
                .iter()
                .filter_map(|key| self.index.remove(key))
                .collect();
            if !expired.is_empty() {
                self.dirty = true;
                self.save_index().await;
            }
            for entry in expired {
                self.remove_blob(&entry.blob_filename).await;
                report.expired += 1;
                report.bytes_freed += entry.size_bytes;
            }
        }

        // Metadata whose blob has gone missing.
        let mut dangling = Vec::new();
        for entry in self.index.entries() {
            let present = fs::try_exists(self.dir.join(&entry.blob_filename))
                .await
                .unwrap_or(false);
            if !present {
                dangling.push(entry.key.clone());
            }
        }
        for key in dangling {
            self.index.remove(&key);
            report.dangling_dropped += 1;
        }

        // Files nothing references.
        report.orphans_removed = self.sweep_orphans().await;

        // Size pressure.
        if self.index.check_capacity(self.config.max_bytes).is_err() {
            let (count, bytes) = self.evict_lru().await;
            report.evicted = count;
            report.bytes_freed += bytes;
        }

        if report.dangling_dropped > 0 {
            self.dirty = true;
        }
        if self.dirty {
            self.save_index().await;
        }
        report
    }

    async fn sweep_orphans(&self) -> usize {
        let referenced = self.index.referenced_blobs();
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            warn!(dir = %self.dir.display(), "Failed to read cache dir for orphan sweep");
            return 0;
        };

        let mut removed = 0usize;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == INDEX_FILE_NAME || referenced.contains(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or(Duration::MAX);
            if age < self.config.orphan_grace {
                continue;
            }

            let path = entry.path();
            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove orphaned file");
            } else {
                trace!(path = %path.display(), "Removed orphaned file");
                removed += 1;
            }
        }
        removed
    }

    async fn clear(&mut self) -> CacheResult<()> {
        let count = self.index.drain().len();
        self.save_index().await;

        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| CacheError::disk_io(format!("Failed to read cache dir: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::disk_io(format!("Failed to read entry: {e}")))?
        {
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            if entry.file_name() == INDEX_FILE_NAME || is_dir {
                continue;
            }
            let path = entry.path();
            if fs::remove_file(&path).await.is_err() {
                warn!(path = %path.display(), "Failed to remove cache file");
            }
        }
        info!(entries = count, "Cleared disk cache");
        Ok(())
    }

    async fn remove_blob(&self, filename: &str) {
        let path = self.dir.join(filename);
        if let Err(e) = fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "Failed to remove blob");
        }
    }

    async fn save_index(&mut self) {
        let json = match self.index.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize cache index");
                return;
            }
        };
        let dir = self.dir.clone();
        let path = dir.join(INDEX_FILE_NAME);
        match tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &json)).await {
            Ok(Ok(())) => self.dirty = false,
            Ok(Err(e)) => warn!(error = %e, "Failed to write cache index"),
            Err(e) => warn!(error = %e, "Index write task failed"),
        }
    }
}

/// Writes `data` to a temp file in `dir` and renames it over `path`.
fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> CacheResult<()> {
    let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
    temp_file.write_all(data)?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
