//! Metadata index for the disk store.
//!
//! The index is a single JSON document mapping canonical keys to
//! [`CacheEntry`] records. It is small (thousands of entries) and rewritten
//! wholesale on mutation.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::entities::CacheEntry;
use crate::domain::errors::{CacheError, CacheResult};

/// Name of the index file inside the cache directory.
pub const INDEX_FILE_NAME: &str = "index.json";

const INDEX_VERSION: u32 = 1;

/// Key -> entry map plus a running byte total.
#[derive(Debug, Serialize, Deserialize)]
pub struct DiskIndex {
    version: u32,
    entries: HashMap<String, CacheEntry>,
    #[serde(skip)]
    total_bytes: u64,
}

impl Default for DiskIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: HashMap::new(),
            total_bytes: 0,
        }
    }
}

impl DiskIndex {
    /// Reads the index at `path`.
    ///
    /// A missing, unreadable or incompatible file yields an empty index; the
    /// next maintenance pass removes blobs it no longer references.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read cache index, starting cold");
                return Self::default();
            }
        };

        match serde_json::from_slice::<Self>(&content) {
            Ok(mut index) if index.version == INDEX_VERSION => {
                index.total_bytes = index.entries.values().map(|e| e.size_bytes).sum();
                debug!(
                    entries = index.entries.len(),
                    total_bytes = index.total_bytes,
                    "Loaded cache index"
                );
                index
            }
            Ok(index) => {
                warn!(
                    found = index.version,
                    expected = INDEX_VERSION,
                    "Cache index version mismatch, starting cold"
                );
                Self::default()
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse cache index, starting cold");
                Self::default()
            }
        }
    }

    /// Serializes the index.
    ///
    /// # Errors
    /// Returns [`CacheError::DiskIo`] if serialization fails.
    pub fn to_json(&self) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CacheError::disk_io(format!("serialize index: {e}")))
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Marks an entry accessed and returns it.
    pub fn touch(&mut self, key: &str) -> Option<&CacheEntry> {
        let entry = self.entries.get_mut(key)?;
        entry.touch();
        Some(entry)
    }

    /// Inserts or replaces an entry, returning the previous one.
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.total_bytes += entry.size_bytes;
        let old = self.entries.insert(entry.key.clone(), entry);
        if let Some(old) = &old {
            self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        }
        old
    }

    /// Removes an entry.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let old = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        Some(old)
    }

    /// Removes all entries, returning them.
    pub fn drain(&mut self) -> Vec<CacheEntry> {
        self.total_bytes = 0;
        self.entries.drain().map(|(_, e)| e).collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all entry sizes.
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Iterates over entries in arbitrary order.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Blob filenames referenced by the index.
    #[must_use]
    pub fn referenced_blobs(&self) -> HashSet<String> {
        self.entries
            .values()
            .map(|e| e.blob_filename.clone())
            .collect()
    }

    /// Keys of entries created before `cutoff`.
    #[must_use]
    pub fn expired(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.is_older_than(cutoff))
            .map(|e| e.key.clone())
            .collect()
    }

    /// Signals when the total size is above `max_bytes`.
    ///
    /// # Errors
    /// Returns [`CacheError::CapacityExceeded`] when over budget.
    pub const fn check_capacity(&self, max_bytes: u64) -> CacheResult<()> {
        if self.total_bytes > max_bytes {
            Err(CacheError::CapacityExceeded {
                total_bytes: self.total_bytes,
                max_bytes,
            })
        } else {
            Ok(())
        }
    }

    /// Least recently accessed keys whose removal brings the total to
    /// `target_bytes` or below.
    #[must_use]
    pub fn lru_victims(&self, target_bytes: u64) -> Vec<String> {
        if self.total_bytes <= target_bytes {
            return Vec::new();
        }

        let mut by_access: Vec<&CacheEntry> = self.entries.values().collect();
        by_access.sort_by_key(|e| (e.last_accessed_at, e.created_at));

        let mut remaining = self.total_bytes;
        let mut victims = Vec::new();
        for entry in by_access {
            if remaining <= target_bytes {
                break;
            }
            remaining = remaining.saturating_sub(entry.size_bytes);
            victims.push(entry.key.clone());
        }
        victims
    }
}
