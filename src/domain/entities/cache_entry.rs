//! Metadata index records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CacheKey;

/// One blob on disk, as recorded in the metadata index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Canonical cache key.
    pub key: String,
    /// Blob filename relative to the cache directory.
    pub blob_filename: String,
    /// When the blob was first written.
    pub created_at: DateTime<Utc>,
    /// Blob size in bytes.
    pub size_bytes: u64,
    /// Last time the entry was read or written.
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Creates a fresh entry for `key`.
    #[must_use]
    pub fn new(key: &CacheKey, size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            key: key.canonical(),
            blob_filename: key.blob_filename(),
            created_at: now,
            size_bytes,
            last_accessed_at: now,
        }
    }

    /// Marks the entry as accessed now.
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    /// Returns true if the entry was created before `cutoff`.
    #[must_use]
    pub fn is_older_than(&self, cutoff: DateTime<Utc>) -> bool {
        self.created_at < cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::ArtworkEntity;

    #[test]
    fn test_new_entry_uses_key_filename() {
        let key = CacheKey::new(ArtworkEntity::album("1"), 80);
        let entry = CacheEntry::new(&key, 1234);

        assert_eq!(entry.key, "album_1_80");
        assert_eq!(entry.blob_filename, key.blob_filename());
        assert_eq!(entry.created_at, entry.last_accessed_at);
    }

    #[test]
    fn test_touch_advances_access_time() {
        let key = CacheKey::new(ArtworkEntity::album("1"), 80);
        let mut entry = CacheEntry::new(&key, 1);
        let before = entry.last_accessed_at;

        std::thread::sleep(std::time::Duration::from_millis(2));
        entry.touch();

        assert!(entry.last_accessed_at > before);
        assert_eq!(entry.created_at, before);
    }

    #[test]
    fn test_entry_serde_round_trip() {
        let key = CacheKey::new(ArtworkEntity::artist("x"), 300);
        let entry = CacheEntry::new(&key, 99);

        let json = serde_json::to_string(&entry).unwrap();
        let parsed: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }
}
