//! Cache keys for cover artwork.

use std::fmt;

use sha2::{Digest, Sha256};

/// The entity an artwork belongs to.
///
/// Albums and artists live in separate key namespaces; apart from the key
/// prefix, the only difference is the id the media server expects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtworkEntity {
    /// Album cover art.
    Album(String),
    /// Artist image.
    Artist(String),
}

impl ArtworkEntity {
    /// Creates an album entity.
    #[must_use]
    pub fn album(id: impl Into<String>) -> Self {
        Self::Album(id.into())
    }

    /// Creates an artist entity.
    #[must_use]
    pub fn artist(id: impl Into<String>) -> Self {
        Self::Artist(id.into())
    }

    /// Key namespace prefix.
    #[must_use]
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Album(_) => "album",
            Self::Artist(_) => "artist",
        }
    }

    /// Returns the raw entity id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Album(id) | Self::Artist(id) => id,
        }
    }

    /// Returns the cover art id understood by the media server.
    #[must_use]
    pub fn cover_art_id(&self) -> String {
        match self {
            Self::Album(id) => format!("al-{id}"),
            Self::Artist(id) => format!("ar-{id}"),
        }
    }
}

impl fmt::Display for ArtworkEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.prefix(), self.id())
    }
}

/// Identifies one rendition of one entity's artwork.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    entity: ArtworkEntity,
    size: u32,
}

impl CacheKey {
    /// Creates a key for `entity` at `size` pixels (longest edge).
    #[must_use]
    pub const fn new(entity: ArtworkEntity, size: u32) -> Self {
        Self { entity, size }
    }

    /// Returns the entity.
    #[must_use]
    pub const fn entity(&self) -> &ArtworkEntity {
        &self.entity
    }

    /// Returns the requested size in pixels.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Returns the same entity at a different size.
    #[must_use]
    pub fn with_size(&self, size: u32) -> Self {
        Self::new(self.entity.clone(), size)
    }

    /// Canonical `type_id_size` string used in the metadata index.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Filesystem-safe blob filename derived from a hash of the canonical key.
    #[must_use]
    pub fn blob_filename(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        let digest = hasher.finalize();
        format!("{}.img", hex::encode(&digest[..16]))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.entity, self.size)
    }
}
