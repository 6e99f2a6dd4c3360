//! Domain entity definitions.

mod cache_entry;
mod cover_key;
mod load_state;

pub use cache_entry::CacheEntry;
pub use cover_key::{ArtworkEntity, CacheKey};
pub use load_state::LoadState;
