//! Port definition for fetching artwork from the media server.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::entities::ArtworkEntity;
use crate::domain::errors::CacheResult;

/// Port for downloading encoded artwork.
/// Implementations must be thread-safe.
#[async_trait]
pub trait ArtworkFetchPort: Send + Sync {
    /// Fetches the encoded image for `entity`, scaled server-side to `size`.
    async fn fetch_image(&self, entity: &ArtworkEntity, size: u32) -> CacheResult<Bytes>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::domain::errors::CacheError;

    /// Fetch stub that renders a solid PNG and counts calls.
    pub struct MockArtworkFetcher {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
        requests: Mutex<Vec<(ArtworkEntity, u32)>>,
        max_edge: Option<u32>,
    }

    impl MockArtworkFetcher {
        /// Creates a fetcher that answers immediately.
        pub fn new() -> Self {
            Self::with_delay(Duration::ZERO)
        }

        /// Creates a fetcher that sleeps before answering.
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay,
                requests: Mutex::new(Vec::new()),
                max_edge: None,
            }
        }

        /// Caps the served image edge, like a server with small originals.
        pub fn with_max_edge(mut self, max_edge: u32) -> Self {
            self.max_edge = Some(max_edge);
            self
        }

        /// Makes subsequent fetches fail with a network error.
        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        /// Number of fetches issued.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Highest number of fetches observed running at once.
        pub fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }

        /// Sizes requested so far, in order.
        pub fn requested_sizes(&self) -> Vec<u32> {
            self.requests.lock().iter().map(|(_, size)| *size).collect()
        }
    }

    impl Default for MockArtworkFetcher {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Encodes a solid square PNG of `edge` pixels.
    pub fn solid_png(edge: u32) -> Bytes {
        let img = image::RgbImage::from_pixel(edge, edge, image::Rgb([200, 40, 90]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    #[async_trait]
    impl ArtworkFetchPort for MockArtworkFetcher {
        async fn fetch_image(&self, entity: &ArtworkEntity, size: u32) -> CacheResult<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push((entity.clone(), size));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(CacheError::network("connection reset"));
            }

            let edge = self.max_edge.map_or(size, |max| size.min(max));
            Ok(solid_png(edge))
        }
    }
}
