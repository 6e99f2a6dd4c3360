#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::StreamExt;
    use futures_util::future::join_all;
    use image::GenericImageView;
    use tempfile::TempDir;

    use crate::domain::entities::{ArtworkEntity, CacheKey, LoadState};
    use crate::domain::errors::CacheError;
    use crate::domain::ports::mocks::{MockArtworkFetcher, MockReachabilityPort};
    use crate::domain::ports::{AlwaysReachable, ReachabilityPort};
    use crate::infrastructure::config::CacheConfig;
    use crate::infrastructure::image::coordinator::RequestCoordinator;
    use crate::infrastructure::image::load_states::CacheEvent;
    use crate::infrastructure::network_monitor::NetworkMonitor;

    fn config(temp: &TempDir) -> CacheConfig {
        CacheConfig {
            directory: Some(temp.path().to_path_buf()),
            notify_batch_ms: 20,
            ..CacheConfig::default()
        }
    }

    async fn coordinator_with(
        temp: &TempDir,
        fetcher: Arc<MockArtworkFetcher>,
        reachability: Arc<dyn ReachabilityPort>,
    ) -> RequestCoordinator {
        RequestCoordinator::open(config(temp), fetcher, reachability)
            .await
            .unwrap()
    }

    async fn coordinator(temp: &TempDir, fetcher: Arc<MockArtworkFetcher>) -> RequestCoordinator {
        coordinator_with(temp, fetcher, Arc::new(AlwaysReachable)).await
    }

    #[tokio::test]
    async fn test_small_request_fetches_natural_size_then_derives() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("1");

        let small = coordinator.load(&album, 150).await.unwrap();
        assert_eq!(small.dimensions(), (150, 150));
        assert_eq!(fetcher.requested_sizes(), vec![500]);

        let medium = coordinator.load(&album, 300).await.unwrap();
        assert_eq!(medium.dimensions(), (300, 300));
        let thumb = coordinator.load(&album, 80).await.unwrap();
        assert_eq!(thumb.dimensions(), (80, 80));

        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_share_one_fetch() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::with_delay(Duration::from_millis(50)));
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("7");

        let results = join_all((0..5).map(|_| coordinator.load(&album, 80))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_different_small_sizes_share_one_fetch() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::with_delay(Duration::from_millis(50)));
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("7");

        let results = join_all([80, 150, 300].map(|size| coordinator.load(&album, size))).await;

        let widths: Vec<u32> = results.into_iter().map(|r| r.unwrap().width()).collect();
        assert_eq!(widths, vec![80, 150, 300]);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_concurrency_is_capped() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::with_delay(Duration::from_millis(30)));
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let albums: Vec<ArtworkEntity> = (0..10).map(|i| ArtworkEntity::album(i.to_string())).collect();

        let report = coordinator.preload_batch(&albums, 150).await;

        assert_eq!(report.loaded, 10);
        assert_eq!(report.failed, 0);
        assert_eq!(fetcher.calls(), 10);
        assert!(fetcher.peak_in_flight() <= 3);
    }

    #[tokio::test]
    async fn test_batch_preload_is_bounded() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let config = CacheConfig {
            max_batch_preload: 4,
            ..config(&temp)
        };
        let coordinator = RequestCoordinator::open(config, fetcher.clone(), Arc::new(AlwaysReachable))
            .await
            .unwrap();
        let albums: Vec<ArtworkEntity> = (0..6).map(|i| ArtworkEntity::album(i.to_string())).collect();

        let report = coordinator.preload_batch(&albums, 80).await;

        assert_eq!(report.loaded, 4);
        assert_eq!(report.skipped, 2);
        assert_eq!(fetcher.calls(), 4);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("3");

        fetcher.set_failing(true);
        let err = coordinator.load(&album, 150).await.unwrap_err();
        assert!(err.is_network_error());
        assert!(coordinator.load_state(&album, 150).is_error());
        assert_eq!(coordinator.stats().await.disk.count, 0);
        assert!(coordinator.peek(&album, 150).is_none());

        fetcher.set_failing(false);
        coordinator.load(&album, 150).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(coordinator.load_state(&album, 150), LoadState::Loaded);
    }

    #[tokio::test]
    async fn test_offline_miss_does_not_fetch() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let mut reachability = MockReachabilityPort::new();
        reachability.expect_is_reachable().return_const(false);
        let coordinator = coordinator_with(&temp, fetcher.clone(), Arc::new(reachability)).await;
        let album = ArtworkEntity::album("5");

        let err = coordinator.load(&album, 150).await.unwrap_err();

        assert_eq!(err, CacheError::Offline);
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(
            coordinator.load_state(&album, 150),
            LoadState::Error(CacheError::Offline.to_string())
        );
    }

    #[tokio::test]
    async fn test_offline_still_serves_cached_sources() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let monitor = NetworkMonitor::new(true);
        let coordinator = coordinator_with(&temp, fetcher.clone(), monitor.clone()).await;
        let album = ArtworkEntity::album("5");
        coordinator.load(&album, 150).await.unwrap();

        monitor.set_reachable(false);
        let img = coordinator.load(&album, 200).await.unwrap();

        assert_eq!(img.width(), 200);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_larger_request_than_any_source_goes_to_network() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("8");

        coordinator.load(&album, 300).await.unwrap();
        let large = coordinator.load(&album, 800).await.unwrap();

        assert_eq!(large.dimensions(), (800, 800));
        assert_eq!(fetcher.requested_sizes(), vec![500, 800]);
    }

    #[tokio::test]
    async fn test_derives_from_larger_tier_on_disk_after_restart() {
        let temp = TempDir::new().unwrap();
        let album = ArtworkEntity::album("11");
        {
            let fetcher = Arc::new(MockArtworkFetcher::new());
            let coordinator = coordinator(&temp, fetcher).await;
            coordinator.load(&album, 150).await.unwrap();
            coordinator.flush().await.unwrap();
        }

        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let img = coordinator.load(&album, 300).await.unwrap();

        assert_eq!(img.width(), 300);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_load_states_follow_request() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher).await;
        let album = ArtworkEntity::album("2");
        let mut states = coordinator.observe(&album, 150);

        assert_eq!(states.next().await, Some(LoadState::Idle));
        coordinator.load(&album, 150).await.unwrap();
        assert_eq!(states.next().await, Some(LoadState::Loaded));
    }

    #[tokio::test]
    async fn test_loaded_keys_arrive_batched() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher).await;
        let mut events = coordinator.subscribe();
        let album = ArtworkEntity::album("2");

        coordinator.load(&album, 80).await.unwrap();
        coordinator.load(&album, 150).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        let CacheEvent::Loaded(keys) = event else {
            panic!("expected a loaded batch");
        };
        assert!(keys.contains(&CacheKey::new(album.clone(), 80)));
    }

    #[tokio::test]
    async fn test_cancelled_request_still_warms_cache() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::with_delay(Duration::from_millis(150)));
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("4");

        let task = {
            let coordinator = coordinator.clone();
            let album = album.clone();
            tokio::spawn(async move { coordinator.load(&album, 80).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();

        for _ in 0..100 {
            if coordinator.load_state(&album, 80).is_loaded() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(coordinator.load_state(&album, 80), LoadState::Loaded);
        assert!(coordinator.peek(&album, 500).is_some());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_refetches() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("6");
        coordinator.load(&album, 150).await.unwrap();
        coordinator.load(&album, 80).await.unwrap();
        coordinator.flush().await.unwrap();

        let img = coordinator.refresh(&album, 150).await.unwrap();

        assert_eq!(img.width(), 150);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(coordinator.load_state(&album, 150), LoadState::Loaded);
        assert_eq!(coordinator.load_state(&album, 80), LoadState::Idle);
    }

    #[tokio::test]
    async fn test_clear_all_resets_everything() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("9");
        coordinator.load(&album, 150).await.unwrap();
        coordinator.flush().await.unwrap();

        coordinator.clear_all().await.unwrap();

        let stats = coordinator.stats().await;
        assert_eq!(stats.memory.count, 0);
        assert_eq!(stats.disk.count, 0);
        assert_eq!(coordinator.load_state(&album, 150), LoadState::Idle);
        assert!(coordinator.peek(&album, 150).is_none());

        coordinator.load(&album, 150).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_peek_never_derives() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher).await;
        let album = ArtworkEntity::album("10");
        coordinator.load(&album, 150).await.unwrap();

        assert!(coordinator.peek(&album, 150).is_some());
        assert!(coordinator.peek(&album, 300).is_none());
    }

    #[tokio::test]
    async fn test_prefetch_next_tier_derives_without_fetch() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("12");
        coordinator.load(&album, 150).await.unwrap();

        let task = coordinator.prefetch_next_tier(&album, 150).unwrap();
        task.await.unwrap();

        assert!(coordinator.peek(&album, 200).is_some());
        assert_eq!(fetcher.calls(), 1);
        assert!(coordinator.prefetch_next_tier(&album, 800).is_none());
    }

    #[tokio::test]
    async fn test_zero_size_is_rejected() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher.clone()).await;

        let err = coordinator
            .load(&ArtworkEntity::album("1"), 0)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::InvalidRequest { .. }));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_artist_and_album_are_separate() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new());
        let coordinator = coordinator(&temp, fetcher.clone()).await;

        coordinator.load(&ArtworkEntity::album("1"), 150).await.unwrap();
        coordinator.load(&ArtworkEntity::artist("1"), 150).await.unwrap();

        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_small_server_image_is_passed_through() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::new().with_max_edge(120));
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("small");

        let img = coordinator.load(&album, 150).await.unwrap();

        assert_eq!(fetcher.requested_sizes(), vec![500]);
        assert_eq!(img.dimensions(), (120, 120));
    }

    #[tokio::test]
    async fn test_fetch_finishing_after_clear_is_not_cached() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::with_delay(Duration::from_millis(100)));
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("late");

        let pending = {
            let coordinator = coordinator.clone();
            let album = album.clone();
            tokio::spawn(async move { coordinator.load(&album, 500).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        coordinator.clear_all().await.unwrap();

        assert!(pending.await.unwrap().is_ok());
        coordinator.flush().await.unwrap();

        assert_eq!(coordinator.stats().await.disk.count, 0);
        assert!(coordinator.peek(&album, 500).is_none());
        assert!(!temp.path().join(CacheKey::new(album, 500).blob_filename()).exists());
    }

    #[tokio::test]
    async fn test_device_scale_shrinks_memory_budget() {
        async fn resident_after_two_loads(scale: f32) -> bool {
            let temp = TempDir::new().unwrap();
            let config = CacheConfig {
                device_scale: scale,
                memory_max_bytes: 2_500_000,
                ..config(&temp)
            };
            let coordinator =
                RequestCoordinator::open(config, Arc::new(MockArtworkFetcher::new()), Arc::new(AlwaysReachable))
                    .await
                    .unwrap();
            let first = ArtworkEntity::album("a");
            coordinator.load(&first, 500).await.unwrap();
            coordinator.load(&ArtworkEntity::album("b"), 500).await.unwrap();
            coordinator.peek(&first, 500).is_some()
        }

        // A 500px base costs 1 MB at 1x and 4 MB at 2x.
        assert!(resident_after_two_loads(1.0).await);
        assert!(!resident_after_two_loads(2.0).await);
    }

    #[tokio::test]
    async fn test_refresh_reloads_a_loaded_key() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(MockArtworkFetcher::with_delay(Duration::from_millis(50)));
        let coordinator = coordinator(&temp, fetcher.clone()).await;
        let album = ArtworkEntity::album("r");
        coordinator.load(&album, 300).await.unwrap();
        coordinator.flush().await.unwrap();

        let refreshing = {
            let coordinator = coordinator.clone();
            let album = album.clone();
            tokio::spawn(async move { coordinator.refresh(&album, 300).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.load_state(&album, 300), LoadState::Loading);

        refreshing.await.unwrap().unwrap();
        assert_eq!(coordinator.load_state(&album, 300), LoadState::Loaded);
    }
}
