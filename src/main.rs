use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use image::GenericImageView;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use coverart::domain::ArtworkEntity;
use coverart::infrastructure::{
    AppConfig, CliArgs, Command, MediaServerFetcher, NetworkMonitor, RequestCoordinator,
    StorageManager,
};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn entity(id: String, artist: bool) -> ArtworkEntity {
    if artist {
        ArtworkEntity::artist(id)
    } else {
        ArtworkEntity::album(id)
    }
}

async fn run(
    command: Command,
    coordinator: &RequestCoordinator,
    fetcher: &MediaServerFetcher,
    monitor: &Arc<NetworkMonitor>,
    probe_interval: Duration,
) -> Result<()> {
    match command {
        Command::Stats => {
            let stats = coordinator.stats().await;
            println!("{}", coordinator.cache().disk().dir().display());
            println!("{}", stats.disk);
            println!("{}", stats.memory);
        }
        Command::Sweep => {
            let report = coordinator
                .maintain()
                .await
                .wrap_err("Maintenance pass failed")?;
            println!(
                "expired {}, evicted {}, orphans {}, dangling {}, freed {} bytes",
                report.expired,
                report.evicted,
                report.orphans_removed,
                report.dangling_dropped,
                report.bytes_freed
            );
        }
        Command::Clear => {
            coordinator
                .clear_all()
                .await
                .wrap_err("Failed to clear cache")?;
            println!("Cache cleared");
        }
        Command::Fetch {
            id,
            artist,
            size,
            output,
        } => {
            spawn_probe(fetcher, monitor, probe_interval);
            let entity = entity(id, artist);
            let image = coordinator
                .load(&entity, size)
                .await
                .wrap_err_with(|| format!("Failed to load {entity} at {size}px"))?;
            let (width, height) = image.dimensions();
            println!("{entity}: {width}x{height}");

            if let Some(path) = output {
                save_image(image, path).await?;
            }
        }
        Command::Prefetch { ids, artist, size } => {
            spawn_probe(fetcher, monitor, probe_interval);
            let entities: Vec<ArtworkEntity> =
                ids.into_iter().map(|id| entity(id, artist)).collect();
            let report = coordinator.preload_batch(&entities, size).await;
            println!(
                "loaded {}, failed {}, skipped {}",
                report.loaded, report.failed, report.skipped
            );
        }
    }

    coordinator
        .flush()
        .await
        .wrap_err("Failed to flush disk cache")
}

fn spawn_probe(fetcher: &MediaServerFetcher, monitor: &Arc<NetworkMonitor>, interval: Duration) {
    match fetcher.ping_url() {
        Ok(url) => {
            monitor.spawn_probe(fetcher.client().clone(), url.to_string(), interval);
        }
        Err(e) => warn!(error = %e, "Reachability probe disabled"),
    }
}

async fn save_image(image: Arc<image::DynamicImage>, path: PathBuf) -> Result<()> {
    let target = path.clone();
    tokio::task::spawn_blocking(move || image.save(&target))
        .await
        .wrap_err("Save task panicked")?
        .wrap_err_with(|| format!("Failed to write {}", path.display()))?;
    println!("Saved to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let storage = StorageManager::new().wrap_err("Failed to locate config directory")?;
    let mut config = storage
        .load_config(args.config.as_deref())
        .wrap_err("Failed to load configuration")?;
    config.merge_with_args(&args);

    init_logging(&config)?;
    info!(version = coverart::VERSION, "Starting coverart");

    if !config.server.has_credentials() {
        warn!("No media server credentials configured");
    }

    let fetcher = Arc::new(
        MediaServerFetcher::new(&config.server).wrap_err("Failed to create media server client")?,
    );
    let monitor = NetworkMonitor::new(true);
    let probe_interval = Duration::from_secs(config.server.probe_interval_secs.max(1));

    let coordinator = RequestCoordinator::open(config.cache.clone(), fetcher.clone(), monitor.clone())
        .await
        .wrap_err("Failed to open artwork cache")?;

    run(args.command, &coordinator, &fetcher, &monitor, probe_interval).await
}
