use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use revpoll_adapters::ITunesReviewsFetcher;
use revpoll_storage::{ReviewsFileStorage, ReviewsStorage};
use revpoll_sync::{load_apps_file, shutdown_channel, AppsFile, PollerService, ReviewsRepository, SyncConfig};
use revpoll_web::{AppOption, AppState};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "revpoll")]
#[command(about = "Polls App Store customer reviews and serves the recent ones")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll on an interval and serve the JSON API + viewer (default).
    Serve,
    /// Run a single poll cycle and exit.
    Sync,
}

struct Runtime {
    config: SyncConfig,
    apps: AppsFile,
    storage: Arc<ReviewsFileStorage>,
    fetcher: Arc<ITunesReviewsFetcher>,
    repository: Arc<ReviewsRepository>,
}

async fn build_runtime() -> Result<Runtime> {
    let config = SyncConfig::from_env();
    let apps = load_apps_file(&config.apps_file).await?;
    info!(apps = apps.apps.len(), file = %config.apps_file.display(), "loaded app ids");

    let storage = Arc::new(ReviewsFileStorage::new(&config.storage_path)?);
    storage.load_state().await?;

    let fetcher = Arc::new(ITunesReviewsFetcher::new(config.fetcher_config())?);
    let repository = Arc::new(ReviewsRepository::new(
        fetcher.clone(),
        storage.clone(),
        apps.apps.clone(),
    ));
    info!(
        reviews = repository.get_all_reviews().len(),
        path = %storage.path().display(),
        "review store ready"
    );

    Ok(Runtime {
        config,
        apps,
        storage,
        fetcher,
        repository,
    })
}

async fn serve(rt: Runtime) -> Result<()> {
    let (trigger, shutdown) = shutdown_channel();

    let poller = Arc::new(PollerService::new(
        rt.repository.clone(),
        rt.config.poll_interval,
    ))
    .spawn(shutdown.clone());

    let apps = rt
        .apps
        .apps
        .iter()
        .map(|id| AppOption {
            id: id.to_string(),
            name: rt.apps.display_name(id).to_string(),
        })
        .collect();
    let state = AppState::new(rt.storage.clone(), apps);
    let mut web_shutdown = shutdown.clone();
    let mut server = tokio::spawn(revpoll_web::serve(state, rt.config.web_port, async move {
        web_shutdown.triggered().await
    }));

    let server_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("shutdown requested"),
                Err(err) => error!(error = %err, "listening for ctrl-c failed; shutting down"),
            }
            None
        }
        result = &mut server => Some(result),
    };

    trigger.trigger();
    rt.fetcher.close();

    match poller.await {
        Ok(report) => info!(cycles = report.cycles, failed = report.failed_cycles, "poller joined"),
        Err(err) => error!(error = %err, "poller task ended abnormally"),
    }

    let server_result = match server_result {
        Some(result) => result,
        None => server.await,
    };

    if let Err(err) = rt.storage.save_state().await {
        error!(error = ?err, "final snapshot flush failed");
    }

    server_result
        .context("http server task panicked")?
        .context("http server failed")?;
    info!("shutdown complete");
    Ok(())
}

async fn sync_once(rt: Runtime) -> Result<()> {
    let summary = rt.repository.update_reviews().await?;
    println!(
        "sync complete: cycle_id={} apps={} succeeded={} failed={} reviews_fetched={} stored={} elapsed_ms={}",
        summary.cycle_id,
        summary.apps_polled,
        summary.apps_succeeded,
        summary.apps_failed,
        summary.reviews_fetched,
        rt.storage.len(),
        summary.elapsed_ms
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("revpoll=info".parse()?))
        .init();

    let cli = Cli::parse();
    let rt = build_runtime().await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(rt).await?,
        Commands::Sync => sync_once(rt).await?,
    }

    Ok(())
}
