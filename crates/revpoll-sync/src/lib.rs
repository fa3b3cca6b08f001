//! Poll cycle orchestration: fan-out fetch per app, upsert, one snapshot flush per cycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use revpoll_adapters::{FetcherConfig, ReviewsFetcher, DEFAULT_FEED_BASE_URL, DEFAULT_USER_AGENT};
use revpoll_core::{AppIds, Review};
use revpoll_storage::ReviewsStorage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, Instrument, Span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revpoll-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub apps_file: PathBuf,
    pub poll_interval: Duration,
    pub storage_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub feed_base_url: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            apps_file: PathBuf::from("config/apps.yaml"),
            poll_interval: Duration::from_secs(300),
            storage_path: PathBuf::from("data/reviews.json"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 30,
            feed_base_url: DEFAULT_FEED_BASE_URL.to_string(),
            web_port: 8080,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            apps_file: std::env::var("REVPOLL_APPS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.apps_file),
            poll_interval: std::env::var("REVPOLL_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            storage_path: std::env::var("REVPOLL_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_path),
            user_agent: std::env::var("REVPOLL_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("REVPOLL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            feed_base_url: std::env::var("REVPOLL_FEED_BASE_URL").unwrap_or(defaults.feed_base_url),
            web_port: std::env::var("REVPOLL_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            base_url: self.feed_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            ..Default::default()
        }
    }
}

/// Contents of the apps file: the ids to poll plus optional display names for the viewer.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppsFile {
    pub apps: AppIds,
    #[serde(default)]
    pub names: BTreeMap<String, String>,
}

impl AppsFile {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing apps file")
    }

    pub fn display_name<'a>(&'a self, app_id: &'a str) -> &'a str {
        self.names.get(app_id).map(String::as_str).unwrap_or(app_id)
    }
}

pub async fn load_apps_file(path: &Path) -> Result<AppsFile> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    AppsFile::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
}

#[derive(Debug, Error)]
pub enum CycleError {
    /// Shutdown reached the cycle before it finished. Not a failure.
    #[error("poll cycle cancelled")]
    Cancelled,
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

impl CycleError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CycleError::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub apps_polled: usize,
    pub apps_succeeded: usize,
    pub apps_failed: usize,
    pub reviews_fetched: usize,
    pub elapsed_ms: u64,
}

/// Seam between the poller and whatever runs one cycle.
#[async_trait]
pub trait ReviewUpdater: Send + Sync {
    async fn update_reviews(&self) -> Result<CycleSummary, CycleError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppOutcome {
    Stored(usize),
    Failed,
    Cancelled,
}

pub struct ReviewsRepository {
    fetcher: Arc<dyn ReviewsFetcher>,
    storage: Arc<dyn ReviewsStorage>,
    app_ids: AppIds,
}

impl ReviewsRepository {
    pub fn new(
        fetcher: Arc<dyn ReviewsFetcher>,
        storage: Arc<dyn ReviewsStorage>,
        app_ids: AppIds,
    ) -> Self {
        Self {
            fetcher,
            storage,
            app_ids,
        }
    }

    pub fn app_ids(&self) -> &AppIds {
        &self.app_ids
    }

    pub fn get_all_reviews(&self) -> Vec<Review> {
        self.storage.get_all_reviews()
    }

    /// Run one poll cycle. Per-app fetch failures are logged and contained; the
    /// snapshot is flushed once after every task has finished. Dropping the
    /// returned future aborts all in-flight fetch tasks.
    pub async fn update_reviews(&self) -> Result<CycleSummary, CycleError> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("poll_cycle", %cycle_id);
        self.run_cycle(cycle_id).instrument(span).await
    }

    async fn run_cycle(&self, cycle_id: Uuid) -> Result<CycleSummary, CycleError> {
        let started = Instant::now();
        info!(apps = self.app_ids.len(), "updating reviews");

        let mut tasks = JoinSet::new();
        for app_id in self.app_ids.iter() {
            let fetcher = Arc::clone(&self.fetcher);
            let storage = Arc::clone(&self.storage);
            let app_id = app_id.to_string();
            tasks.spawn(fetch_and_store(fetcher, storage, app_id).instrument(Span::current()));
        }

        let mut summary = CycleSummary {
            cycle_id,
            apps_polled: self.app_ids.len(),
            apps_succeeded: 0,
            apps_failed: 0,
            reviews_fetched: 0,
            elapsed_ms: 0,
        };
        let mut cancelled = false;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(AppOutcome::Stored(count)) => {
                    summary.apps_succeeded += 1;
                    summary.reviews_fetched += count;
                }
                Ok(AppOutcome::Failed) => summary.apps_failed += 1,
                Ok(AppOutcome::Cancelled) => cancelled = true,
                Err(err) if err.is_cancelled() => cancelled = true,
                Err(err) => {
                    error!(error = %err, "fetch task panicked");
                    summary.apps_failed += 1;
                }
            }
        }

        if cancelled {
            debug!("poll cycle cancelled before flush");
            return Err(CycleError::Cancelled);
        }

        self.storage
            .save_state()
            .await
            .context("flushing review snapshot at end of cycle")?;

        summary.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            succeeded = summary.apps_succeeded,
            failed = summary.apps_failed,
            reviews = summary.reviews_fetched,
            elapsed_ms = summary.elapsed_ms,
            "poll cycle complete"
        );
        Ok(summary)
    }
}

#[async_trait]
impl ReviewUpdater for ReviewsRepository {
    async fn update_reviews(&self) -> Result<CycleSummary, CycleError> {
        ReviewsRepository::update_reviews(self).await
    }
}

async fn fetch_and_store(
    fetcher: Arc<dyn ReviewsFetcher>,
    storage: Arc<dyn ReviewsStorage>,
    app_id: String,
) -> AppOutcome {
    info!(%app_id, "fetching reviews");
    match fetcher.fetch_reviews(&app_id).await {
        Ok(reviews) => {
            let count = reviews.len();
            storage.save_reviews(reviews);
            info!(%app_id, count, "reviews stored");
            AppOutcome::Stored(count)
        }
        Err(err) if err.is_cancelled() => {
            debug!(%app_id, "review fetch cancelled");
            AppOutcome::Cancelled
        }
        Err(err) => {
            error!(%app_id, error = %err, "failed to fetch reviews");
            AppOutcome::Failed
        }
    }
}

/// Owner side of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// Cloneable shutdown observer. A dropped trigger counts as shutdown.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn triggered(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerReport {
    pub cycles: u64,
    pub failed_cycles: u64,
}

pub struct PollerService {
    updater: Arc<dyn ReviewUpdater>,
    interval: Duration,
    state: watch::Sender<PollerState>,
}

impl PollerService {
    pub fn new(updater: Arc<dyn ReviewUpdater>, interval: Duration) -> Self {
        let (state, _) = watch::channel(PollerState::Stopped);
        Self {
            updater,
            interval,
            state,
        }
    }

    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PollerState> {
        self.state.subscribe()
    }

    pub fn spawn(self: Arc<Self>, shutdown: Shutdown) -> JoinHandle<PollerReport> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Poll immediately, then every `interval`, until shutdown. Cycle errors and
    /// panics are logged and the loop keeps going; shutdown aborts the in-flight cycle.
    pub async fn run(&self, mut shutdown: Shutdown) -> PollerReport {
        info!(interval_secs = self.interval.as_secs(), "starting poller service");
        self.state.send_replace(PollerState::Running);
        let _stopped = StoppedOnDrop(&self.state);
        let mut report = PollerReport::default();

        while !shutdown.is_triggered() {
            // Dropping the set aborts the cycle task.
            let mut cycle = JoinSet::new();
            let updater = Arc::clone(&self.updater);
            cycle.spawn(async move { updater.update_reviews().await });

            tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    info!("poller cancelled during update");
                    break;
                }
                Some(joined) = cycle.join_next() => match joined {
                    Ok(Ok(_)) => report.cycles += 1,
                    Ok(Err(CycleError::Cancelled)) => {
                        info!("poll cycle cancelled; stopping poller");
                        break;
                    }
                    Ok(Err(err)) => {
                        report.cycles += 1;
                        report.failed_cycles += 1;
                        error!(error = ?err, "poll cycle failed; retrying next interval");
                    }
                    Err(err) if err.is_panic() => {
                        report.cycles += 1;
                        report.failed_cycles += 1;
                        error!(error = %err, "poll cycle panicked; retrying next interval");
                    }
                    Err(_) => {
                        info!("poll cycle task aborted; stopping poller");
                        break;
                    }
                },
            }

            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(
            cycles = report.cycles,
            failed_cycles = report.failed_cycles,
            "poller service stopped"
        );
        report
    }
}

/// Marks the poller stopped however `run` exits, including when its future is dropped.
struct StoppedOnDrop<'a>(&'a watch::Sender<PollerState>);

impl Drop for StoppedOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(PollerState::Stopped);
    }
}
