//! Deduplicated in-memory review store + atomic JSON snapshot persistence.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use revpoll_core::Review;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

pub const CRATE_NAME: &str = "revpoll-storage";

/// Storage contract shared by the poll cycle and the HTTP layer.
#[async_trait]
pub trait ReviewsStorage: Send + Sync {
    /// Upsert by review id. Last write wins.
    fn save_reviews(&self, reviews: Vec<Review>);

    fn get_all_reviews(&self) -> Vec<Review>;

    fn get_recent_reviews(&self, app_id: Option<&str>, since: DateTime<Utc>) -> Vec<Review>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the snapshot from disk. A missing or unreadable snapshot leaves the store empty.
    async fn load_state(&self) -> anyhow::Result<()>;

    /// Flush the full store to disk via temp file + atomic rename.
    async fn save_state(&self) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct ReviewsFileStorage {
    path: PathBuf,
    reviews: DashMap<String, Review>,
}

impl ReviewsFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating storage directory {}", parent.display()))?;
                info!(dir = %parent.display(), "storage directory ready");
            }
            None => info!(path = %path.display(), "storage path is a bare file name; no directory needed"),
        }

        Ok(Self {
            path,
            reviews: DashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    async fn read_snapshot(&self) -> anyhow::Result<Vec<Review>> {
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    async fn write_atomic(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let temp_path = self.temp_path();

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReviewsStorage for ReviewsFileStorage {
    fn save_reviews(&self, reviews: Vec<Review>) {
        for review in reviews {
            self.reviews.insert(review.id.clone(), review);
        }
    }

    fn get_all_reviews(&self) -> Vec<Review> {
        self.reviews.iter().map(|entry| entry.value().clone()).collect()
    }

    fn get_recent_reviews(&self, app_id: Option<&str>, since: DateTime<Utc>) -> Vec<Review> {
        self.reviews
            .iter()
            .filter(|entry| {
                let review = entry.value();
                review.submitted_since(since) && app_id.map_or(true, |id| review.app_id == id)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.reviews.len()
    }

    async fn load_state(&self) -> anyhow::Result<()> {
        match fs::try_exists(&self.path).await {
            Ok(true) => {}
            Ok(false) => {
                info!(path = %self.path.display(), "no snapshot yet; starting with an empty store");
                return Ok(());
            }
            Err(err) => {
                error!(
                    path = %self.path.display(),
                    error = %err,
                    "cannot check snapshot path; starting with an empty store"
                );
                return Ok(());
            }
        }

        match self.read_snapshot().await {
            Ok(reviews) => {
                self.reviews.clear();
                let count = reviews.len();
                self.save_reviews(reviews);
                info!(count, stored = self.reviews.len(), "reviews loaded from snapshot");
            }
            Err(err) => {
                error!(error = ?err, "failed to load snapshot; starting with an empty store");
            }
        }
        Ok(())
    }

    async fn save_state(&self) -> anyhow::Result<()> {
        let reviews = self.get_all_reviews();
        let bytes = serde_json::to_vec_pretty(&reviews).context("serializing review snapshot")?;
        self.write_atomic(&bytes).await?;
        info!(count = reviews.len(), path = %self.path.display(), "reviews persisted");
        Ok(())
    }
}
