//! Review provider contract + the iTunes customer-reviews feed adapter.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use revpoll_core::Review;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "revpoll-adapters";

pub const DEFAULT_FEED_BASE_URL: &str = "https://itunes.apple.com";
pub const DEFAULT_USER_AGENT: &str = "AppReviewPoller/1.0";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding review feed for app {app_id}: {source}")]
    Decode {
        app_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

/// Pulls the current review feed for one application. No retries: the caller
/// decides what a failure means and tries again next cycle.
#[async_trait]
pub trait ReviewsFetcher: Send + Sync {
    async fn fetch_reviews(&self, app_id: &str) -> Result<Vec<Review>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub max_concurrent_requests: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FEED_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_concurrent_requests: 8,
        }
    }
}

#[derive(Debug)]
pub struct ITunesReviewsFetcher {
    client: reqwest::Client,
    base_url: String,
    limit: Arc<Semaphore>,
}

impl ITunesReviewsFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limit: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
        })
    }

    pub fn feed_url(&self, app_id: &str) -> String {
        format!(
            "{}/us/rss/customerreviews/id={app_id}/sortBy=mostRecent/page=1/json",
            self.base_url
        )
    }

    /// Stop admitting new requests. Fetches still waiting for a slot resolve to `Cancelled`.
    pub fn close(&self) {
        self.limit.close();
    }
}

#[async_trait]
impl ReviewsFetcher for ITunesReviewsFetcher {
    async fn fetch_reviews(&self, app_id: &str) -> Result<Vec<Review>, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Cancelled)?;

        let url = self.feed_url(app_id);
        debug!(app_id, %url, "requesting review feed");
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await?;
        parse_feed(app_id, &body, Utc::now())
    }
}

/// Decode an iTunes RSS JSON body into reviews stamped with `fetched_at`.
/// Malformed entries are skipped; a body that is not a feed is an error.
pub fn parse_feed(
    app_id: &str,
    body: &[u8],
    fetched_at: DateTime<Utc>,
) -> Result<Vec<Review>, FetchError> {
    let feed: RssFeed = serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        app_id: app_id.to_string(),
        source,
    })?;

    let entries = feed.feed.entry.map(OneOrMany::into_vec).unwrap_or_default();
    let mut reviews = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.into_review(app_id, fetched_at) {
            Ok(review) => reviews.push(review),
            Err(reason) => warn!(app_id, reason = %reason, "skipping malformed review entry"),
        }
    }
    Ok(reviews)
}

#[derive(Debug, Deserialize)]
struct RssFeed {
    feed: Feed,
}

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(default)]
    entry: Option<OneOrMany<Entry>>,
}

/// The feed collapses a single entry into a bare object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Deserialize)]
struct Label {
    label: String,
}

#[derive(Debug, Deserialize)]
struct Author {
    name: Label,
}

#[derive(Debug, Deserialize)]
struct Entry {
    id: Option<Label>,
    author: Option<Author>,
    content: Option<Label>,
    updated: Option<Label>,
    #[serde(rename = "im:rating")]
    rating: Option<Label>,
}

impl Entry {
    fn into_review(self, app_id: &str, fetched_at: DateTime<Utc>) -> Result<Review, String> {
        let id = self.id.map(|l| l.label).ok_or("missing id")?;
        let rating_label = self.rating.map(|l| l.label).ok_or("missing rating")?;
        let rating: u8 = rating_label
            .trim()
            .parse()
            .map_err(|_| format!("invalid rating {rating_label:?}"))?;
        if !Review::is_valid_rating(rating) {
            return Err(format!("rating {rating} out of range"));
        }
        let updated = self.updated.map(|l| l.label).ok_or("missing timestamp")?;
        let submitted_at = DateTime::parse_from_rfc3339(&updated)
            .map_err(|err| format!("invalid timestamp {updated:?}: {err}"))?
            .with_timezone(&Utc);

        Ok(Review {
            id,
            app_id: app_id.to_string(),
            author: self.author.map(|a| a.name.label).unwrap_or_default(),
            content: self.content.map(|c| c.label).unwrap_or_default(),
            rating,
            submitted_at,
            fetched_at,
        })
    }
}
