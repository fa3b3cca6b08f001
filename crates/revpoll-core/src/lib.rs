//! Core domain model for revpoll.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "revpoll-core";

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// One customer review for one application, as ingested from the provider.
///
/// `id` is the provider-assigned review id and is the only dedup key used by
/// storage: two reviews with the same `id` are the same record regardless of
/// `app_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub app_id: String,
    pub author: String,
    pub content: String,
    pub rating: u8,
    pub submitted_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

impl Review {
    pub fn is_valid_rating(rating: u8) -> bool {
        (MIN_RATING..=MAX_RATING).contains(&rating)
    }

    pub fn submitted_since(&self, since: DateTime<Utc>) -> bool {
        self.submitted_at >= since
    }
}

/// Configured set of application ids to poll. Duplicates collapse on construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppIds(BTreeSet<String>);

impl AppIds {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            ids.into_iter()
                .map(Into::into)
                .map(|id: String| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.0.contains(app_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for AppIds {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::new(iter)
    }
}
