//! Axum JSON API + Askama review viewer for revpoll.

use std::future::Future;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use revpoll_core::Review;
use revpoll_storage::ReviewsStorage;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "revpoll-web";

pub const DEFAULT_WINDOW_HOURS: i64 = 48;
pub const REFRESH_MINUTES: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppOption {
    pub id: String,
    pub name: String,
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn ReviewsStorage>,
    pub apps: Vec<AppOption>,
}

impl AppState {
    pub fn new(storage: Arc<dyn ReviewsStorage>, apps: Vec<AppOption>) -> Self {
        Self { storage, apps }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ReviewsQuery {
    app_id: Option<String>,
    hours: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub total_reviews: usize,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    apps: Vec<AppOption>,
    selected_app: String,
    default_hours: i64,
    refresh_minutes: u64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/reviews", get(recent_reviews_handler))
        .route("/api/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    render_html(IndexTemplate {
        selected_app: state.apps.first().map(|a| a.id.clone()).unwrap_or_default(),
        apps: state.apps.clone(),
        default_hours: DEFAULT_WINDOW_HOURS,
        refresh_minutes: REFRESH_MINUTES,
    })
}

async fn recent_reviews_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReviewsQuery>,
) -> Response {
    let Some(app_id) = query.app_id.filter(|id| !id.trim().is_empty()) else {
        warn!("missing app_id in request");
        return bad_request("app_id query parameter is required");
    };

    let hours = match query.hours.as_deref().map(parse_hours) {
        None => DEFAULT_WINDOW_HOURS,
        Some(Some(hours)) => hours,
        Some(None) => {
            warn!(hours = ?query.hours, "hours is not a positive integer");
            return bad_request("hours must be a positive integer");
        }
    };

    let since = Utc::now() - Duration::hours(hours);
    let mut reviews = state.storage.get_recent_reviews(Some(&app_id), since);
    sort_newest_first(&mut reviews);
    Json(reviews).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        total_reviews: state.storage.len(),
    })
}

/// Upper bound keeps `Duration::hours` away from overflow.
fn parse_hours(raw: &str) -> Option<i64> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|h| (1..=24 * 365 * 100).contains(h))
}

fn sort_newest_first(reviews: &mut [Review]) {
    reviews.sort_by(|a, b| {
        b.submitted_at
            .cmp(&a.submitted_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn bad_request(message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use revpoll_storage::ReviewsFileStorage;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn review(id: &str, app_id: &str, hours_ago: i64) -> Review {
        let now = Utc::now();
        Review {
            id: id.to_string(),
            app_id: app_id.to_string(),
            author: format!("author-{id}"),
            content: format!("content-{id}"),
            rating: 4,
            submitted_at: now - Duration::hours(hours_ago),
            fetched_at: now,
        }
    }

    fn test_app() -> (TempDir, Router) {
        let dir = tempdir().expect("tempdir");
        let storage = ReviewsFileStorage::new(dir.path().join("reviews.json")).expect("storage");
        storage.save_reviews(vec![
            review("recent", "595068606", 2),
            review("newest", "595068606", 1),
            review("stale", "595068606", 100),
            review("other-app", "447188370", 1),
        ]);
        let apps = vec![
            AppOption {
                id: "595068606".into(),
                name: "Instagram".into(),
            },
            AppOption {
                id: "447188370".into(),
                name: "Twitter".into(),
            },
        ];
        (dir, app(AppState::new(Arc::new(storage), apps)))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn recent_reviews_filters_and_sorts_newest_first() {
        let (_dir, app) = test_app();
        let (status, body) = get(app, "/api/reviews?app_id=595068606").await;
        assert_eq!(status, StatusCode::OK);
        let reviews: Vec<Review> = serde_json::from_str(&body).unwrap();
        let ids: Vec<_> = reviews.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["newest", "recent"]);
    }

    #[tokio::test]
    async fn hours_widens_the_window() {
        let (_dir, app) = test_app();
        let (status, body) = get(app, "/api/reviews?app_id=595068606&hours=200").await;
        assert_eq!(status, StatusCode::OK);
        let reviews: Vec<Review> = serde_json::from_str(&body).unwrap();
        assert_eq!(reviews.len(), 3);
    }

    #[tokio::test]
    async fn unknown_app_returns_empty_list() {
        let (_dir, app) = test_app();
        let (status, body) = get(app, "/api/reviews?app_id=never-fetched").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn missing_app_id_is_bad_request() {
        let (_dir, app) = test_app();
        let (status, body) = get(app, "/api/reviews?hours=5").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "app_id query parameter is required");
    }

    #[tokio::test]
    async fn invalid_hours_is_bad_request() {
        for bad in ["abc", "-3", "0"] {
            let (_dir, app) = test_app();
            let (status, body) = get(app, &format!("/api/reviews?app_id=595068606&hours={bad}")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "hours={bad}");
            assert_eq!(body, "hours must be a positive integer");
        }
    }

    #[tokio::test]
    async fn health_reports_total_reviews() {
        let (_dir, app) = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.total_reviews, 4);
    }

    #[tokio::test]
    async fn index_lists_configured_apps() {
        let (_dir, app) = test_app();
        let (status, body) = get(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("App Store Reviews Viewer"));
        assert!(body.contains("Instagram"));
        assert!(body.contains(r#"value="447188370""#));
    }

    #[test]
    fn parse_hours_accepts_only_positive_integers() {
        assert_eq!(parse_hours("48"), Some(48));
        assert_eq!(parse_hours(" 1 "), Some(1));
        assert_eq!(parse_hours("0"), None);
        assert_eq!(parse_hours("1.5"), None);
        assert_eq!(parse_hours("99999999999999"), None);
    }
}
