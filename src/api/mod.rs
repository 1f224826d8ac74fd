//! Read API (spec.md §4.7): serves the durable log behind a short-TTL
//! cache. All responses are JSON; errors render as `{ "error", "status" }`
//! (spec.md §6) instead of axum's default plaintext body.

mod routes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};

use crate::fanout::SubscriberRegistry;
use crate::log::{DurableLog, LogDocument};
use crate::metrics::Metrics;
use crate::parser::ParseMetrics;

#[derive(Clone)]
pub struct AppState {
    pub log: Arc<DurableLog>,
    pub registry: Arc<SubscriberRegistry>,
    pub metrics: Arc<Metrics>,
    pub parse_metrics: Arc<ParseMetrics>,
    pub mirror_failures: Arc<std::sync::atomic::AtomicU64>,
    cache: Arc<RwLock<Option<CachedDoc>>>,
    cache_ttl: Duration,
}

struct CachedDoc {
    doc: LogDocument,
    fetched_at: Instant,
    generation: u64,
}

impl AppState {
    pub fn new(
        log: Arc<DurableLog>,
        registry: Arc<SubscriberRegistry>,
        metrics: Arc<Metrics>,
        parse_metrics: Arc<ParseMetrics>,
        mirror_failures: Arc<std::sync::atomic::AtomicU64>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            log,
            registry,
            metrics,
            parse_metrics,
            mirror_failures,
            cache: Arc::new(RwLock::new(None)),
            cache_ttl,
        }
    }

    /// Returns the cached log document, refreshing it from `DurableLog` if
    /// the cache is empty, past its TTL, or a write has landed since it was
    /// fetched (spec.md §4.7: "TTL cache ... plus a file-mtime check for
    /// immediate invalidation" — `DurableLog::generation` plays that role
    /// here, since the log is an in-process writer, not an external file).
    async fn cached_doc(&self) -> LogDocument {
        let current_generation = self.log.generation();
        {
            let guard = self.cache.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.generation == current_generation && cached.fetched_at.elapsed() < self.cache_ttl {
                    return cached.doc.clone();
                }
            }
        }
        let doc = self.log.snapshot().await;
        let mut guard = self.cache.write().await;
        *guard = Some(CachedDoc {
            doc: doc.clone(),
            fetched_at: Instant::now(),
            generation: current_generation,
        });
        doc
    }

    async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }
}

pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        let body = serde_json::json!({ "error": message, "status": status.as_u16() });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/alerts/recent", get(routes::recent_alerts))
        .route("/api/stats", get(routes::stats))
        .route("/api/alerts/tiers", get(routes::tiers))
        .route("/api/alerts/stats/daily", get(routes::daily_stats))
        .route("/api/health", get(routes::health))
        .route("/api/cache/refresh", get(routes::cache_refresh))
        .layer(cors)
        .with_state(state)
}

/// Binds and serves the router forever; returns only on a fatal bind error.
pub async fn serve(state: AppState, port: u16) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "read API listening");
    axum::serve(listener, app).await
}
