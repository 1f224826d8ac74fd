use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::model::AlertRecord;

#[derive(Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
    pub tier: Option<u8>,
    pub dedupe: Option<bool>,
}

/// `GET /api/alerts/recent` (spec.md §4.7): newest-first, optionally
/// filtered by tier and deduplicated to the latest record per token.
pub async fn recent_alerts(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(tier) = params.tier {
        if !(1..=3).contains(&tier) {
            return Err(ApiError::BadRequest(format!("invalid tier: {tier}")));
        }
    }

    let doc = state.cached_doc().await;
    let total_in_storage = doc.alerts.len();

    let mut alerts: Vec<AlertRecord> = doc.alerts;
    alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    if let Some(tier) = params.tier {
        alerts.retain(|a| a.tier == tier);
    }

    if params.dedupe.unwrap_or(true) {
        let mut seen = std::collections::HashSet::new();
        alerts.retain(|a| seen.insert(a.token.to_uppercase()));
    }

    let limit = params.limit.unwrap_or(20);
    if limit > 0 && alerts.len() > limit {
        alerts.truncate(limit);
    }

    Ok(Json(serde_json::json!({
        "alerts": alerts,
        "count": alerts.len(),
        "total_in_storage": total_in_storage,
        "timestamp": Utc::now(),
    })))
}

/// `GET /api/stats` (spec.md §4.7): totals, per-tier counts, 24h/7d windows,
/// subscriber counts from the registry.
pub async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let doc = state.cached_doc().await;
    let now = Utc::now();

    let mut per_tier: HashMap<u8, u64> = HashMap::new();
    let mut last_24h = 0u64;
    let mut last_7d = 0u64;
    for alert in &doc.alerts {
        *per_tier.entry(alert.tier).or_insert(0) += 1;
        let age = now - alert.timestamp;
        if age <= chrono::Duration::hours(24) {
            last_24h += 1;
        }
        if age <= chrono::Duration::days(7) {
            last_7d += 1;
        }
    }

    Ok(Json(serde_json::json!({
        "total": doc.alerts.len(),
        "per_tier": per_tier,
        "last_24h": last_24h,
        "last_7d": last_7d,
        "subscribers": state.registry.count().await,
        "timestamp": now,
    })))
}

/// `GET /api/alerts/tiers` (spec.md §4.7): per-tier count plus the three
/// most recent records in each tier.
pub async fn tiers(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let doc = state.cached_doc().await;
    let mut by_tier: HashMap<u8, Vec<AlertRecord>> = HashMap::new();
    for alert in &doc.alerts {
        by_tier.entry(alert.tier).or_default().push(alert.clone());
    }

    let mut response = serde_json::Map::new();
    for tier in 1u8..=3 {
        let mut records = by_tier.remove(&tier).unwrap_or_default();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let count = records.len();
        records.truncate(3);
        response.insert(
            tier.to_string(),
            serde_json::json!({ "count": count, "recent": records }),
        );
    }

    Ok(Json(serde_json::Value::Object(response)))
}

#[derive(Deserialize)]
pub struct DailyParams {
    pub days: Option<u32>,
}

/// `GET /api/alerts/stats/daily?days=D` (spec.md §4.7): D buckets by UTC
/// date with total and per-tier sub-counts, oldest first.
pub async fn daily_stats(
    State(state): State<AppState>,
    Query(params): Query<DailyParams>,
) -> Result<impl IntoResponse, ApiError> {
    let days = params.days.unwrap_or(7);
    if days == 0 || days > 365 {
        return Err(ApiError::BadRequest(format!("invalid days: {days}")));
    }

    let doc = state.cached_doc().await;
    let today = Utc::now().date_naive();

    let mut buckets: Vec<(NaiveDate, u64, HashMap<u8, u64>)> = (0..days)
        .map(|i| (today - chrono::Duration::days(i as i64), 0u64, HashMap::new()))
        .collect();
    buckets.reverse();

    for alert in &doc.alerts {
        let date = alert.timestamp.date_naive();
        if let Some(bucket) = buckets.iter_mut().find(|(d, _, _)| *d == date) {
            bucket.1 += 1;
            *bucket.2.entry(alert.tier).or_insert(0) += 1;
        }
    }

    let out: Vec<_> = buckets
        .into_iter()
        .map(|(date, total, per_tier)| {
            serde_json::json!({ "date": date.to_string(), "total": total, "per_tier": per_tier })
        })
        .collect();

    Ok(Json(serde_json::json!({ "days": out })))
}

/// `GET /api/health` (spec.md §4.7, §7): presence of each backing file,
/// the latest record summary, and per-category failure counters.
pub async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let doc = state.cached_doc().await;
    let latest: Option<&AlertRecord> = doc.alerts.iter().max_by_key(|a| a.timestamp);

    let log_exists = state.log.path().exists();
    let sidecar_exists = state.log.emergency_sidecar_path().exists();

    Ok(Json(serde_json::json!({
        "status": "ok",
        "log_file_present": log_exists,
        "emergency_sidecar_present": sidecar_exists,
        "last_updated": doc.last_updated,
        "latest_record": latest.map(|r| serde_json::json!({
            "id": r.id,
            "token": r.token,
            "tier": r.tier,
            "timestamp": r.timestamp,
        })),
        "consecutive_write_failures": state.log.consecutive_write_failures(),
        "mirror_failures": state.mirror_failures.load(std::sync::atomic::Ordering::Relaxed),
        "parse_misses_by_source": state.parse_metrics.snapshot(),
        "counters": state.metrics.snapshot(),
        "checked_at": Utc::now(),
    })))
}

/// `GET /api/cache/refresh` (spec.md §4.7): forces the next read to bypass
/// the TTL cache.
pub async fn cache_refresh(State(state): State<AppState>) -> impl IntoResponse {
    state.invalidate_cache().await;
    Json(serde_json::json!({ "refreshed": true, "timestamp": Utc::now() }))
}
