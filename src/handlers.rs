use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::cache::CacheManager;
use crate::error::{Error, ErrorResponse};
use crate::health::HealthChecker;
use crate::metrics::MetricsCollector;
use crate::rate_limiter::RateLimiter;
use crate::response::{
    CacheStatsResponse, DeleteResponse, FlushResponse, RateLimitStatusResponse, ReadyResponse,
    ResetResponse,
};
use crate::runtime::Runtime;
use crate::storage::Tier;
use crate::validation::RequestValidator;

/// Action the gate layer charges admin requests against.
pub const ADMIN_ACTION: &str = "admin_api";

/// Handler state. Cheap to clone; every field shares the runtime's stores.
#[derive(Clone)]
pub struct AppState {
    pub cache: CacheManager,
    pub limiter: RateLimiter,
    pub metrics: MetricsCollector,
}

impl AppState {
    pub fn from_runtime(runtime: &Runtime) -> Self {
        Self {
            cache: runtime.cache().clone(),
            limiter: runtime.limiter().clone(),
            metrics: runtime.metrics().clone(),
        }
    }
}

/// Health check endpoint. Always 200; a down tier shows up as `degraded`.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthChecker::new(state.cache).check_health().await)
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let connected = matches!(state.cache.ping(Tier::Persistent).await, Some(Ok(_)));
    (StatusCode::OK, Json(ReadyResponse::ready(connected)))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot().await)
}

pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.cache.stats().await;
    let rate_windows = match state.limiter.window_count().await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error = %e, "Rate-limit window count unavailable");
            None
        }
    };
    Json(CacheStatsResponse::new(stats, rate_windows))
}

/// Flush both tiers
pub async fn flush_cache(State(state): State<AppState>) -> impl IntoResponse {
    let removed = state.cache.clear().await;
    tracing::info!(
        persistent = removed.persistent,
        local = removed.local,
        "Cache flushed by operator"
    );
    Json(FlushResponse::flushed(removed))
}

pub async fn delete_cache_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, Error> {
    RequestValidator::validate_cache_key(&key)?;
    let deleted = state.cache.delete(&key).await;
    Ok(Json(DeleteResponse { key, deleted }))
}

/// Current window for one (action, identifier) pair
pub async fn rate_limit_status(
    State(state): State<AppState>,
    Path((action, identifier)): Path<(String, String)>,
) -> Result<Response, Error> {
    RequestValidator::validate_action(&action)?;
    RequestValidator::validate_identifier(&identifier)?;

    match state.limiter.status(&action, &identifier).await? {
        Some(status) => Ok(Json(RateLimitStatusResponse::from(status)).into_response()),
        None => Ok(unknown_action(&action)),
    }
}

pub async fn reset_rate_limit(
    State(state): State<AppState>,
    Path((action, identifier)): Path<(String, String)>,
) -> Result<Response, Error> {
    RequestValidator::validate_action(&action)?;
    RequestValidator::validate_identifier(&identifier)?;

    if state.limiter.quotas().get(&action).is_none() {
        return Ok(unknown_action(&action));
    }

    let reset = state.limiter.reset(&action, &identifier).await;
    Ok(Json(ResetResponse {
        action,
        identifier,
        reset,
    })
    .into_response())
}

fn unknown_action(action: &str) -> Response {
    let body = ErrorResponse::new(
        "not_found",
        &format!("No quota policy for action '{}'", action),
        404,
    );
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}
