use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use pacekeeper::{
    accessors,
    cache::CacheManager,
    clock::{Clock, ManualClock},
    create_app,
    error::Error,
    quota::{QuotaPolicy, QuotaTable},
    storage::{CacheStore, FileStore, MemoryStore},
    AppState, Runtime,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

struct Harness {
    runtime: Runtime,
    clock: ManualClock,
    persistent: MemoryStore,
    local: FileStore,
    _dir: TempDir,
}

fn harness(quotas: QuotaTable) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();
    let persistent = MemoryStore::new();
    let local = FileStore::new(dir.path());

    let runtime = Runtime::builder(Arc::new(persistent.clone()))
        .local(Arc::new(local.clone()))
        .quotas(quotas)
        .clock(Arc::new(clock.clone()))
        .sweep(None)
        .start();

    Harness {
        runtime,
        clock,
        persistent,
        local,
        _dir: dir,
    }
}

async fn send(
    app: axum::Router,
    method: Method,
    uri: &str,
) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("user-agent", "integration-test")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, headers, body)
}

#[tokio::test]
async fn test_login_lockout_and_recovery() {
    let h = harness(QuotaTable::default());
    let limiter = h.runtime.limiter();

    for _ in 0..5 {
        limiter.record_attempt("login", "user:42").await.unwrap();
    }
    assert!(!limiter.is_allowed("login", "user:42").await);
    assert_eq!(limiter.remaining("login", "user:42").await, Some(0));

    h.clock.advance(901);
    assert!(limiter.is_allowed("login", "user:42").await);
    let window = limiter.record_attempt("login", "user:42").await.unwrap();
    assert_eq!(window.attempts, 1);
    assert_eq!(window.window_start, h.clock.now());
}

#[tokio::test]
async fn test_enforce_never_admits_a_denied_identifier() {
    let h = harness(QuotaTable::new().with("contact", QuotaPolicy::new(3, 60)));
    let limiter = h.runtime.limiter();

    let mut admitted = 0;
    for _ in 0..10 {
        let allowed_before = limiter.is_allowed("contact", "client:abc").await;
        match limiter.enforce("contact", "client:abc").await {
            Ok(_) => {
                assert!(allowed_before);
                admitted += 1;
            }
            Err(Error::QuotaExceeded(denial)) => {
                assert!(!allowed_before);
                assert_eq!(denial.limit, 3);
                assert_eq!(denial.retry_after_secs, 60);
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(admitted, 3);

    let metrics = h.runtime.metrics().get_action_metrics("contact").await.unwrap();
    assert_eq!(metrics.allowed, 3);
    assert_eq!(metrics.denied, 7);
}

#[tokio::test]
async fn test_active_categories_expire_after_ttl() {
    let h = harness(QuotaTable::default());
    let cache = h.runtime.cache();
    let categories = vec!["5k", "10k", "half", "full", "kids"];

    cache
        .set("categories_active", &categories, Duration::from_secs(300))
        .await
        .unwrap();

    h.clock.advance(299);
    assert_eq!(cache.get::<Vec<String>>("categories_active").await.unwrap().len(), 5);

    h.clock.advance(2);
    assert!(cache.get::<Vec<String>>("categories_active").await.is_none());
}

#[tokio::test]
async fn test_accessor_populates_once_until_expiry() {
    let h = harness(QuotaTable::default());
    let cache = h.runtime.cache();
    let query = accessors::active_categories::<Vec<String>>();
    let mut loads = 0;

    for _ in 0..3 {
        let value = query
            .get(cache, || {
                loads += 1;
                async { Ok::<_, Error>(vec!["5k".to_string()]) }
            })
            .await
            .unwrap();
        assert_eq!(value, vec!["5k".to_string()]);
    }
    assert_eq!(loads, 1);

    h.clock.advance(query.ttl().as_secs() as i64);
    assert!(query.peek(cache).await.is_none());
}

#[tokio::test]
async fn test_clear_empties_both_tiers() {
    let h = harness(QuotaTable::default());
    let cache = h.runtime.cache();
    for i in 0..4 {
        cache
            .set(&format!("page:{}", i), &i, Duration::from_secs(600))
            .await
            .unwrap();
    }
    assert_eq!(h.local.stats(h.clock.now()).await.unwrap().entries, 4);

    let removed = cache.clear().await;
    assert_eq!(removed.persistent, 4);
    assert_eq!(removed.local, 4);

    let now = h.clock.now();
    assert_eq!(h.persistent.stats(now).await.unwrap().entries, 0);
    assert_eq!(h.local.stats(now).await.unwrap().entries, 0);
}

#[tokio::test]
async fn test_local_tier_serves_when_persistent_copy_is_gone() {
    let h = harness(QuotaTable::default());
    let cache = h.runtime.cache();
    cache.set("settings", &"v1", Duration::from_secs(600)).await.unwrap();

    // Lost by the persistent tier only, e.g. a Redis restart.
    h.persistent.clear().await.unwrap();

    assert_eq!(cache.get::<String>("settings").await.as_deref(), Some("v1"));
    // Not promoted back.
    assert!(h.persistent.get("settings").await.unwrap().is_none());
}

#[tokio::test]
async fn test_http_health_and_metrics() {
    let h = harness(QuotaTable::default());
    let app = create_app(AppState::from_runtime(&h.runtime));

    let (status, _, body) = send(app.clone(), Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _, body) = send(app.clone(), Method::GET, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["persistent"], "connected");

    let (status, _, body) = send(app, Method::GET, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["cache"].is_object());
}

#[tokio::test]
async fn test_http_admin_cache_routes() {
    let h = harness(QuotaTable::default());
    let cache = h.runtime.cache();
    cache.set("a", &1, Duration::from_secs(60)).await.unwrap();
    cache.set("b", &2, Duration::from_secs(60)).await.unwrap();
    let app = create_app(AppState::from_runtime(&h.runtime));

    let (status, headers, body) = send(app.clone(), Method::GET, "/admin/cache/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_entries"], 4);
    // The gate opened the admin_api window for this client.
    assert_eq!(body["rate_windows"], 1);
    assert_eq!(headers["X-RateLimit-Limit"], "120");

    let (status, _, body) = send(app.clone(), Method::DELETE, "/admin/cache/a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, _, body) = send(app, Method::DELETE, "/admin/cache").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"]["persistent"], 1);
    assert!(cache.get::<i32>("b").await.is_none());
}

#[tokio::test]
async fn test_http_rate_limit_status_and_reset() {
    let h = harness(QuotaTable::default());
    let limiter = h.runtime.limiter();
    limiter.record_attempt("login", "user:7").await.unwrap();
    limiter.record_attempt("login", "user:7").await.unwrap();
    let app = create_app(AppState::from_runtime(&h.runtime));

    let (status, _, body) =
        send(app.clone(), Method::GET, "/admin/rate-limits/login/user:7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attempts"], 2);
    assert_eq!(body["remaining"], 3);

    let (status, _, body) =
        send(app.clone(), Method::DELETE, "/admin/rate-limits/login/user:7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reset"], true);
    assert_eq!(limiter.remaining("login", "user:7").await, Some(5));

    let (status, _, _) = send(app.clone(), Method::GET, "/admin/rate-limits/nope/user:7").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(app, Method::GET, "/admin/rate-limits/Bad%20Action/user:7").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_http_admin_gate_answers_429() {
    let quotas = QuotaTable::default().with("admin_api", QuotaPolicy::new(2, 60));
    let h = harness(quotas);
    let app = create_app(AppState::from_runtime(&h.runtime));

    for remaining in ["1", "0"] {
        let (status, headers, _) = send(app.clone(), Method::GET, "/admin/cache/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["X-RateLimit-Remaining"], remaining);
    }

    let (status, headers, body) = send(app.clone(), Method::GET, "/admin/cache/stats").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers["Retry-After"], "60");
    assert_eq!(headers["X-RateLimit-Limit"], "2");
    assert_eq!(body["error"], "rate_limit_exceeded");

    // Health is not behind the gate.
    let (status, _, _) = send(app.clone(), Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);

    h.clock.advance(60);
    let (status, _, _) = send(app, Method::GET, "/admin/cache/stats").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_cache_manager_without_local_tier() {
    let clock = ManualClock::default();
    let cache = CacheManager::new(Arc::new(MemoryStore::new()), Arc::new(clock.clone()));

    assert!(cache.set("k", &"v", Duration::from_secs(10)).await.unwrap());
    let removed = cache.clear().await;
    assert_eq!(removed.total(), 1);
    assert_eq!(removed.local, 0);
}
