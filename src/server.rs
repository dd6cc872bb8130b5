use crate::config::Config;
use crate::error::Result;
use crate::handlers::{
    cache_stats, delete_cache_key, flush_cache, health_check, metrics, rate_limit_status,
    readiness_check, reset_rate_limit, AppState,
};
use crate::middleware::{logging_middleware, rate_limit_middleware};
use crate::runtime::Runtime;
use axum::routing::{delete, get};
use axum::{middleware, Router};
use std::net::SocketAddr;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Operator router. Admin routes sit behind the rate-limit gate; health,
/// readiness and metrics do not.
pub fn create_app(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache", delete(flush_cache))
        .route("/admin/cache/:key", delete(delete_cache_key))
        .route(
            "/admin/rate-limits/:action/:identifier",
            get(rate_limit_status).delete(reset_rate_limit),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .merge(admin)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    runtime: Runtime,
}

impl Server {
    pub fn new(config: &Config, runtime: Runtime) -> Self {
        let app = create_app(AppState::from_runtime(&runtime));
        Self {
            app,
            bind_addr: config.bind_addr,
            runtime,
        }
    }

    /// Serve until Ctrl+C or SIGTERM, then stop the sweeper.
    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("pacekeeper listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Readiness check available at /ready");

        let served = axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        self.runtime.shutdown().await;
        served?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
