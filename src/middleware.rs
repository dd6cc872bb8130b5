use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use tracing::info;

use crate::handlers::{AppState, ADMIN_ACTION};
use crate::identifier::{client_identifier, extract_client_ip};

/// Logging middleware for request/response tracking
pub async fn logging_middleware(
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = get_client_ip(&request);

    info!(
        target: "pacekeeper::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    let status = response.status();
    info!(
        target: "pacekeeper::middleware",
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    response
}

/// Charges every request against the `admin_api` quota. Denied requests get a
/// 429 and never reach the handler.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = peer_ip(&request);
    let identifier = client_identifier(request.headers(), peer.as_deref());

    let admission = match state.limiter.enforce(ADMIN_ACTION, &identifier).await {
        Ok(admission) => admission,
        Err(e) => return e.into_response(),
    };

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if let Some(limit) = admission.limit {
        headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
    }
    if let Some(remaining) = admission.remaining {
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
    }
    if let Some(reset_at) = admission.reset_at {
        headers.insert("X-RateLimit-Reset", HeaderValue::from(reset_at));
    }
    response
}

fn peer_ip(request: &Request) -> Option<String> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .or_else(|| {
            request
                .extensions()
                .get::<SocketAddr>()
                .map(|addr| addr.ip().to_string())
        })
}

fn get_client_ip(request: &Request) -> String {
    extract_client_ip(request.headers(), peer_ip(request).as_deref())
}
