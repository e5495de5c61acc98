//! Admission gate in front of every route.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error};

use crate::metrics::{KEY_EXTRACTION_FAILURES, REQUESTS_ADMITTED, REQUESTS_REJECTED};
use crate::rate_limit::VisitorRegistry;

// Client key = IP of the peer, port dropped
fn client_key(request: &Request) -> Option<String> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Reject with 500 when the caller's address is unknown, 429 when its bucket
/// is empty, otherwise pass the request on.
///
/// Use with `axum::middleware::from_fn_with_state`. The router must be served
/// with `into_make_service_with_connect_info::<SocketAddr>()`.
pub async fn admission(
    State(registry): State<Arc<VisitorRegistry>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(key) = client_key(&request) else {
        KEY_EXTRACTION_FAILURES.inc();
        error!(uri = %request.uri(), "Could not determine client address");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
    };

    if !registry.check_and_admit(&key) {
        REQUESTS_REJECTED.inc();
        debug!(key = %key, "Rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }

    REQUESTS_ADMITTED.inc();
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, middleware::from_fn_with_state, routing::get};
    use tower::ServiceExt;

    fn app(registry: Arc<VisitorRegistry>) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(registry, admission))
    }

    fn request_from(addr: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/");
        if let Some(addr) = addr {
            let addr: SocketAddr = addr.parse().unwrap();
            builder = builder.extension(ConnectInfo(addr));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_address_is_server_error() {
        let registry = Arc::new(VisitorRegistry::new(5, 1.0));
        let response = app(registry.clone()).oneshot(request_from(None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_after_burst() {
        let registry = Arc::new(VisitorRegistry::new(2, 1.0));
        let app = app(registry.clone());

        for _ in 0..2 {
            let response = app.clone().oneshot(request_from(Some("10.1.1.1:4000"))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        // different port, same client
        let response = app.clone().oneshot(request_from(Some("10.1.1.1:5000"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.clone().oneshot(request_from(Some("10.1.1.2:4000"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        let response = app.oneshot(request_from(Some("10.1.1.1:4000"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_one_registry_entry_per_client() {
        let registry = Arc::new(VisitorRegistry::new(5, 1.0));
        let app = app(registry.clone());

        app.clone().oneshot(request_from(Some("[::1]:80"))).await.unwrap();
        app.oneshot(request_from(Some("[::1]:81"))).await.unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.contains("::1"));
    }
}
