// CORS, tracing and request logging middleware

use axum::{
    body::Body,
    http::{header, HeaderValue, Method, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Request logging middleware
///
/// Tags each request with a short id and logs method, path, status and
/// latency once the handler has answered. Login waits make some requests very
/// slow, so the id ties the two log lines together.
pub async fn request_log_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    tracing::debug!("[{}] {} {}", request_id, method, path);
    let response = next.run(request).await;

    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();
    if status.is_success() {
        tracing::info!(
            "[{}] {} {} -> {} ({}ms)",
            request_id,
            method,
            path,
            status.as_u16(),
            elapsed_ms
        );
    } else {
        tracing::warn!(
            "[{}] {} {} -> {} ({}ms)",
            request_id,
            method,
            path,
            status.as_u16(),
            elapsed_ms
        );
    }
    response
}

/// Create CORS middleware layer
///
/// Only the configured UI origins may read responses from a browser. Other
/// origins get no `access-control-allow-origin` header. OPTIONS preflight
/// requests are answered by the layer.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let methods = [Method::GET, Method::POST];
    if origins.iter().any(|origin| origin.trim() == "*") {
        return CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods(methods)
            .allow_headers([header::CONTENT_TYPE]);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(methods)
        .allow_headers([header::CONTENT_TYPE])
}

/// HTTP-level tracing spans for inbound requests
pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use tower::util::ServiceExt;

    async fn test_handler() -> &'static str {
        "OK"
    }

    fn create_test_app() -> Router {
        Router::new()
            .route("/test", get(test_handler))
            .layer(axum::middleware::from_fn(request_log_middleware))
            .layer(cors_layer(&["http://localhost:5173".to_string()]))
    }

    #[tokio::test]
    async fn test_request_log_middleware_passes_response_through() {
        let app = create_test_app();

        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_cors_echoes_configured_origin() {
        let app = create_test_app();

        let request = Request::builder()
            .uri("/test")
            .header(header::ORIGIN, "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );
    }

    #[tokio::test]
    async fn test_cors_ignores_foreign_origin() {
        let app = create_test_app();

        let request = Request::builder()
            .uri("/test")
            .header(header::ORIGIN, "https://evil.example")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn test_cors_wildcard_opt_in() {
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(cors_layer(&["*".to_string()]));

        let request = Request::builder()
            .uri("/test")
            .header(header::ORIGIN, "https://elsewhere.example")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }

    #[tokio::test]
    async fn test_cors_answers_preflight() {
        let app = create_test_app();

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/test")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }
}
