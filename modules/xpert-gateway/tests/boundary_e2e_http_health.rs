//! Boundary E2E Test: HTTP Health Endpoint
//!
//! - GET /health returns the service name and a healthy status, with no
//!   dependency on the database or any of the JSON-backed stores.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use tower::ServiceExt;

use xpert_gateway_rs::health::health;

#[tokio::test]
async fn health_endpoint_reports_service_name() {
    let app: Router = Router::new().route("/health", get(health));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "xpert-gateway");
}
