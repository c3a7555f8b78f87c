//! Boundary E2E Test: HTTP Subscription Gating
//!
//! - GET /sub/{token} with no policy set serves an (empty) subscription body.
//! - A HWID-locked subscriber is denied without the required header and
//!   allowed with it.
//! - Admin routes reject requests without the bearer token and accept them
//!   with it.

mod common;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use serial_test::serial;
use tower::ServiceExt;

/// `ConnectInfo<SocketAddr>` is normally populated by
/// `into_make_service_with_connect_info` at the transport layer; in a
/// `oneshot` test there is no transport, so it's inserted directly into the
/// request extensions the same way the make-service would.
fn with_fake_peer(mut req: Request<Body>) -> Request<Body> {
    let peer: std::net::SocketAddr = "203.0.113.5:54321".parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(peer));
    req
}

#[tokio::test]
#[serial]
async fn subscription_without_policy_is_served() {
    let pool = common::get_test_pool().await;
    common::cleanup(&pool).await;
    let app = common::app(&pool).await;

    let response = app
        .oneshot(with_fake_peer(
            Request::builder()
                .uri("/sub/a-long-enough-token")
                .body(Body::empty())
                .unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
#[serial]
async fn hwid_locked_subscriber_is_denied_without_header_and_allowed_with_it() {
    let pool = common::get_test_pool().await;
    common::cleanup(&pool).await;
    let app = common::app(&pool).await;

    let token = "hwidlockedusername";

    let set_lock = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/xpert/crypto-link")
                .header("authorization", format!("Bearer {}", common::ADMIN_TOKEN))
                .header("content-type", "application/json")
                .body(common::json_body(serde_json::json!({
                    "username": token,
                    "raw_link": "vless://u@h:443#A",
                    "required_hwid": "device-abc",
                })))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(set_lock.status(), StatusCode::OK);

    let denied = app
        .clone()
        .oneshot(with_fake_peer(
            Request::builder()
                .uri(format!("/sub/{token}"))
                .body(Body::empty())
                .unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let allowed = app
        .oneshot(with_fake_peer(
            Request::builder()
                .uri(format!("/sub/{token}"))
                .header("x-hwid", "device-abc")
                .body(Body::empty())
                .unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    common::cleanup(&pool).await;
}

#[tokio::test]
#[serial]
async fn admin_routes_require_bearer_token() {
    let pool = common::get_test_pool().await;
    common::cleanup(&pool).await;
    let app = common::app(&pool).await;

    let unauthenticated = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/xpert/sources")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

    let authenticated = app
        .oneshot(
            Request::builder()
                .uri("/xpert/sources")
                .header("authorization", format!("Bearer {}", common::ADMIN_TOKEN))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(authenticated.status(), StatusCode::OK);
}
