//! Admin bearer-token extractor.
//!
//! There is no JWT issuance subsystem behind this service, so "the admin"
//! is represented as a single shared bearer token compared against the
//! `Authorization` header, with the caller's identity (for audit-log
//! purposes only) carried in `X-Admin-Username`.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

const DEFAULT_ADMIN_USERNAME: &str = "admin";

#[derive(Debug, Clone)]
pub struct AdminIdentity {
    pub username: String,
}

pub struct AdminAuthRejected;

impl IntoResponse for AdminAuthRejected {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, "missing or invalid admin bearer token").into_response()
    }
}

impl<S> FromRequestParts<S> for AdminIdentity
where
    S: Send + Sync,
    String: FromRef<S>,
{
    type Rejection = AdminAuthRejected;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let configured_token = String::from_ref(state);
        let presented = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match presented {
            Some(token) if token == configured_token => {
                let username = parts
                    .headers
                    .get("x-admin-username")
                    .and_then(|v| v.to_str().ok())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_ADMIN_USERNAME)
                    .to_string();
                Ok(AdminIdentity { username })
            }
            _ => Err(AdminAuthRejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Request};

    async fn extract(token_header: Option<&str>, username_header: Option<&str>, configured: &str) -> Result<AdminIdentity, AdminAuthRejected> {
        let mut req = Request::builder().uri("/").body(()).unwrap();
        if let Some(t) = token_header {
            req.headers_mut().insert(
                axum::http::header::AUTHORIZATION,
                HeaderValue::from_str(t).unwrap(),
            );
        }
        if let Some(u) = username_header {
            req.headers_mut()
                .insert("x-admin-username", HeaderValue::from_str(u).unwrap());
        }
        let (mut parts, ()) = req.into_parts();
        AdminIdentity::from_request_parts(&mut parts, &configured.to_string()).await
    }

    #[tokio::test]
    async fn correct_token_is_accepted_with_default_username() {
        let identity = extract(Some("Bearer secret"), None, "secret").await.unwrap();
        assert_eq!(identity.username, "admin");
    }

    #[tokio::test]
    async fn custom_username_header_is_honored() {
        let identity = extract(Some("Bearer secret"), Some("alice"), "secret").await.unwrap();
        assert_eq!(identity.username, "alice");
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        assert!(extract(Some("Bearer wrong"), None, "secret").await.is_err());
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        assert!(extract(None, None, "secret").await.is_err());
    }
}
