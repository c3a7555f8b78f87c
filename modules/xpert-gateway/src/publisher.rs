//! Subscription Publisher.

use axum::http::{HeaderMap, HeaderValue};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::models::{AggregatedConfig, DirectConfig, SubscriptionFormat};

pub struct PublishedSubscription {
    pub body: String,
    pub headers: HeaderMap,
}

/// Build the client-facing feed body: active aggregated configs followed by
/// active direct configs, one raw link per line, in stored order.
pub fn build_body(
    aggregated: &[AggregatedConfig],
    direct: &[DirectConfig],
    format: SubscriptionFormat,
    direct_only: bool,
) -> String {
    let mut lines: Vec<&str> = Vec::new();
    if !direct_only {
        lines.extend(aggregated.iter().filter(|c| c.is_active).map(|c| c.raw_link.as_str()));
    }
    lines.extend(direct.iter().filter(|c| c.is_active).map(|c| c.raw_link.as_str()));
    let plain = lines.join("\n");
    match format {
        SubscriptionFormat::Universal => plain,
        SubscriptionFormat::Base64 => STANDARD.encode(plain),
    }
}

pub fn build_headers(title: &str, upload: i64, download: i64, total: i64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        "Profile-Update-Interval",
        HeaderValue::from_static("1"),
    );
    headers.insert(
        "Profile-Title",
        HeaderValue::from_str(title).unwrap_or_else(|_| HeaderValue::from_static("Xpert")),
    );
    headers.insert(
        "Subscription-Userinfo",
        HeaderValue::from_str(&format!(
            "upload={upload}; download={download}; total={total}; expire=0"
        ))
        .unwrap_or_else(|_| HeaderValue::from_static("upload=0; download=0; total=0; expire=0")),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;
    use chrono::Utc;

    fn sample_aggregated(active: bool, raw: &str) -> AggregatedConfig {
        AggregatedConfig {
            id: 1,
            protocol: Protocol::Vless,
            host: "h".into(),
            port: 443,
            label: "x".into(),
            source_id: 1,
            raw_link: raw.into(),
            latency_ms: 50.0,
            jitter_ms: 0.0,
            packet_loss: 0.0,
            is_active: active,
            last_check: Utc::now(),
        }
    }

    #[test]
    fn inactive_configs_are_excluded_from_body() {
        let configs = vec![sample_aggregated(true, "A"), sample_aggregated(false, "B")];
        let body = build_body(&configs, &[], SubscriptionFormat::Universal, false);
        assert_eq!(body, "A");
    }

    #[test]
    fn base64_format_wraps_the_whole_body() {
        let configs = vec![sample_aggregated(true, "A")];
        let body = build_body(&configs, &[], SubscriptionFormat::Base64, false);
        assert_eq!(STANDARD.decode(body).unwrap(), b"A");
    }

    #[test]
    fn direct_only_excludes_aggregated_configs() {
        let aggregated = vec![sample_aggregated(true, "A")];
        let body = build_body(&aggregated, &[], SubscriptionFormat::Universal, true);
        assert_eq!(body, "");
    }
}
