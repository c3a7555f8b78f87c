//! Marzban push-through. Marzban itself is an external host-inventory
//! service; this module only implements the write-through contract the
//! aggregation tick drives against it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{AggregatedConfig, Protocol};

#[derive(Debug, thiserror::Error)]
pub enum MarzbanError {
    #[error("marzban request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("marzban push-through not configured")]
    NotConfigured,
}

/// One config's push-through failure, collected rather than aborting the
/// whole batch.
#[derive(Debug, Clone, Serialize)]
pub struct PushFailure {
    pub config_id: i64,
    pub host: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushThroughReport {
    pub hosts_ensured: usize,
    pub failures: Vec<PushFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProxyHostPayload {
    remark: String,
    address: String,
    port: u16,
    inbound_tag: String,
    sni: String,
    host: String,
    security: String,
    alpn: String,
    fingerprint: String,
}

#[async_trait]
pub trait MarzbanClient: Send + Sync {
    async fn push_through(
        &self,
        configs: &[AggregatedConfig],
        inbound_tags: &HashMap<String, Vec<String>>,
        fallback_tag: Option<&str>,
    ) -> Result<PushThroughReport, MarzbanError>;

    async fn cleanup_inactive_hosts(
        &self,
        active_addresses: &[String],
    ) -> Result<usize, MarzbanError>;
}

/// Resolves an inbound tag for `(protocol, port)`: the configured fallback,
/// else the first existing tag matching the protocol, else a synthesized
/// `{protocol}-in-{port}`.
pub fn resolve_inbound_tag(
    protocol: Protocol,
    port: u16,
    fallback_tag: Option<&str>,
    existing_tags_by_protocol: &HashMap<String, Vec<String>>,
) -> String {
    if let Some(tag) = fallback_tag {
        return tag.to_string();
    }
    if let Some(tags) = existing_tags_by_protocol.get(&protocol.to_string()) {
        if let Some(first) = tags.first() {
            return first.clone();
        }
    }
    format!("{}-in-{}", protocol, port)
}

/// Per-protocol TLS/SNI/ALPN defaults. Shadowsocks is the one exception: no
/// TLS, no SNI, no ALPN negotiation.
fn tls_defaults(protocol: Protocol) -> (&'static str, &'static str, &'static str) {
    match protocol {
        Protocol::Shadowsocks => ("none", "", "none"),
        _ => ("tls", "chrome", "h2,http/1.1"),
    }
}

pub struct HttpMarzbanClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl HttpMarzbanClient {
    pub fn new(base_url: String, api_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_token,
        }
    }

    fn host_payload(
        &self,
        config: &AggregatedConfig,
        inbound_tag: &str,
    ) -> ProxyHostPayload {
        let (security, fingerprint, alpn) = tls_defaults(config.protocol);
        let sni = if security == "none" {
            String::new()
        } else {
            config.host.clone()
        };
        ProxyHostPayload {
            remark: config.label.clone(),
            address: config.host.clone(),
            port: config.port,
            inbound_tag: inbound_tag.to_string(),
            sni,
            host: config.host.clone(),
            security: security.to_string(),
            alpn: alpn.to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }
}

#[async_trait]
impl MarzbanClient for HttpMarzbanClient {
    async fn push_through(
        &self,
        configs: &[AggregatedConfig],
        inbound_tags: &HashMap<String, Vec<String>>,
        fallback_tag: Option<&str>,
    ) -> Result<PushThroughReport, MarzbanError> {
        let mut groups: HashMap<(Protocol, u16), Vec<&AggregatedConfig>> = HashMap::new();
        for config in configs.iter().filter(|c| c.is_active) {
            groups
                .entry((config.protocol, config.port))
                .or_default()
                .push(config);
        }

        let mut failures = Vec::new();
        let mut hosts_ensured = 0usize;

        for ((protocol, port), group) in groups {
            let inbound_tag = resolve_inbound_tag(protocol, port, fallback_tag, inbound_tags);

            for config in group {
                let payload = self.host_payload(config, &inbound_tag);
                let url = format!("{}/api/hosts", self.base_url);

                let result = self
                    .http
                    .post(&url)
                    .bearer_auth(&self.api_token)
                    .json(&payload)
                    .send()
                    .await
                    .and_then(|resp| resp.error_for_status());

                match result {
                    Ok(_) => hosts_ensured += 1,
                    Err(e) => {
                        tracing::warn!(
                            host = config.host,
                            error = %e,
                            "marzban push-through failed for host"
                        );
                        failures.push(PushFailure {
                            config_id: config.id,
                            host: config.host.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(PushThroughReport {
            hosts_ensured,
            failures,
        })
    }

    async fn cleanup_inactive_hosts(
        &self,
        active_addresses: &[String],
    ) -> Result<usize, MarzbanError> {
        let url = format!("{}/api/hosts", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?
            .error_for_status()?;

        #[derive(Deserialize)]
        struct ExistingHost {
            id: i64,
            address: String,
        }

        let existing: Vec<ExistingHost> = resp.json().await?;
        let mut removed = 0usize;

        for host in existing {
            if !active_addresses.contains(&host.address) {
                let del_url = format!("{}/api/hosts/{}", self.base_url, host.id);
                if let Err(e) = self
                    .http
                    .delete(&del_url)
                    .bearer_auth(&self.api_token)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                {
                    tracing::warn!(address = host.address, error = %e, "orphan host cleanup failed");
                    continue;
                }
                removed += 1;
            }
        }

        Ok(removed)
    }
}

/// Used when Marzban integration is not configured: the aggregation tick
/// still runs, push-through is simply a no-op.
pub struct NoopMarzbanClient;

#[async_trait]
impl MarzbanClient for NoopMarzbanClient {
    async fn push_through(
        &self,
        _configs: &[AggregatedConfig],
        _inbound_tags: &HashMap<String, Vec<String>>,
        _fallback_tag: Option<&str>,
    ) -> Result<PushThroughReport, MarzbanError> {
        Ok(PushThroughReport {
            hosts_ensured: 0,
            failures: Vec::new(),
        })
    }

    async fn cleanup_inactive_hosts(
        &self,
        _active_addresses: &[String],
    ) -> Result<usize, MarzbanError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_defaults_exempt_shadowsocks() {
        let (security, fingerprint, alpn) = tls_defaults(Protocol::Shadowsocks);
        assert_eq!(security, "none");
        assert_eq!(fingerprint, "");
        assert_eq!(alpn, "none");

        let (security, fingerprint, alpn) = tls_defaults(Protocol::Vless);
        assert_eq!(security, "tls");
        assert_eq!(fingerprint, "chrome");
        assert_eq!(alpn, "h2,http/1.1");
    }

    #[test]
    fn resolve_inbound_tag_prefers_fallback() {
        let tags = HashMap::new();
        let tag = resolve_inbound_tag(Protocol::Vless, 443, Some("custom-tag"), &tags);
        assert_eq!(tag, "custom-tag");
    }

    #[test]
    fn resolve_inbound_tag_falls_back_to_existing_protocol_tag() {
        let mut tags = HashMap::new();
        tags.insert("vless".to_string(), vec!["vless-primary".to_string()]);
        let tag = resolve_inbound_tag(Protocol::Vless, 443, None, &tags);
        assert_eq!(tag, "vless-primary");
    }

    #[test]
    fn resolve_inbound_tag_synthesizes_when_nothing_matches() {
        let tags = HashMap::new();
        let tag = resolve_inbound_tag(Protocol::Trojan, 8443, None, &tags);
        assert_eq!(tag, "trojan-in-8443");
    }
}
