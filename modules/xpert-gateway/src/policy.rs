//! Policy Store: HWID gating and unique-IP rolling-window throttling.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::errors::GatewayResult;
use crate::jsonstore::JsonStore;
use crate::models::{PolicyStoreFile, SubscriberPolicy};

const IP_WINDOW: ChronoDuration = ChronoDuration::hours(2);
const DEFAULT_UNIQUE_IP_LIMIT: u32 = 3;

/// Legacy split HWID-lock file, merged in additively at startup and never
/// written back to.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LegacyHwidLocks {
    #[serde(default)]
    pub locks: HashMap<String, String>,
}

pub struct PolicyStore {
    store: JsonStore<PolicyStoreFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl PolicyStore {
    pub async fn load(path: impl AsRef<Path>, legacy_path: impl AsRef<Path>) -> Self {
        let store: JsonStore<PolicyStoreFile> = JsonStore::load(path).await;
        if let Ok(bytes) = tokio::fs::read(legacy_path.as_ref()).await {
            if let Ok(legacy) = serde_json::from_slice::<LegacyHwidLocks>(&bytes) {
                let _ = store
                    .modify(|f| {
                        for (username, hwid) in legacy.locks {
                            let entry = f.policies.entry(username).or_default();
                            if entry.required_hwid.is_none() {
                                entry.required_hwid = Some(hwid);
                            }
                        }
                    })
                    .await;
            }
        }
        Self { store }
    }

    /// HWID strict-lock + N-device-pool check. Absent policy fields default
    /// to allow. A presented hwid is case-insensitive, whitespace-trimmed.
    pub async fn check_hwid(&self, username: &str, presented: Option<&str>) -> GatewayResult<Decision> {
        let presented = presented.map(|h| h.trim().to_lowercase());

        let decision = self
            .store
            .modify(|f| {
                let Some(policy) = f.policies.get_mut(username) else {
                    return Decision::Allow;
                };

                let required = policy.required_hwid.as_ref().map(|h| h.trim().to_lowercase());
                let max_pool = policy.max_unique_hwid;

                if required.is_none() && max_pool.is_none() {
                    return Decision::Allow;
                }

                let Some(presented) = presented.clone() else {
                    return Decision::Deny;
                };

                // Strict lock with no pool: the single required hwid is the
                // only acceptable value.
                let Some(max_pool) = max_pool else {
                    return if required.as_deref() == Some(presented.as_str()) {
                        Decision::Allow
                    } else {
                        Decision::Deny
                    };
                };

                // Pool set (optionally alongside a strict lock, which stays
                // implicitly inside the pool).
                let already_seen = policy
                    .seen_hwids
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(&presented));
                if already_seen {
                    policy.updated_at = Some(Utc::now());
                    return Decision::Allow;
                }
                if (policy.seen_hwids.len() as u8) < max_pool {
                    policy.seen_hwids.push(presented);
                    policy.updated_at = Some(Utc::now());
                    Decision::Allow
                } else {
                    Decision::Deny
                }
            })
            .await?;
        Ok(decision)
    }

    /// Unique-IP rolling-window check. Prunes stale entries, then allows or
    /// denies based on whether the presented IP is already tracked and
    /// whether the window still has room.
    pub async fn check_ip_window(&self, username: &str, client_ip: &str) -> GatewayResult<Decision> {
        let now = Utc::now();
        let decision = self
            .store
            .modify(|f| {
                let Some(policy) = f.policies.get_mut(username) else {
                    return Decision::Allow;
                };
                if policy.unique_ip_limit.is_none() && policy.ip_window.is_empty() {
                    return Decision::Allow;
                }
                let limit = policy.unique_ip_limit.unwrap_or(DEFAULT_UNIQUE_IP_LIMIT);

                prune_ip_window(&mut policy.ip_window, now);

                if policy.ip_window.contains_key(client_ip) {
                    policy.ip_window.insert(client_ip.to_string(), now);
                    policy.updated_at = Some(now);
                    return Decision::Allow;
                }
                if (policy.ip_window.len() as u32) < limit {
                    policy.ip_window.insert(client_ip.to_string(), now);
                    policy.updated_at = Some(now);
                    Decision::Allow
                } else {
                    Decision::Deny
                }
            })
            .await?;
        Ok(decision)
    }

    pub async fn set_hwid_pool_limit(&self, username: &str, limit: u8) -> GatewayResult<()> {
        self.store
            .modify(|f| {
                f.policies.entry(username.to_string()).or_default().max_unique_hwid = Some(limit);
            })
            .await?;
        Ok(())
    }

    pub async fn set_required_hwid(&self, username: &str, hwid: &str) -> GatewayResult<()> {
        self.store
            .modify(|f| {
                f.policies.entry(username.to_string()).or_default().required_hwid =
                    Some(hwid.to_string());
            })
            .await?;
        Ok(())
    }

    pub async fn set_unique_ip_limit(&self, username: &str, limit: u32) -> GatewayResult<()> {
        self.store
            .modify(|f| {
                f.policies.entry(username.to_string()).or_default().unique_ip_limit = Some(limit);
            })
            .await?;
        Ok(())
    }

    pub async fn reset_hwid(&self, username: &str) -> GatewayResult<()> {
        self.store
            .modify(|f| {
                if let Some(policy) = f.policies.get_mut(username) {
                    policy.required_hwid = None;
                    policy.seen_hwids.clear();
                }
            })
            .await?;
        Ok(())
    }

    pub async fn get_policy(&self, username: &str) -> Option<SubscriberPolicy> {
        self.store.read(|f| f.policies.get(username).cloned()).await
    }
}

fn prune_ip_window(window: &mut HashMap<String, DateTime<Utc>>, now: DateTime<Utc>) {
    let cutoff = now - IP_WINDOW;
    window.retain(|_, ts| *ts >= cutoff);
}

/// Client IP extraction precedence: `X-Real-IP`, then the first entry of
/// `X-Forwarded-For`, then the transport peer.
pub fn extract_client_ip(headers: &axum::http::HeaderMap, peer: Option<std::net::SocketAddr>) -> Option<String> {
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            return Some(first.to_string());
        }
    }
    peer.map(|p| p.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PolicyStore {
        let dir = std::env::temp_dir().join(format!("policy-test-{}", uuid_like()));
        let _ = std::fs::remove_dir_all(&dir);
        PolicyStore::load(dir.join("policy.json"), dir.join("legacy.json")).await
    }

    fn uuid_like() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }

    #[tokio::test]
    async fn absent_policy_defaults_to_allow() {
        let s = store().await;
        assert_eq!(s.check_hwid("nobody", None).await.unwrap(), Decision::Allow);
        assert_eq!(
            s.check_ip_window("nobody", "1.1.1.1").await.unwrap(),
            Decision::Allow
        );
    }

    #[tokio::test]
    async fn hwid_strict_lock_denies_missing_header() {
        let s = store().await;
        s.set_required_hwid("alice", "abc123").await.unwrap();
        assert_eq!(s.check_hwid("alice", None).await.unwrap(), Decision::Deny);
        assert_eq!(
            s.check_hwid("alice", Some(" ABC123 ")).await.unwrap(),
            Decision::Allow
        );
    }

    #[tokio::test]
    async fn hwid_pool_fills_then_denies_then_allows_known_device() {
        let s = store().await;
        s.set_hwid_pool_limit("bob", 2).await.unwrap();
        assert_eq!(s.check_hwid("bob", Some("a")).await.unwrap(), Decision::Allow);
        assert_eq!(s.check_hwid("bob", Some("b")).await.unwrap(), Decision::Allow);
        assert_eq!(s.check_hwid("bob", Some("c")).await.unwrap(), Decision::Deny);
        assert_eq!(s.check_hwid("bob", Some("a")).await.unwrap(), Decision::Allow);
    }

    #[tokio::test]
    async fn ip_window_denies_fourth_distinct_ip_default_limit() {
        let s = store().await;
        s.set_unique_ip_limit("carol", 3).await.unwrap();
        assert_eq!(s.check_ip_window("carol", "1.1.1.1").await.unwrap(), Decision::Allow);
        assert_eq!(s.check_ip_window("carol", "2.2.2.2").await.unwrap(), Decision::Allow);
        assert_eq!(s.check_ip_window("carol", "3.3.3.3").await.unwrap(), Decision::Allow);
        assert_eq!(s.check_ip_window("carol", "4.4.4.4").await.unwrap(), Decision::Deny);
        assert_eq!(s.check_ip_window("carol", "1.1.1.1").await.unwrap(), Decision::Allow);
    }

    #[test]
    fn client_ip_precedence_prefers_x_real_ip_then_forwarded_for_then_peer() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-forwarded-for", "9.9.9.9, 8.8.8.8".parse().unwrap());
        headers.insert("x-real-ip", "1.2.3.4".parse().unwrap());
        assert_eq!(extract_client_ip(&headers, None), Some("1.2.3.4".to_string()));

        headers.remove("x-real-ip");
        assert_eq!(extract_client_ip(&headers, None), Some("9.9.9.9".to_string()));

        headers.remove("x-forwarded-for");
        let peer: std::net::SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(extract_client_ip(&headers, Some(peer)), Some("127.0.0.1".to_string()));
    }
}
