use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

pub const DEAD_LATENCY_MS: f64 = 999.0;
pub const EOF_DURING_HANDSHAKE_LATENCY_MS: f64 = 1200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
    Ssr,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Ssr => "ssr",
        };
        f.write_str(s)
    }
}

/// A parsed link, the output of the Link Parser.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLink {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub label: String,
    pub is_tls: bool,
    pub raw: String,
}

// ============================================================================
// Source Registry
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSource {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub priority: i32,
    pub last_fetched: Option<DateTime<Utc>>,
    pub last_config_count: i64,
    pub last_success_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSourceRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Aggregated / Direct configs
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedConfig {
    pub id: i64,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub label: String,
    pub source_id: i64,
    pub raw_link: String,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
    pub is_active: bool,
    pub last_check: DateTime<Utc>,
}

impl AggregatedConfig {
    pub fn invariant_holds(&self) -> bool {
        !self.is_active || (self.latency_ms < DEAD_LATENCY_MS && self.packet_loss < 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectConfig {
    pub id: i64,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub label: String,
    pub raw_link: String,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
    pub is_active: bool,
    pub last_check: DateTime<Utc>,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
    /// Always true: direct configs bypass feed filtering by construction.
    pub bypass_whitelist: bool,
    /// Always true: direct configs are auto-renamed on every mutation.
    pub auto_sync: bool,
    /// Sticky flag emoji (regional-indicator pair) used by the auto-naming pass.
    pub flag_emoji: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDirectConfigRequest {
    pub raw_link: String,
    #[serde(default)]
    pub added_by: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchMoveRequest {
    pub ids: Vec<i64>,
    pub direction: MoveDirection,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveDirection {
    Up,
    Down,
}

// ============================================================================
// Policy Store
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriberPolicy {
    pub required_hwid: Option<String>,
    pub max_unique_hwid: Option<u8>,
    #[serde(default)]
    pub seen_hwids: Vec<String>,
    #[serde(default)]
    pub ip_window: HashMap<String, DateTime<Utc>>,
    pub unique_ip_limit: Option<u32>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SubscriberPolicy {
    pub fn seen_hwid_set(&self) -> HashSet<&str> {
        self.seen_hwids.iter().map(|s| s.as_str()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyStoreFile {
    pub policies: HashMap<String, SubscriberPolicy>,
}

// ============================================================================
// Traffic
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrafficRecord {
    pub id: i64,
    pub user_token: String,
    pub server: String,
    pub port: i32,
    pub date_collected: NaiveDate,
    pub protocol: String,
    pub bytes_uploaded: i64,
    pub bytes_downloaded: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficWebhookRequest {
    pub user_token: String,
    pub server: String,
    pub port: i32,
    pub protocol: String,
    pub bytes_uploaded: i64,
    pub bytes_downloaded: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStatsRow {
    pub server: String,
    pub port: i32,
    pub protocol: String,
    pub total_uploaded: i64,
    pub total_downloaded: i64,
    pub row_count: i64,
    pub last_seen: DateTime<Utc>,
}

// ============================================================================
// Admin Action Log
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminActionLog {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub admin_id: Option<String>,
    pub admin_username: String,
    pub action: String,
    pub target_type: String,
    pub target_username: Option<String>,
    pub meta: serde_json::Value,
}

// ============================================================================
// Subscription Publisher
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionFormat {
    #[default]
    Universal,
    Base64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SubscriptionQuery {
    #[serde(default)]
    pub format: SubscriptionFormat,
    /// Only populated on the `/xpert/...` mirror routes, which carry the
    /// token as a query parameter instead of a path segment.
    pub token: Option<String>,
}

// ============================================================================
// Admin endpoint wire types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateDirectConfigRequest {
    pub raw_link: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchAddDirectConfigsRequest {
    pub raw_links: Vec<String>,
    #[serde(default)]
    pub added_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchAddResult {
    pub added: Vec<DirectConfig>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoveRequest {
    pub direction: MoveDirection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingRefreshRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HwidResetRequest {
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpLimitQuery {
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetIpLimitRequest {
    pub username: String,
    pub limit: u32,
}

/// `POST /xpert/crypto-link`: wraps a raw link with an access policy and
/// mints a subscriber token. A real deployment would hand this off to an
/// external signing service; the token minted here is a self-contained
/// stand-in consistent with `TokenResolver`.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoLinkRequest {
    pub username: String,
    pub raw_link: String,
    pub required_hwid: Option<String>,
    pub max_unique_hwid: Option<u8>,
    pub unique_ip_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CryptoLinkResponse {
    pub token: String,
    pub raw_link: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaysQuery {
    #[serde(default = "default_days")]
    pub days: i64,
}

fn default_days() -> i64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerStatsQuery {
    pub server: String,
    pub port: i32,
    #[serde(default = "default_days")]
    pub days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserStatsQuery {
    pub token: String,
    #[serde(default = "default_days")]
    pub days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminQuotaCheckQuery {
    pub limit_bytes: i64,
}
