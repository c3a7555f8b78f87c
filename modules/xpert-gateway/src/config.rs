use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            _ => {
                tracing::warn!("Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Process-wide configuration, built once in `main` and passed down by
/// reference/`Arc` rather than read from the environment at use sites.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub database_url: String,
    pub nats_url: Option<String>,

    /// Directory holding the JSON-backed stores (sources, direct configs,
    /// aggregated snapshot, policy, legacy hwid-locks).
    pub state_dir: PathBuf,

    /// Shared bearer token standing in for a full admin auth subsystem.
    pub admin_token: String,

    /// Aggregation tick interval, seconds.
    pub aggregation_interval_secs: u64,

    /// Outer deadline for one full aggregation tick, seconds.
    pub aggregation_tick_timeout_secs: u64,

    /// Per-source feed fetch timeout, seconds.
    pub source_fetch_timeout_secs: u64,

    /// Per-endpoint probe timeout, milliseconds.
    pub probe_timeout_ms: u64,

    /// Operator-nominated target IPs used for the latency overlay.
    pub target_ips: Vec<String>,

    /// Fallback Marzban inbound tag used when no better match exists.
    pub marzban_fallback_tag: Option<String>,
    pub marzban_base_url: Option<String>,
    pub marzban_api_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus_type = BusType::from_env();
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let nats_url = match bus_type {
            BusType::Nats => Some(env_or("NATS_URL", "nats://localhost:4222")),
            BusType::InMemory => None,
        };

        let state_dir = PathBuf::from(env_or("XPERT_STATE_DIR", "./data/xpert"));

        let admin_token = env::var("XPERT_ADMIN_TOKEN")
            .map_err(|_| "XPERT_ADMIN_TOKEN must be set".to_string())?;

        let target_ips = env::var("XPERT_TARGET_IPS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bus_type,
            database_url,
            nats_url,
            state_dir,
            admin_token,
            aggregation_interval_secs: env_parse("XPERT_AGGREGATION_INTERVAL_SECS", 300),
            aggregation_tick_timeout_secs: env_parse("XPERT_AGGREGATION_TICK_TIMEOUT_SECS", 300),
            source_fetch_timeout_secs: env_parse("XPERT_SOURCE_FETCH_TIMEOUT_SECS", 30),
            probe_timeout_ms: env_parse("XPERT_PROBE_TIMEOUT_MS", 2500),
            target_ips,
            marzban_fallback_tag: env::var("MARZBAN_FALLBACK_INBOUND_TAG").ok(),
            marzban_base_url: env::var("MARZBAN_BASE_URL").ok(),
            marzban_api_token: env::var("MARZBAN_API_TOKEN").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn from_env_rejects_missing_database_url() {
        env::remove_var("DATABASE_URL");
        env::remove_var("XPERT_ADMIN_TOKEN");
        let err = Config::from_env().unwrap_err();
        assert!(err.contains("DATABASE_URL"));
    }

    #[test]
    #[serial]
    fn from_env_rejects_missing_admin_token() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::remove_var("XPERT_ADMIN_TOKEN");
        let err = Config::from_env().unwrap_err();
        assert!(err.contains("XPERT_ADMIN_TOKEN"));
        env::remove_var("DATABASE_URL");
    }
}
