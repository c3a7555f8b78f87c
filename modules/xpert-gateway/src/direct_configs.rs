//! Direct-Config Store: hand-added proxy links that bypass the feed
//! pipeline and are always served, unranked.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

use crate::errors::{GatewayError, GatewayResult};
use crate::jsonstore::JsonStore;
use crate::models::{CreateDirectConfigRequest, DirectConfig, MoveDirection};
use crate::parser::parse_link;
use crate::prober::Prober;

/// Fixed 33-country regional-indicator table used to stick a flag emoji to
/// a direct config whose link carries no flag of its own.
const FLAG_TABLE: [&str; 33] = [
    "🇺🇸", "🇬🇧", "🇩🇪", "🇫🇷", "🇳🇱", "🇯🇵", "🇸🇬", "🇭🇰", "🇰🇷", "🇨🇦", "🇦🇺", "🇨🇭", "🇸🇪",
    "🇳🇴", "🇫🇮", "🇩🇰", "🇵🇱", "🇮🇹", "🇪🇸", "🇵🇹", "🇮🇪", "🇦🇹", "🇧🇪", "🇮🇳", "🇧🇷", "🇦🇪",
    "🇹🇷", "🇷🇺", "🇿🇦", "🇲🇽", "🇦🇷", "🇮🇱", "🇹🇼",
];

fn is_regional_indicator(c: char) -> bool {
    ('\u{1F1E6}'..='\u{1F1FF}').contains(&c)
}

/// Extract a leading two-codepoint regional-indicator flag sequence from
/// `label`, if present anywhere in it.
fn extract_flag_emoji(label: &str) -> Option<String> {
    let chars: Vec<char> = label.chars().collect();
    for window in chars.windows(2) {
        if is_regional_indicator(window[0]) && is_regional_indicator(window[1]) {
            return Some(window.iter().collect());
        }
    }
    None
}

fn random_flag() -> String {
    FLAG_TABLE
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("🏳️")
        .to_string()
}

/// Rewrite the raw link's label field (URI fragment, or vmess `ps`) in
/// place, preserving every other field byte-identically.
fn rewrite_label(raw: &str, new_label: &str) -> String {
    if let Some(scheme_end) = raw.find("://") {
        let scheme = &raw[..scheme_end];
        if scheme.eq_ignore_ascii_case("vmess") {
            return rewrite_vmess_label(raw, new_label).unwrap_or_else(|| raw.to_string());
        }
    }
    // URI-style links: replace or append the #fragment.
    let encoded = percent_encode(new_label);
    match raw.find('#') {
        Some(idx) => format!("{}#{}", &raw[..idx], encoded),
        None => format!("{raw}#{encoded}"),
    }
}

fn rewrite_vmess_label(raw: &str, new_label: &str) -> Option<String> {
    let body = raw.strip_prefix("vmess://")?;
    let decoded = crate::parser::lenient_base64_decode(body)?;
    let mut obj: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    obj.as_object_mut()?
        .insert("ps".to_string(), serde_json::Value::String(new_label.to_string()));
    let reencoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, obj.to_string());
    Some(format!("vmess://{reencoded}"))
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectConfigsFile {
    configs: Vec<DirectConfig>,
}

pub struct DirectConfigStore {
    store: JsonStore<DirectConfigsFile>,
    next_tick_id: AtomicI64,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
}

const REFRESH_THROTTLE_SECS: i64 = 120;

impl DirectConfigStore {
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let store = JsonStore::load(path).await;
        let max_id = store.read(|f| f.configs.iter().map(|c| c.id).max().unwrap_or(0)).await;
        Self {
            store,
            next_tick_id: AtomicI64::new(max_id + 1),
            last_refresh: Mutex::new(None),
        }
    }

    pub async fn list(&self) -> Vec<DirectConfig> {
        self.store.read(|f| f.configs.clone()).await
    }

    pub async fn add(&self, req: CreateDirectConfigRequest) -> GatewayResult<DirectConfig> {
        let parsed = parse_link(&req.raw_link)
            .ok_or_else(|| GatewayError::Validation("unrecognized link format".into()))?;
        let id = self.next_tick_id.fetch_add(1, Ordering::SeqCst);
        let flag = extract_flag_emoji(&parsed.label).unwrap_or_else(random_flag);
        let now = Utc::now();
        let config = DirectConfig {
            id,
            protocol: parsed.protocol,
            host: parsed.host,
            port: parsed.port,
            label: String::new(),
            raw_link: parsed.raw,
            latency_ms: crate::models::DEAD_LATENCY_MS,
            jitter_ms: 0.0,
            packet_loss: 100.0,
            is_active: false,
            last_check: now,
            added_by: req.added_by.unwrap_or_else(|| "admin".to_string()),
            added_at: now,
            bypass_whitelist: true,
            auto_sync: true,
            flag_emoji: flag,
        };
        self.store.modify(|f| f.configs.push(config)).await?;
        self.renumber().await?;
        self.get(id).await
    }

    /// Replace the underlying link of an existing entry, keeping its id,
    /// `added_by`/`added_at`, and sticky flag emoji. The new link is
    /// re-probed on the next `refresh_all_pings` pass, not inline.
    pub async fn update(&self, id: i64, raw_link: &str) -> GatewayResult<DirectConfig> {
        let parsed = parse_link(raw_link)
            .ok_or_else(|| GatewayError::Validation("unrecognized link format".into()))?;
        let updated = self
            .store
            .modify(|f| {
                f.configs.iter_mut().find(|c| c.id == id).map(|c| {
                    c.protocol = parsed.protocol;
                    c.host = parsed.host.clone();
                    c.port = parsed.port;
                    c.raw_link = parsed.raw.clone();
                    c.latency_ms = crate::models::DEAD_LATENCY_MS;
                    c.is_active = false;
                    c.packet_loss = 100.0;
                })
            })
            .await?;
        if updated.is_none() {
            return Err(GatewayError::NotFound(format!("direct config {id}")));
        }
        self.renumber().await?;
        self.get(id).await
    }

    pub async fn delete(&self, id: i64) -> GatewayResult<()> {
        let existed = self
            .store
            .modify(|f| {
                let before = f.configs.len();
                f.configs.retain(|c| c.id != id);
                before != f.configs.len()
            })
            .await?;
        if !existed {
            return Err(GatewayError::NotFound(format!("direct config {id}")));
        }
        self.renumber().await
    }

    pub async fn toggle(&self, id: i64) -> GatewayResult<DirectConfig> {
        let result = self
            .store
            .modify(|f| {
                f.configs
                    .iter_mut()
                    .find(|c| c.id == id)
                    .map(|c| c.is_active = !c.is_active)
            })
            .await?;
        if result.is_none() {
            return Err(GatewayError::NotFound(format!("direct config {id}")));
        }
        self.get(id).await
    }

    /// Single-item move: shift by one slot in `direction`, clamped at the
    /// ends of the list.
    pub async fn move_one(&self, id: i64, direction: MoveDirection) -> GatewayResult<()> {
        self.store
            .modify(|f| {
                if let Some(pos) = f.configs.iter().position(|c| c.id == id) {
                    let new_pos = match direction {
                        MoveDirection::Up if pos > 0 => pos - 1,
                        MoveDirection::Down if pos + 1 < f.configs.len() => pos + 1,
                        _ => pos,
                    };
                    if new_pos != pos {
                        f.configs.swap(pos, new_pos);
                    }
                    true
                } else {
                    false
                }
            })
            .await?
            .then_some(())
            .ok_or_else(|| GatewayError::NotFound(format!("direct config {id}")))?;
        self.renumber().await
    }

    /// Block-move: every selected id shifts one slot in `direction`,
    /// preserving relative order within the selected and unselected groups.
    pub async fn batch_move(&self, ids: &[i64], direction: MoveDirection) -> GatewayResult<()> {
        self.store
            .modify(|f| {
                let selected: std::collections::HashSet<i64> = ids.iter().copied().collect();
                let n = f.configs.len();
                let order: Vec<usize> = (0..n).collect();
                let new_order = block_move(&order, |i| selected.contains(&f.configs[*i].id), direction);
                let reordered: Vec<DirectConfig> =
                    new_order.into_iter().map(|i| f.configs[i].clone()).collect();
                f.configs = reordered;
            })
            .await?;
        self.renumber().await
    }

    pub async fn refresh_all_pings(&self, prober: &Prober, force: bool) -> GatewayResult<()> {
        {
            let mut last = self.last_refresh.lock().await;
            if !force {
                if let Some(at) = *last {
                    if (Utc::now() - at).num_seconds() < REFRESH_THROTTLE_SECS {
                        return Ok(());
                    }
                }
            }
            *last = Some(Utc::now());
        }

        let targets = self.store.read(|f| f.configs.clone()).await;
        let mut results = Vec::with_capacity(targets.len());
        for config in &targets {
            let parsed_is_tls = parse_link(&config.raw_link)
                .map(|p| p.is_tls)
                .unwrap_or(false);
            let probe = prober.probe(&config.host, config.port, parsed_is_tls).await;
            results.push((config.id, probe));
        }

        self.store
            .modify(|f| {
                for (id, probe) in results {
                    if let Some(c) = f.configs.iter_mut().find(|c| c.id == id) {
                        c.latency_ms = probe.latency_ms;
                        let is_active =
                            probe.ok && probe.latency_ms < crate::models::DEAD_LATENCY_MS;
                        c.packet_loss = if is_active { 0.0 } else { 100.0 };
                        c.is_active = is_active;
                        c.last_check = Utc::now();
                    }
                }
            })
            .await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> GatewayResult<DirectConfig> {
        self.store
            .read(|f| f.configs.iter().find(|c| c.id == id).cloned())
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("direct config {id}")))
    }

    /// Re-run the auto-naming pass over the whole list: label becomes
    /// `"{flag} SR-NNN"` by 1-based position, and the raw link's label
    /// field is rewritten to match.
    async fn renumber(&self) -> GatewayResult<()> {
        self.store
            .modify(|f| {
                for (idx, config) in f.configs.iter_mut().enumerate() {
                    let label = format!("{} SR-{:03}", config.flag_emoji, idx + 1);
                    config.raw_link = rewrite_label(&config.raw_link, &label);
                    config.label = label;
                }
            })
            .await?;
        Ok(())
    }
}

/// Classic block-move: shift every item for which `is_selected` holds one
/// slot toward `direction`, stopping at the boundary, while keeping the
/// relative order within both the selected and unselected groups intact.
fn block_move<F: Fn(&usize) -> bool>(order: &[usize], is_selected: F, direction: MoveDirection) -> Vec<usize> {
    let n = order.len();
    let mut result = order.to_vec();
    match direction {
        MoveDirection::Down => {
            for i in (0..n.saturating_sub(1)).rev() {
                if is_selected(&result[i]) && !is_selected(&result[i + 1]) {
                    result.swap(i, i + 1);
                }
            }
        }
        MoveDirection::Up => {
            for i in 1..n {
                if is_selected(&result[i]) && !is_selected(&result[i - 1]) {
                    result.swap(i, i - 1);
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_move_down_preserves_relative_order() {
        // ids [1,2,3,4,5] at positions 0..5; select positions of ids 2 and 4 (idx 1, 3).
        let order = vec![0usize, 1, 2, 3, 4];
        let ids = [10, 20, 30, 40, 50];
        let selected = |i: &usize| ids[*i] == 20 || ids[*i] == 40;
        let moved = block_move(&order, selected, MoveDirection::Down);
        let result_ids: Vec<i64> = moved.iter().map(|i| ids[*i]).collect();
        assert_eq!(result_ids, vec![10, 30, 20, 50, 40]);
    }

    #[test]
    fn extract_flag_emoji_finds_regional_indicator_pair() {
        let label = "🇺🇸 US Node";
        assert_eq!(extract_flag_emoji(label), Some("🇺🇸".to_string()));
    }

    #[test]
    fn extract_flag_emoji_none_when_absent() {
        assert_eq!(extract_flag_emoji("Plain Node"), None);
    }

    #[tokio::test]
    async fn add_then_delete_renumbers_remaining_labels() {
        let dir = std::env::temp_dir().join(format!("direct-configs-test-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let store = DirectConfigStore::load(dir.join("direct.json")).await;

        let a = store
            .add(CreateDirectConfigRequest {
                raw_link: "vless://u@host1:443?security=tls#A".into(),
                added_by: None,
            })
            .await
            .unwrap();
        let b = store
            .add(CreateDirectConfigRequest {
                raw_link: "vless://u@host2:443?security=tls#B".into(),
                added_by: None,
            })
            .await
            .unwrap();

        assert!(a.label.ends_with("SR-001"));
        assert!(b.label.ends_with("SR-002"));

        store.delete(a.id).await.unwrap();
        let remaining = store.list().await;
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].label.ends_with("SR-001"));
    }
}
