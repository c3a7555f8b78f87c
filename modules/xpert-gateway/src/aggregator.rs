//! Aggregation Orchestrator.
//!
//! `update_subscription()` is the sole write path to the aggregated
//! snapshot: it fetches every enabled source, parses and probes each line,
//! and atomically swaps the published snapshot. A background scheduler
//! loop drives it on a fixed interval with `max_instances=1` semantics — a
//! tick that finds the previous one still running logs and returns rather
//! than queuing.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use crate::envelope::create_xpert_envelope;
use crate::marzban::MarzbanClient;
use crate::models::{AggregatedConfig, SubscriptionSource};
use crate::outbox::enqueue_event;
use crate::parser::{contains_known_scheme, lenient_base64_decode, parse_link};
use crate::prober::Prober;
use crate::sources::SourceRegistry;

/// Bound on concurrent per-source fetch+probe work during one tick.
const SOURCE_FETCH_CONCURRENCY: usize = 8;

/// Maximum nested base64-unwrap attempts when a feed body isn't already
/// plaintext line-delimited links.
const MAX_BASE64_UNWRAP_ATTEMPTS: usize = 3;

/// Lock-free published snapshot: readers clone the `Arc` and never block
/// the aggregation tick; the tick swaps the whole pointer on completion so
/// clients never observe a partial merge.
pub struct Snapshot {
    inner: ArcSwap<Vec<AggregatedConfig>>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn load(&self) -> Arc<Vec<AggregatedConfig>> {
        self.inner.load_full()
    }

    fn swap(&self, configs: Vec<AggregatedConfig>) {
        self.inner.store(Arc::new(configs));
    }

    /// Cascade-delete: drop every config belonging to `source_id` from the
    /// current snapshot immediately, rather than waiting for the next tick.
    pub fn remove_source(&self, source_id: i64) {
        let current = self.load();
        let retained: Vec<AggregatedConfig> = current
            .iter()
            .filter(|c| c.source_id != source_id)
            .cloned()
            .collect();
        self.swap(retained);
    }
}

pub struct AggregationOrchestrator {
    http: reqwest::Client,
    pool: sqlx::PgPool,
    sources: Arc<SourceRegistry>,
    prober: Arc<Prober>,
    marzban: Arc<dyn MarzbanClient>,
    snapshot: Arc<Snapshot>,
    source_fetch_timeout: Duration,
    tick_timeout: Duration,
    marzban_fallback_tag: Option<String>,
    /// `max_instances=1` guard.
    running: Mutex<()>,
}

impl AggregationOrchestrator {
    pub fn new(
        pool: sqlx::PgPool,
        sources: Arc<SourceRegistry>,
        prober: Arc<Prober>,
        marzban: Arc<dyn MarzbanClient>,
        snapshot: Arc<Snapshot>,
        source_fetch_timeout: Duration,
        tick_timeout: Duration,
        marzban_fallback_tag: Option<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent("Xpert/1.0 (+subscription-aggregator)")
            .build()
            .expect("reqwest client builds with a static config");
        Self {
            http,
            pool,
            sources,
            prober,
            marzban,
            snapshot,
            source_fetch_timeout,
            tick_timeout,
            marzban_fallback_tag,
            running: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.clone()
    }

    /// Spawn the periodic tick loop. Runs for the lifetime of the process.
    pub fn spawn_scheduler(self: Arc<Self>, interval_secs: u64) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                self.clone().run_tick_if_idle().await;
            }
        });
    }

    /// `max_instances=1`: if a tick is already in flight, this one is
    /// dropped rather than queued.
    async fn run_tick_if_idle(self: Arc<Self>) {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::warn!("aggregation tick already running, skipping this firing");
            return;
        };
        match tokio::time::timeout(self.tick_timeout, self.update_subscription()).await {
            Ok(Ok(report)) => {
                tracing::info!(
                    configs = report.configs_ensured,
                    sources = report.sources_processed,
                    "aggregation tick complete"
                );
            }
            Ok(Err(e)) => tracing::error!(error = %e, "aggregation tick failed"),
            Err(_) => tracing::error!("aggregation tick exceeded its outer deadline"),
        }
    }

    /// Force one tick outside the scheduler (the `POST /xpert/update` admin
    /// action). Subject to the same `max_instances=1` guard.
    pub async fn force_tick(self: &Arc<Self>) -> Result<TickReport, crate::errors::GatewayError> {
        let Ok(_guard) = self.running.try_lock() else {
            return Err(crate::errors::GatewayError::Conflict(
                "aggregation tick already running".into(),
            ));
        };
        tokio::time::timeout(self.tick_timeout, self.update_subscription())
            .await
            .map_err(|_| crate::errors::GatewayError::Timeout)?
    }

    /// Fetches every enabled source, parses and probes each feed, and
    /// atomically republishes the merged snapshot.
    async fn update_subscription(&self) -> Result<TickReport, crate::errors::GatewayError> {
        let enabled = self.sources.list_enabled().await;
        let next_id = AtomicI64::new(1);

        let per_source = stream::iter(enabled.into_iter())
            .map(|source| self.process_source(source, &next_id))
            .buffer_unordered(SOURCE_FETCH_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let mut configs = Vec::new();
        let mut sources_processed = 0usize;
        for result in per_source {
            sources_processed += 1;
            configs.extend(result);
        }

        // Atomic, all-or-nothing replace.
        self.snapshot.swap(configs.clone());

        // Push-through to Marzban. Individual failures never abort the tick.
        let inbound_tags = std::collections::HashMap::new();
        let active: Vec<AggregatedConfig> = configs.iter().filter(|c| c.is_active).cloned().collect();
        let push_report = match self
            .marzban
            .push_through(&active, &inbound_tags, self.marzban_fallback_tag.as_deref())
            .await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "marzban push-through batch failed");
                crate::marzban::PushThroughReport {
                    hosts_ensured: 0,
                    failures: Vec::new(),
                }
            }
        };

        let report = TickReport {
            sources_processed,
            configs_ensured: configs.len(),
            active_configs: active.len(),
            marzban_hosts_ensured: push_report.hosts_ensured,
            marzban_failures: push_report.failures.len(),
        };

        let envelope = create_xpert_envelope(
            uuid::Uuid::new_v4(),
            "xpert-gateway".to_string(),
            None,
            serde_json::json!({
                "sources_processed": report.sources_processed,
                "configs_ensured": report.configs_ensured,
                "active_configs": report.active_configs,
            }),
        );
        if let Err(e) = enqueue_event(&self.pool, "xpert.aggregation.tick_completed", &envelope).await {
            tracing::warn!(error = %e, "failed to enqueue aggregation-tick-completed event");
        }

        Ok(report)
    }

    /// Fetch, decode, parse and probe every link from one source. Never
    /// returns an `Err`: on a fetch/parse/probe failure the source is
    /// logged, its success-rate metadata is marked 0, and the tick moves on
    /// to the next source.
    async fn process_source(
        &self,
        source: SubscriptionSource,
        next_id: &AtomicI64,
    ) -> Vec<AggregatedConfig> {
        let body = match self.fetch_body(&source.url).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(source = source.id, url = source.url, error = %e, "source fetch failed");
                let _ = self.sources.update_metadata(source.id, 0).await;
                return Vec::new();
            }
        };

        let lines = decode_feed_body(&body);
        let mut configs = Vec::with_capacity(lines.len());
        for line in &lines {
            let Some(parsed) = parse_link(line) else {
                continue; // unparseable link, silently skipped
            };
            let probe = self.prober.probe(&parsed.host, parsed.port, parsed.is_tls).await;
            let is_active = probe.ok
                && probe.latency_ms < crate::models::DEAD_LATENCY_MS
                && probe.latency_ms.is_finite();
            configs.push(AggregatedConfig {
                id: next_id.fetch_add(1, Ordering::SeqCst),
                protocol: parsed.protocol,
                host: parsed.host,
                port: parsed.port,
                label: parsed.label,
                source_id: source.id,
                raw_link: parsed.raw,
                latency_ms: probe.latency_ms,
                jitter_ms: 0.0,
                packet_loss: if is_active { 0.0 } else { 100.0 },
                is_active,
                last_check: chrono::Utc::now(),
            });
        }

        let _ = self.sources.update_metadata(source.id, configs.len() as i64).await;
        configs
    }

    /// Fetch with a 30s timeout, accepting only 200. TLS verification is
    /// disabled on `self.http` itself.
    async fn fetch_body(&self, url: &str) -> Result<String, FetchError> {
        let response = tokio::time::timeout(self.source_fetch_timeout, self.http.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Http)?;
        response
            .error_for_status()
            .map_err(FetchError::Http)?
            .text()
            .await
            .map_err(FetchError::Http)
    }
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("source fetch timed out")]
    Timeout,
    #[error("source fetch failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub sources_processed: usize,
    pub configs_ensured: usize,
    pub active_configs: usize,
    pub marzban_hosts_ensured: usize,
    pub marzban_failures: usize,
}

/// If the body already contains a known scheme prefix, treat it as
/// line-delimited as-is. Otherwise try a base64-unwrap up to 3 times,
/// stopping as soon as a decoded layer contains a scheme.
fn decode_feed_body(body: &str) -> Vec<String> {
    if contains_known_scheme(body) {
        return split_lines(body);
    }
    let mut layer = body.to_string();
    for _ in 0..MAX_BASE64_UNWRAP_ATTEMPTS {
        let Some(decoded) = lenient_base64_decode(&layer) else {
            break;
        };
        let Ok(text) = String::from_utf8(decoded) else {
            break;
        };
        if contains_known_scheme(&text) {
            return split_lines(&text);
        }
        layer = text;
    }
    Vec::new()
}

fn split_lines(body: &str) -> Vec<String> {
    body.lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_feed_body_passes_through_plaintext_links() {
        let body = "vless://u@h:443#A\ntrojan://p@h2:443#B";
        let lines = decode_feed_body(body);
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn decode_feed_body_unwraps_one_base64_layer() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let inner = "trojan://p@h:443#X\nss://u@h2:8388#Y";
        let wrapped = STANDARD.encode(inner);
        let lines = decode_feed_body(&wrapped);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "trojan://p@h:443#X");
    }

    #[test]
    fn decode_feed_body_gives_up_after_three_layers_of_garbage() {
        let garbage = "not a link and not valid base64 either!!";
        assert!(decode_feed_body(garbage).is_empty());
    }

    #[tokio::test]
    async fn snapshot_swap_is_visible_to_concurrent_readers() {
        let snapshot = Snapshot::empty();
        assert!(snapshot.load().is_empty());
        snapshot.swap(vec![]);
        let reader = snapshot.load();
        snapshot.swap(vec![]);
        // The reader's handle to the old (empty) Vec stays valid even after
        // a concurrent swap — this is the point of the Arc-swap pointer.
        assert!(reader.is_empty());
    }
}
