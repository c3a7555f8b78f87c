//! Reachability Prober.
//!
//! `probe()` is the hot-path operation invoked once per parsed link during
//! an aggregation tick. It never returns an `Err`: every failure mode
//! (timeout, connection refused, TLS EOF) collapses into a `(false, sentinel)`
//! pair so the aggregator can keep going without matching on error types.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::models::{DEAD_LATENCY_MS, EOF_DURING_HANDSHAKE_LATENCY_MS};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2500);
const TARGET_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub ok: bool,
    pub latency_ms: f64,
}

impl ProbeResult {
    fn dead() -> Self {
        Self {
            ok: false,
            latency_ms: DEAD_LATENCY_MS,
        }
    }

    fn eof_during_handshake() -> Self {
        Self {
            ok: false,
            latency_ms: EOF_DURING_HANDSHAKE_LATENCY_MS,
        }
    }

    fn success(latency_ms: f64) -> Self {
        Self {
            ok: true,
            latency_ms: latency_ms.max(1.0),
        }
    }
}

/// Accepts any certificate chain and any hostname. This is a reachability
/// probe, not a trust decision — never reuse this connector for traffic.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn insecure_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn resolve_first_addr(host: &str, port: u16) -> Option<std::net::SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

async fn tcp_connect_probe(host: &str, port: u16, deadline: Duration) -> ProbeResult {
    let Some(addr) = resolve_first_addr(host, port) else {
        return ProbeResult::dead();
    };
    let start = Instant::now();
    match timeout(deadline, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => ProbeResult::success(start.elapsed().as_secs_f64() * 1000.0),
        _ => ProbeResult::dead(),
    }
}

async fn tls_handshake_probe(host: &str, port: u16, deadline: Duration) -> ProbeResult {
    let Some(addr) = resolve_first_addr(host, port) else {
        return ProbeResult::dead();
    };
    let server_name = match ServerName::try_from(host.to_string()) {
        Ok(name) => name,
        Err(_) => return ProbeResult::dead(),
    };

    let connector = insecure_connector();
    let start = Instant::now();
    let attempt = timeout(deadline, async move {
        let tcp = TcpStream::connect(addr).await?;
        connector.connect(server_name, tcp).await
    })
    .await;

    match attempt {
        Ok(Ok(_tls_stream)) => ProbeResult::success(start.elapsed().as_secs_f64() * 1000.0),
        Ok(Err(e)) => {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProbeResult::eof_during_handshake()
            } else {
                ProbeResult::dead()
            }
        }
        Err(_elapsed) => ProbeResult::dead(),
    }
}

/// Process-wide cache of target-IP TLS latency, TTL 30s. Benign
/// last-writer-wins races are acceptable.
pub struct TargetIpCache {
    targets: Vec<String>,
    entries: Mutex<HashMap<String, (Instant, ProbeResult)>>,
}

impl TargetIpCache {
    pub fn new(targets: Vec<String>) -> Self {
        Self {
            targets,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn refresh_if_stale(&self, host: &str) {
        let fresh = {
            let entries = self.entries.lock().await;
            entries
                .get(host)
                .is_some_and(|(at, _)| at.elapsed() < TARGET_CACHE_TTL)
        };
        if fresh {
            return;
        }
        let result = tls_handshake_probe(host, 443, DEFAULT_PROBE_TIMEOUT).await;
        self.entries
            .lock()
            .await
            .insert(host.to_string(), (Instant::now(), result));
    }

    /// Average latency of the cached target probes, `None` if empty or all
    /// failed (an empty overlay means "endpoint result only").
    async fn targets_avg_latency_ms(&self) -> Option<f64> {
        if self.targets.is_empty() {
            return None;
        }
        for target in &self.targets {
            self.refresh_if_stale(target).await;
        }
        let entries = self.entries.lock().await;
        let successes: Vec<f64> = self
            .targets
            .iter()
            .filter_map(|t| entries.get(t))
            .filter(|(_, r)| r.ok)
            .map(|(_, r)| r.latency_ms)
            .collect();
        if successes.is_empty() {
            None
        } else {
            Some(successes.iter().sum::<f64>() / successes.len() as f64)
        }
    }
}

pub struct Prober {
    timeout: Duration,
    target_cache: TargetIpCache,
}

impl Prober {
    pub fn new(timeout_ms: u64, target_ips: Vec<String>) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            target_cache: TargetIpCache::new(target_ips),
        }
    }

    /// Strategy choice is driven entirely by `is_tls`: a TLS handshake
    /// probe when set, a plain TCP connect otherwise.
    pub async fn probe(&self, host: &str, port: u16, is_tls: bool) -> ProbeResult {
        let endpoint = if is_tls {
            tls_handshake_probe(host, port, self.timeout).await
        } else {
            tcp_connect_probe(host, port, self.timeout).await
        };

        if !endpoint.ok {
            return endpoint;
        }

        match self.target_cache.targets_avg_latency_ms().await {
            Some(targets_avg) => {
                ProbeResult::success(0.7 * endpoint.latency_ms + 0.3 * targets_avg)
            }
            None => endpoint,
        }
    }
}

/// ICMP diagnostic entry point, not on the hot probing path. Returns
/// `(latency_ms, jitter_ms, packet_loss_pct)`.
pub async fn check_ping(host: &str) -> (f64, f64, f64) {
    let output = timeout(
        Duration::from_secs(5),
        tokio::process::Command::new("ping")
            .arg("-c")
            .arg("2")
            .arg("-W")
            .arg("2")
            .arg(host)
            .output(),
    )
    .await;

    let Ok(Ok(output)) = output else {
        return (DEAD_LATENCY_MS, 0.0, 100.0);
    };
    if !output.status.success() {
        return (DEAD_LATENCY_MS, 0.0, 100.0);
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_ping_output(&text)
}

fn parse_ping_output(text: &str) -> (f64, f64, f64) {
    let loss = text
        .lines()
        .find(|l| l.contains("packet loss"))
        .and_then(|l| {
            l.split(',')
                .find(|p| p.contains("packet loss"))
                .and_then(|p| p.trim().split('%').next())
                .and_then(|p| p.split_whitespace().last())
                .and_then(|p| p.parse::<f64>().ok())
        })
        .unwrap_or(100.0);

    // "rtt min/avg/max/mdev = 12.3/14.5/16.0/1.2 ms"
    let stats = text
        .lines()
        .find(|l| l.contains("min/avg/max"))
        .and_then(|l| l.split('=').nth(1))
        .map(|s| s.trim());

    let Some(stats) = stats else {
        return (DEAD_LATENCY_MS, 0.0, loss);
    };
    let values: Vec<f64> = stats
        .split_whitespace()
        .next()
        .unwrap_or("")
        .split('/')
        .filter_map(|v| v.parse::<f64>().ok())
        .collect();
    match values.as_slice() {
        [min, avg, max, ..] => (*avg, max - min, loss),
        _ => (DEAD_LATENCY_MS, 0.0, loss),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_latency_is_clamped_to_at_least_one_ms() {
        let r = ProbeResult::success(0.2);
        assert!(r.ok);
        assert!(r.latency_ms >= 1.0);
    }

    #[test]
    fn dead_and_eof_sentinels_are_distinct() {
        assert_eq!(ProbeResult::dead().latency_ms, DEAD_LATENCY_MS);
        assert_eq!(
            ProbeResult::eof_during_handshake().latency_ms,
            EOF_DURING_HANDSHAKE_LATENCY_MS
        );
        assert_ne!(
            ProbeResult::dead().latency_ms,
            ProbeResult::eof_during_handshake().latency_ms
        );
    }

    #[test]
    fn parses_linux_ping_summary() {
        let sample = "PING host (1.2.3.4) 56(84) bytes of data.\n\
            64 bytes from 1.2.3.4: icmp_seq=1 ttl=56 time=12.3 ms\n\
            --- host ping statistics ---\n\
            2 packets transmitted, 2 received, 0% packet loss, time 1001ms\n\
            rtt min/avg/max/mdev = 12.300/14.500/16.000/1.200 ms\n";
        let (avg, jitter, loss) = parse_ping_output(sample);
        assert!((avg - 14.5).abs() < 0.01);
        assert!((jitter - 3.7).abs() < 0.01);
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn unreachable_host_summary_returns_dead_sentinel() {
        let sample = "PING host (1.2.3.4) 56(84) bytes of data.\n\
            --- host ping statistics ---\n\
            2 packets transmitted, 0 received, 100% packet loss, time 1001ms\n";
        let (avg, _jitter, loss) = parse_ping_output(sample);
        assert_eq!(avg, DEAD_LATENCY_MS);
        assert_eq!(loss, 100.0);
    }

    #[tokio::test]
    async fn target_cache_is_empty_overlay_when_no_targets_configured() {
        let cache = TargetIpCache::new(vec![]);
        assert_eq!(cache.targets_avg_latency_ms().await, None);
    }

    #[tokio::test]
    async fn probe_against_closed_local_port_is_dead() {
        let prober = Prober::new(200, vec![]);
        let r = prober.probe("127.0.0.1", 1, false).await;
        assert!(!r.ok);
        assert_eq!(r.latency_ms, DEAD_LATENCY_MS);
    }
}
