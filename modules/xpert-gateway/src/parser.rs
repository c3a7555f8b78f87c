//! Link Parser.
//!
//! Decodes one proxy link of a known scheme into a `ParsedLink`. Never
//! panics and never returns an `Err` — parse failure is `None`, matching
//! the upstream behavior of "skip the line, keep going".

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;

use crate::models::{ParsedLink, Protocol};

const TLS_PORTS: [u16; 6] = [443, 8443, 2053, 2083, 2087, 2096];
const TLS_SUBSTRINGS: [&str; 6] = [
    "security=tls",
    "security=reality",
    "tls=1",
    "type=grpc",
    "sni=",
    "alpn=",
];

/// Lenient base64 decode: right-pads to a multiple of 4 and tries both the
/// standard and URL-safe alphabets, since upstream feeds mix both.
pub fn lenient_base64_decode(input: &str) -> Option<Vec<u8>> {
    let trimmed: String = input.trim().chars().filter(|c| !c.is_whitespace()).collect();
    if trimmed.is_empty() {
        return None;
    }
    let pad = (4 - trimmed.len() % 4) % 4;
    let padded = format!("{trimmed}{}", "=".repeat(pad));

    STANDARD
        .decode(&padded)
        .or_else(|_| URL_SAFE.decode(&padded))
        .ok()
}

fn url_decode(s: &str) -> String {
    percent_decode_utf8(s).unwrap_or_else(|| s.to_string())
}

fn percent_decode_utf8(s: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(s.len());
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            b'%' if i + 2 < b.len() => {
                let hex = std::str::from_utf8(&b[i + 1..i + 3]).ok()?;
                let byte = u8::from_str_radix(hex, 16).ok()?;
                bytes.push(byte);
                i += 3;
            }
            b'+' => {
                bytes.push(b' ');
                i += 1;
            }
            other => {
                bytes.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(bytes).ok()
}

/// Minimal `scheme://[userinfo@]host[:port][#fragment]` splitter. The proxy
/// link schemes handled here (vless/trojan/ss) never need query-string
/// structure beyond substring checks for TLS detection, so a full URI crate
/// would be more generality than this format needs.
struct SimpleUri<'a> {
    host: &'a str,
    port: Option<u16>,
    fragment: Option<&'a str>,
}

fn parse_simple_uri(after_scheme: &str) -> Option<SimpleUri<'_>> {
    let (authority_and_path, fragment) = match after_scheme.split_once('#') {
        Some((a, f)) => (a, Some(f)),
        None => (after_scheme, None),
    };
    // Strip query string and path, keep only the authority.
    let authority = authority_and_path
        .split(['?', '/'])
        .next()
        .unwrap_or(authority_and_path);
    let authority = match authority.rsplit_once('@') {
        Some((_userinfo, rest)) => rest,
        None => authority,
    };
    if authority.is_empty() {
        return None;
    }
    // IPv6 literal: [::1]:443
    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, rest) = stripped.split_once(']')?;
        let port = rest.strip_prefix(':').and_then(|p| p.parse().ok());
        return Some(SimpleUri {
            host,
            port,
            fragment,
        });
    }
    match authority.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str.parse().ok();
            Some(SimpleUri {
                host,
                port,
                fragment,
            })
        }
        None => Some(SimpleUri {
            host: authority,
            port: None,
            fragment,
        }),
    }
}

fn contains_tls_substring(raw: &str) -> bool {
    let lower = raw.to_lowercase();
    TLS_SUBSTRINGS.iter().any(|needle| lower.contains(needle))
}

fn detect_tls(protocol: Protocol, port: u16, raw: &str, vmess_tls: Option<bool>) -> bool {
    if let Some(v) = vmess_tls {
        return v;
    }
    if protocol == Protocol::Trojan {
        return true;
    }
    if TLS_PORTS.contains(&port) {
        return true;
    }
    contains_tls_substring(raw)
}

fn vmess_indicates_tls(obj: &serde_json::Value) -> bool {
    let tls_field = obj
        .get("tls")
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase());
    let scy_field = obj
        .get("scy")
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase());
    let tls_truthy = matches!(tls_field.as_deref(), Some("tls") | Some("reality") | Some("1") | Some("true"))
        || obj.get("tls").and_then(|v| v.as_bool()) == Some(true);
    let scy_truthy = matches!(scy_field.as_deref(), Some("tls") | Some("reality"));
    let has_tls_fields = ["sni", "alpn", "fp", "pbk"]
        .iter()
        .any(|k| obj.get(*k).and_then(|v| v.as_str()).is_some_and(|s| !s.is_empty()));
    tls_truthy || scy_truthy || has_tls_fields
}

fn parse_vless_or_trojan_or_ss(raw: &str, protocol: Protocol, after_scheme: &str) -> Option<ParsedLink> {
    let uri = parse_simple_uri(after_scheme)?;
    let host = uri.host.to_string();
    let port = uri.port.unwrap_or(443);
    let label = uri
        .fragment
        .map(url_decode)
        .unwrap_or_default();
    let is_tls = detect_tls(protocol, port, raw, None);
    Some(ParsedLink {
        protocol,
        host,
        port,
        label,
        is_tls,
        raw: raw.to_string(),
    })
}

fn parse_ssr(raw: &str, body: &str) -> Option<ParsedLink> {
    let decoded = lenient_base64_decode(body)?;
    let text = String::from_utf8(decoded).ok()?;
    let mut parts = text.splitn(6, ':');
    let host = parts.next()?.to_string();
    let port: u16 = parts.next()?.parse().ok()?;
    let is_tls = detect_tls(Protocol::Ssr, port, raw, None);
    Some(ParsedLink {
        protocol: Protocol::Ssr,
        host,
        port,
        label: String::new(),
        is_tls,
        raw: raw.to_string(),
    })
}

fn parse_vmess(raw: &str, body: &str) -> Option<ParsedLink> {
    let decoded = lenient_base64_decode(body)?;
    let obj: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let host = obj.get("add")?.as_str()?.to_string();
    let port: u16 = obj
        .get("port")
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(443) as u16;
    let label = obj
        .get("ps")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let vmess_tls = Some(vmess_indicates_tls(&obj));
    let is_tls = detect_tls(Protocol::Vmess, port, raw, vmess_tls);
    Some(ParsedLink {
        protocol: Protocol::Vmess,
        host,
        port,
        label,
        is_tls,
        raw: raw.to_string(),
    })
}

/// Dispatch on scheme prefix. Returns `None` on any parse failure; never
/// panics, never propagates an error.
pub fn parse_link(raw: &str) -> Option<ParsedLink> {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix("vless://") {
        return parse_vless_or_trojan_or_ss(raw, Protocol::Vless, rest);
    }
    if let Some(rest) = raw.strip_prefix("trojan://") {
        return parse_vless_or_trojan_or_ss(raw, Protocol::Trojan, rest);
    }
    if let Some(rest) = raw.strip_prefix("ss://") {
        return parse_vless_or_trojan_or_ss(raw, Protocol::Shadowsocks, rest);
    }
    if let Some(rest) = raw.strip_prefix("ssr://") {
        return parse_ssr(raw, rest);
    }
    if let Some(rest) = raw.strip_prefix("vmess://") {
        return parse_vmess(raw, rest);
    }
    None
}

fn scheme_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(vless|vmess|trojan|ss|ssr)://").unwrap())
}

/// True if `body` contains any of the five known scheme prefixes anywhere
/// in its text — used by the aggregator to decide whether a fetched feed
/// body is already plaintext or needs a base64 unwrap pass first.
pub fn contains_known_scheme(body: &str) -> bool {
    scheme_regex().is_match(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vless_with_tls_query_flag() {
        let link = parse_link("vless://uuid@host.example:443?security=tls#My%20Node").unwrap();
        assert_eq!(link.protocol, Protocol::Vless);
        assert_eq!(link.host, "host.example");
        assert_eq!(link.port, 443);
        assert_eq!(link.label, "My Node");
        assert!(link.is_tls);
    }

    #[test]
    fn trojan_is_always_tls_even_on_nonstandard_port() {
        let link = parse_link("trojan://pw@host:12345#x").unwrap();
        assert!(link.is_tls);
    }

    #[test]
    fn vless_default_port_is_443() {
        let link = parse_link("vless://uuid@host.example#x").unwrap();
        assert_eq!(link.port, 443);
    }

    #[test]
    fn vmess_decodes_base64_json_and_detects_tls() {
        let json = serde_json::json!({
            "add": "vm.example",
            "port": 8443,
            "ps": "Vmess Node",
            "tls": "tls",
        });
        let encoded = STANDARD.encode(json.to_string());
        let raw = format!("vmess://{encoded}");
        let link = parse_link(&raw).unwrap();
        assert_eq!(link.host, "vm.example");
        assert_eq!(link.port, 8443);
        assert_eq!(link.label, "Vmess Node");
        assert!(link.is_tls);
    }

    #[test]
    fn vmess_missing_tls_fields_is_not_tls_on_plain_port() {
        let json = serde_json::json!({"add": "vm.example", "port": 80, "ps": "x"});
        let encoded = STANDARD.encode(json.to_string());
        let link = parse_link(&format!("vmess://{encoded}")).unwrap();
        assert!(!link.is_tls);
    }

    #[test]
    fn ssr_splits_host_and_port_from_decoded_body() {
        let body = URL_SAFE.encode("host.example:8388:origin:aes-256-cfb:plain:cGFzcw");
        let link = parse_link(&format!("ssr://{body}")).unwrap();
        assert_eq!(link.host, "host.example");
        assert_eq!(link.port, 8388);
    }

    #[test]
    fn unknown_scheme_returns_none() {
        assert!(parse_link("http://example.com").is_none());
    }

    #[test]
    fn malformed_vmess_json_returns_none_not_panic() {
        let encoded = STANDARD.encode("not json");
        assert!(parse_link(&format!("vmess://{encoded}")).is_none());
    }

    #[test]
    fn lenient_base64_tolerates_missing_padding_and_both_alphabets() {
        let standard = STANDARD.encode("hello world");
        let trimmed: String = standard.trim_end_matches('=').to_string();
        assert_eq!(lenient_base64_decode(&trimmed).unwrap(), b"hello world");

        let url_safe = URL_SAFE.encode("hello>world?");
        let trimmed = url_safe.trim_end_matches('=').to_string();
        assert_eq!(lenient_base64_decode(&trimmed).unwrap(), b"hello>world?");
    }

    #[test]
    fn contains_known_scheme_is_case_insensitive() {
        assert!(contains_known_scheme("VLESS://foo"));
        assert!(!contains_known_scheme("plain text body"));
    }
}
