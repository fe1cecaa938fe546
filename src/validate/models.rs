//! Endpoint, probe result and ranking data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Longest hostname accepted, per RFC 1035.
const MAX_HOST_LEN: usize = 253;

/// Longest single DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Reasons an endpoint candidate is rejected at construction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("port {0} is outside 1..=65535")]
    InvalidPort(u32),
    #[error("invalid host `{0}`")]
    InvalidHost(String),
    #[error("malformed endpoint `{0}`, expected host:port")]
    Malformed(String),
}

/// A candidate forward proxy, identified by its `(host, port)` pair.
///
/// Fields are private so that every value in circulation has passed
/// [`Endpoint::new`] validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawEndpoint")]
pub struct Endpoint {
    host: String,
    port: u16,
}

#[derive(Deserialize)]
struct RawEndpoint {
    host: String,
    port: u16,
}

impl TryFrom<RawEndpoint> for Endpoint {
    type Error = EndpointError;

    fn try_from(raw: RawEndpoint) -> Result<Self, Self::Error> {
        Endpoint::new(raw.host, raw.port)
    }
}

impl Endpoint {
    /// Create an endpoint, rejecting port 0 and syntactically invalid hosts
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, EndpointError> {
        let host = host.into();
        if port == 0 {
            return Err(EndpointError::InvalidPort(0));
        }
        if !is_valid_host(&host) {
            return Err(EndpointError::InvalidHost(host));
        }
        // Hostnames and IPv6 hex digits compare case-insensitively.
        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    /// URL used to route requests through this endpoint as an HTTP proxy
    pub fn proxy_url(&self) -> String {
        format!("http://{}", self)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    /// Parse `host:port` or `[v6]:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let malformed = || EndpointError::Malformed(s.to_string());

        let (host, port) = match s.strip_prefix('[') {
            Some(rest) => rest.split_once("]:").ok_or_else(malformed)?,
            None => {
                let (host, port) = s.rsplit_once(':').ok_or_else(malformed)?;
                if host.contains(':') {
                    return Err(malformed());
                }
                (host, port)
            }
        };

        let port: u32 = port.parse().map_err(|_| malformed())?;
        let port = u16::try_from(port).map_err(|_| EndpointError::InvalidPort(port))?;
        Endpoint::new(host, port)
    }
}

/// Minimal syntactic host check: an IP literal or a dotted hostname.
fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return false;
    }
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    // Dotted quads that failed to parse as an IP are malformed addresses,
    // not hostnames.
    if host.split('.').all(|part| part.chars().all(|c| c.is_ascii_digit())) {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Insertion-ordered set of candidate endpoints, unique by identity
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    seen: HashSet<Endpoint>,
    order: Vec<Endpoint>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an endpoint, returning `false` if it was already present
    pub fn insert(&mut self, endpoint: Endpoint) -> bool {
        if self.seen.insert(endpoint.clone()) {
            self.order.push(endpoint);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.seen.contains(endpoint)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.order.iter()
    }
}

impl FromIterator<Endpoint> for CandidateSet {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        let mut set = CandidateSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<Endpoint> for CandidateSet {
    fn extend<I: IntoIterator<Item = Endpoint>>(&mut self, iter: I) {
        for endpoint in iter {
            self.insert(endpoint);
        }
    }
}

impl IntoIterator for CandidateSet {
    type Item = Endpoint;
    type IntoIter = std::vec::IntoIter<Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.into_iter()
    }
}

/// Why a probe did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    Timeout,
    ConnectionRefused,
    DnsError,
    ProtocolError,
    Other,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::ConnectionRefused => write!(f, "connection refused"),
            FailureReason::DnsError => write!(f, "dns error"),
            FailureReason::ProtocolError => write!(f, "protocol error"),
            FailureReason::Other => write!(f, "other"),
        }
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ProbeOutcome {
    #[serde(rename_all = "camelCase")]
    Success { latency_ms: u64, status_code: u16 },
    Failure { reason: FailureReason },
}

/// Result of probing one endpoint once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub endpoint: Endpoint,
    pub outcome: ProbeOutcome,
    pub observed_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn success(endpoint: Endpoint, latency_ms: u64, status_code: u16) -> Self {
        Self {
            endpoint,
            outcome: ProbeOutcome::Success {
                latency_ms,
                status_code,
            },
            observed_at: Utc::now(),
        }
    }

    pub fn failure(endpoint: Endpoint, reason: FailureReason) -> Self {
        Self {
            endpoint,
            outcome: ProbeOutcome::Failure { reason },
            observed_at: Utc::now(),
        }
    }

    pub fn timeout(endpoint: Endpoint) -> Self {
        Self::failure(endpoint, FailureReason::Timeout)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Success { .. })
    }

    pub fn latency_ms(&self) -> Option<u64> {
        match self.outcome {
            ProbeOutcome::Success { latency_ms, .. } => Some(latency_ms),
            ProbeOutcome::Failure { .. } => None,
        }
    }
}

/// One validated endpoint in a ranking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub endpoint: Endpoint,
    pub latency_ms: u64,
    pub status_code: u16,
}

/// Deduplicated endpoints in ascending latency order.
///
/// Only the aggregator builds these, which keeps the ordering and
/// uniqueness guarantees out of callers' hands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RankedResult {
    entries: Vec<RankedEntry>,
}

impl RankedResult {
    pub(crate) fn from_sorted(entries: Vec<RankedEntry>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].latency_ms <= w[1].latency_ms));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RankedEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[RankedEntry] {
        &self.entries
    }

    /// The lowest-latency endpoint, if any passed
    pub fn fastest(&self) -> Option<&RankedEntry> {
        self.entries.first()
    }

    /// Mean latency across the ranking
    pub fn average_latency_ms(&self) -> Option<u64> {
        if self.entries.is_empty() {
            return None;
        }
        let sum: u64 = self.entries.iter().map(|e| e.latency_ms).sum();
        Some(sum / self.entries.len() as u64)
    }

    pub fn into_entries(self) -> Vec<RankedEntry> {
        self.entries
    }
}

impl<'a> IntoIterator for &'a RankedResult {
    type Item = &'a RankedEntry;
    type IntoIter = std::slice::Iter<'a, RankedEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_creation() {
        let endpoint = Endpoint::new("127.0.0.1", 8080).unwrap();
        assert_eq!(endpoint.host(), "127.0.0.1");
        assert_eq!(endpoint.port(), 8080);
        assert_eq!(endpoint.to_string(), "127.0.0.1:8080");
        assert_eq!(endpoint.proxy_url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_endpoint_rejects_port_zero() {
        assert_eq!(
            Endpoint::new("127.0.0.1", 0),
            Err(EndpointError::InvalidPort(0))
        );
    }

    #[test]
    fn test_endpoint_rejects_bad_hosts() {
        for host in ["", "bad host", "a..b", "-lead.example", "user@host", "999.1.1.1", "a/b"] {
            assert!(
                matches!(Endpoint::new(host, 80), Err(EndpointError::InvalidHost(_))),
                "{host:?} should be rejected"
            );
        }
        assert!(Endpoint::new("a".repeat(254), 80).is_err());
    }

    #[test]
    fn test_endpoint_host_case_is_folded() {
        let mixed: Endpoint = "Proxy.Example.COM:3128".parse().unwrap();
        let lower = Endpoint::new("proxy.example.com", 3128).unwrap();
        assert_eq!(mixed, lower);
        assert_eq!(mixed.to_string(), "proxy.example.com:3128");

        let mut set = CandidateSet::new();
        assert!(set.insert(lower));
        assert!(!set.insert(mixed));

        let v6: Endpoint = "[2001:DB8::1]:80".parse().unwrap();
        assert_eq!(v6.host(), "2001:db8::1");
    }

    #[test]
    fn test_endpoint_accepts_hostnames() {
        assert!(Endpoint::new("proxy-1.example.com", 3128).is_ok());
        assert!(Endpoint::new("localhost", 3128).is_ok());
    }

    #[test]
    fn test_endpoint_from_str() {
        let endpoint: Endpoint = "10.0.0.1:3128".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("10.0.0.1", 3128).unwrap());

        let v6: Endpoint = "[::1]:8080".parse().unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.to_string(), "[::1]:8080");
        assert_eq!(v6.proxy_url(), "http://[::1]:8080");
    }

    #[test]
    fn test_endpoint_from_str_errors() {
        assert!(matches!(
            "10.0.0.1:70000".parse::<Endpoint>(),
            Err(EndpointError::InvalidPort(70000))
        ));
        assert!(matches!(
            "10.0.0.1".parse::<Endpoint>(),
            Err(EndpointError::Malformed(_))
        ));
        assert!(matches!(
            "10.0.0.1:abc".parse::<Endpoint>(),
            Err(EndpointError::Malformed(_))
        ));
        assert!(matches!(
            "::1:80".parse::<Endpoint>(),
            Err(EndpointError::Malformed(_))
        ));
    }

    #[test]
    fn test_endpoint_deserialize_validates() {
        let ok: Endpoint = serde_json::from_str(r#"{"host":"1.2.3.4","port":80}"#).unwrap();
        assert_eq!(ok.port(), 80);
        assert!(serde_json::from_str::<Endpoint>(r#"{"host":"1.2.3.4","port":0}"#).is_err());
    }

    #[test]
    fn test_candidate_set_dedups_in_order() {
        let a = Endpoint::new("1.1.1.1", 80).unwrap();
        let b = Endpoint::new("2.2.2.2", 80).unwrap();
        let set: CandidateSet = vec![a.clone(), b.clone(), a.clone()].into_iter().collect();

        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_probe_result_constructors() {
        let endpoint = Endpoint::new("127.0.0.1", 8080).unwrap();

        let result = ProbeResult::success(endpoint.clone(), 120, 200);
        assert!(result.is_success());
        assert_eq!(result.latency_ms(), Some(120));

        let result = ProbeResult::failure(endpoint.clone(), FailureReason::ConnectionRefused);
        assert!(!result.is_success());
        assert_eq!(result.latency_ms(), None);

        let result = ProbeResult::timeout(endpoint);
        assert_eq!(
            result.outcome,
            ProbeOutcome::Failure {
                reason: FailureReason::Timeout
            }
        );
    }

    #[test]
    fn test_ranked_result_accessors() {
        let entries = vec![
            RankedEntry {
                endpoint: Endpoint::new("1.1.1.1", 80).unwrap(),
                latency_ms: 100,
                status_code: 200,
            },
            RankedEntry {
                endpoint: Endpoint::new("2.2.2.2", 80).unwrap(),
                latency_ms: 300,
                status_code: 204,
            },
        ];
        let ranked = RankedResult::from_sorted(entries);

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked.fastest().map(|e| e.latency_ms), Some(100));
        assert_eq!(ranked.average_latency_ms(), Some(200));
        assert!(RankedResult::default().average_latency_ms().is_none());
    }
}
