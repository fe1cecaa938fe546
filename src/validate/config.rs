//! Run configuration for a validation run

use crate::validate::error::SetupError;
use crate::Result;
use reqwest::header::HeaderValue;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default hard deadline for each probe in milliseconds
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 6_000;

/// Default number of in-flight probes per execution context
const DEFAULT_CONCURRENCY: usize = 50;

/// Default latency ceiling for ranked endpoints in milliseconds
const DEFAULT_MAX_LATENCY_MS: u64 = 6_000;

/// Candidate sets smaller than this run in a single context
const DEFAULT_SHARD_THRESHOLD: usize = 1_000;

/// Default URL to request through each candidate
const DEFAULT_TEST_URL: &str = "https://www.google.com";

/// Default cadence of progress snapshots in milliseconds
const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1_000;

/// Default number of results a shard buffers before reporting
const DEFAULT_SHARD_BATCH_SIZE: usize = 32;

/// Browser user agents rotated across probes
pub const DEFAULT_USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/92.0.4515.107 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:90.0) Gecko/20100101 Firefox/90.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
];

/// HTTP method used by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMethod {
    #[default]
    Head,
    Get,
    /// HEAD, and GET if HEAD fails, both inside one deadline
    HeadThenGet,
}

impl fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeMethod::Head => write!(f, "head"),
            ProbeMethod::Get => write!(f, "get"),
            ProbeMethod::HeadThenGet => write!(f, "head-then-get"),
        }
    }
}

impl FromStr for ProbeMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "head" => Ok(ProbeMethod::Head),
            "get" => Ok(ProbeMethod::Get),
            "head-then-get" => Ok(ProbeMethod::HeadThenGet),
            _ => Err(format!(
                "Invalid probe method: {}. Use: head, get, head-then-get",
                s
            )),
        }
    }
}

/// Configuration for one validation run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Hard deadline for a single probe
    pub per_probe_timeout: Duration,
    /// Maximum in-flight probes within one execution context
    pub max_concurrency: usize,
    /// Endpoints slower than this are left out of the ranking
    pub max_latency: Duration,
    /// Number of parallel shards for large candidate sets
    pub shard_count: usize,
    /// Minimum candidate count before sharding kicks in
    pub shard_threshold: usize,
    /// URL requested through each candidate
    pub test_target: String,
    /// User agents rotated across probes
    pub user_agents: Vec<String>,
    pub probe_method: ProbeMethod,
    /// Overall deadline for the run
    pub run_deadline: Option<Duration>,
    /// Cadence of progress snapshots
    pub progress_interval: Duration,
    /// Probe at most this many candidates
    pub max_candidates: Option<usize>,
    /// Results a shard buffers before reporting back
    pub shard_batch_size: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            per_probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            max_concurrency: DEFAULT_CONCURRENCY,
            max_latency: Duration::from_millis(DEFAULT_MAX_LATENCY_MS),
            shard_count: default_shard_count(),
            shard_threshold: DEFAULT_SHARD_THRESHOLD,
            test_target: DEFAULT_TEST_URL.to_string(),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            probe_method: ProbeMethod::default(),
            run_deadline: None,
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            max_candidates: None,
            shard_batch_size: DEFAULT_SHARD_BATCH_SIZE,
        }
    }
}

fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.per_probe_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.max_concurrency = concurrency;
        self
    }

    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = max_latency;
        self
    }

    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_shard_threshold(mut self, threshold: usize) -> Self {
        self.shard_threshold = threshold;
        self
    }

    pub fn with_test_target(mut self, url: impl Into<String>) -> Self {
        self.test_target = url.into();
        self
    }

    pub fn with_user_agents(mut self, user_agents: Vec<String>) -> Self {
        self.user_agents = user_agents;
        self
    }

    pub fn with_probe_method(mut self, method: ProbeMethod) -> Self {
        self.probe_method = method;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = Some(deadline);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = Some(max);
        self
    }

    pub fn with_shard_batch_size(mut self, batch_size: usize) -> Self {
        self.shard_batch_size = batch_size;
        self
    }

    /// Latency ceiling in whole milliseconds
    pub fn max_latency_ms(&self) -> u64 {
        self.max_latency.as_millis() as u64
    }

    /// Check every knob and return the parsed test target
    pub fn validate(&self) -> std::result::Result<Url, SetupError> {
        if self.max_concurrency == 0 {
            return Err(SetupError::invalid("max_concurrency must be at least 1"));
        }
        if self.shard_count == 0 {
            return Err(SetupError::invalid("shard_count must be at least 1"));
        }
        if self.shard_batch_size == 0 {
            return Err(SetupError::invalid("shard_batch_size must be at least 1"));
        }
        if self.per_probe_timeout.is_zero() {
            return Err(SetupError::invalid("per_probe_timeout must be positive"));
        }
        if self.max_latency.is_zero() {
            return Err(SetupError::invalid("max_latency must be positive"));
        }
        if self.progress_interval.is_zero() {
            return Err(SetupError::invalid("progress_interval must be positive"));
        }
        if self.run_deadline.is_some_and(|d| d.is_zero()) {
            return Err(SetupError::invalid("run_deadline must be positive"));
        }
        if self.max_candidates == Some(0) {
            return Err(SetupError::invalid("max_candidates must be at least 1"));
        }
        if let Some(ua) = self
            .user_agents
            .iter()
            .find(|ua| HeaderValue::from_str(ua).is_err())
        {
            return Err(SetupError::invalid(format!(
                "user agent is not a valid header value: {:?}",
                ua
            )));
        }

        let url = Url::parse(&self.test_target).map_err(|e| {
            SetupError::invalid(format!("test_target `{}`: {}", self.test_target, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SetupError::invalid(format!(
                "test_target must be http or https, got `{}`",
                url.scheme()
            )));
        }
        Ok(url)
    }
}

/// Optional overrides read from a TOML file
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub per_probe_timeout_ms: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub max_latency_ms: Option<u64>,
    pub shard_count: Option<usize>,
    pub shard_threshold: Option<usize>,
    pub test_target: Option<String>,
    pub user_agents: Option<Vec<String>>,
    pub probe_method: Option<ProbeMethod>,
    pub run_deadline_secs: Option<u64>,
    pub progress_interval_ms: Option<u64>,
    pub max_candidates: Option<usize>,
    pub shard_batch_size: Option<usize>,
}

impl ConfigFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Layer the values present in the file over `config`
    pub fn apply(self, mut config: RunConfig) -> RunConfig {
        if let Some(ms) = self.per_probe_timeout_ms {
            config.per_probe_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_concurrency {
            config.max_concurrency = n;
        }
        if let Some(ms) = self.max_latency_ms {
            config.max_latency = Duration::from_millis(ms);
        }
        if let Some(n) = self.shard_count {
            config.shard_count = n;
        }
        if let Some(n) = self.shard_threshold {
            config.shard_threshold = n;
        }
        if let Some(url) = self.test_target {
            config.test_target = url;
        }
        if let Some(agents) = self.user_agents {
            config.user_agents = agents;
        }
        if let Some(method) = self.probe_method {
            config.probe_method = method;
        }
        if let Some(secs) = self.run_deadline_secs {
            config.run_deadline = Some(Duration::from_secs(secs));
        }
        if let Some(ms) = self.progress_interval_ms {
            config.progress_interval = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_candidates {
            config.max_candidates = Some(n);
        }
        if let Some(n) = self.shard_batch_size {
            config.shard_batch_size = n;
        }
        config
    }
}
