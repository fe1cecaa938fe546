//! Candidate list fetching from files and public URLs
//!
//! This module provides functionality for:
//! - Fetching candidate lists over HTTP or from local files
//! - Tolerating individual source failures
//! - Merging every source into one deduplicated candidate set

use crate::source::parser::CandidateParser;
use crate::validate::models::CandidateSet;
use crate::Result;
use futures::future::join_all;
use reqwest::Client;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Default timeout for list downloads in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Default user agent for list downloads
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Public plain-text HTTP proxy lists
const COMMON_SOURCES: [(&str, &str); 7] = [
    (
        "clarketm",
        "https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list-raw.txt",
    ),
    (
        "TheSpeedX",
        "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt",
    ),
    (
        "ShiftyTR",
        "https://raw.githubusercontent.com/ShiftyTR/Proxy-List/master/http.txt",
    ),
    (
        "monosans",
        "https://raw.githubusercontent.com/monosans/proxy-list/main/proxies/http.txt",
    ),
    (
        "roosterkid",
        "https://raw.githubusercontent.com/roosterkid/openproxylist/main/HTTPS_RAW.txt",
    ),
    (
        "proxy-list.download (http)",
        "https://www.proxy-list.download/api/v1/get?type=http",
    ),
    (
        "proxy-list.download (https)",
        "https://www.proxy-list.download/api/v1/get?type=https",
    ),
];

/// Where a candidate list comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    Url { name: String, url: String },
    File(PathBuf),
}

impl CandidateSource {
    pub fn url(name: &str, url: &str) -> Self {
        CandidateSource::Url {
            name: name.to_string(),
            url: url.to_string(),
        }
    }

    /// Treat `http(s)://` locations as URLs and anything else as a path
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::url(location, location)
        } else {
            CandidateSource::File(PathBuf::from(location))
        }
    }

    /// The default public lists
    pub fn common() -> Vec<Self> {
        COMMON_SOURCES
            .iter()
            .map(|(name, url)| Self::url(name, url))
            .collect()
    }

    pub fn name(&self) -> String {
        match self {
            CandidateSource::Url { name, .. } => name.clone(),
            CandidateSource::File(path) => path.display().to_string(),
        }
    }
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateSource::Url { url, .. } => write!(f, "{}", url),
            CandidateSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Result of fetching a single source
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub source: String,
    pub candidates: CandidateSet,
    /// Error message if fetching failed
    pub error: Option<String>,
}

impl FetchResult {
    pub fn success(source: String, candidates: CandidateSet) -> Self {
        Self {
            source,
            candidates,
            error: None,
        }
    }

    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            candidates: CandidateSet::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Gathers candidates from many sources
pub struct SourceFetcher {
    client: Client,
}

impl SourceFetcher {
    pub fn new() -> Result<Self> {
        Self::with_config(FetcherConfig::default())
    }

    pub fn with_config(config: FetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { client })
    }

    /// Fetch and parse candidates from a single URL
    pub async fn fetch_url(&self, url: &str) -> Result<CandidateSet> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let content = response.text().await?;
        Ok(CandidateParser::parse_body(&content))
    }

    /// Fetch one source of either kind
    pub async fn fetch(&self, source: &CandidateSource) -> Result<CandidateSet> {
        match source {
            CandidateSource::Url { url, .. } => self.fetch_url(url).await,
            CandidateSource::File(path) => {
                let content = tokio::fs::read_to_string(path).await?;
                Ok(CandidateParser::parse_body(&content))
            }
        }
    }

    /// Fetch every source concurrently, reporting each outcome
    pub async fn fetch_with_results(&self, sources: &[CandidateSource]) -> Vec<FetchResult> {
        join_all(sources.iter().map(|source| async move {
            match self.fetch(source).await {
                Ok(candidates) => {
                    info!("fetched {} candidates from {}", candidates.len(), source);
                    FetchResult::success(source.name(), candidates)
                }
                Err(e) => {
                    warn!("failed to fetch {}: {}", source, e);
                    FetchResult::failure(source.name(), e.to_string())
                }
            }
        }))
        .await
    }

    /// Fetch every source and merge the lists, first occurrence wins
    pub async fn fetch_all(&self, sources: &[CandidateSource]) -> CandidateSet {
        let results = self.fetch_with_results(sources).await;
        let failed = results.iter().filter(|r| !r.is_success()).count();

        let merged: CandidateSet = results.into_iter().flat_map(|r| r.candidates).collect();

        info!(
            "collected {} unique candidates from {} sources ({} failed)",
            merged.len(),
            sources.len(),
            failed
        );
        merged
    }
}
