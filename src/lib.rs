//! Proxy Sieve - concurrent validator for public HTTP forward proxies
//!
//! Candidates are gathered from public lists, probed through a bounded
//! pool of concurrent requests (sharded across threads for large sets),
//! and the working ones are ranked by observed latency.

pub mod logging;
pub mod source;
pub mod tui;
pub mod validate;

pub use source::{CandidateParser, CandidateSource, OutputFormat, SourceFetcher};
pub use validate::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
