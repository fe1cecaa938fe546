//! Candidate sources and result persistence
//!
//! This module provides functionality for:
//! - Parsing candidate lists (`host:port`, `http://host:port`, HTML pages)
//! - Fetching lists from local files and public URLs
//! - Saving ranked endpoints as text or JSON

pub mod fetcher;
pub mod parser;
pub mod writer;

pub use fetcher::{CandidateSource, FetchResult, FetcherConfig, SourceFetcher};
pub use parser::CandidateParser;
pub use writer::{render_json, render_text, save_ranked, OutputFormat};
