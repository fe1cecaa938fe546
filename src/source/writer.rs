//! Persisting ranked endpoints

use crate::validate::models::{RankedEntry, RankedResult};
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// On-disk layout of a ranked list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// `host:port  # <latency>ms` lines under a comment header
    #[default]
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonDocument<'a> {
    updated_at: String,
    total: usize,
    proxies: &'a [RankedEntry],
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Render the ranking in the text layout
pub fn render_text(ranked: &RankedResult, at: DateTime<Utc>) -> String {
    let mut out = format!(
        "# Proxy List - Updated: {}\n# Total proxies: {}\n\n",
        timestamp(at),
        ranked.len()
    );
    for entry in ranked {
        out.push_str(&format!("{}  # {}ms\n", entry.endpoint, entry.latency_ms));
    }
    out
}

pub fn render_json(ranked: &RankedResult, at: DateTime<Utc>) -> Result<String> {
    let document = JsonDocument {
        updated_at: timestamp(at),
        total: ranked.len(),
        proxies: ranked.entries(),
    };
    Ok(serde_json::to_string_pretty(&document)?)
}

/// Write the ranking to `path`.
///
/// An empty ranking leaves any existing file untouched and returns `false`.
pub fn save_ranked<P: AsRef<Path>>(
    ranked: &RankedResult,
    path: P,
    format: OutputFormat,
) -> Result<bool> {
    let path = path.as_ref();
    if ranked.is_empty() {
        warn!("no working proxies to save; {} left unchanged", path.display());
        return Ok(false);
    }

    let now = Utc::now();
    let content = match format {
        OutputFormat::Text => render_text(ranked, now),
        OutputFormat::Json => render_json(ranked, now)?,
    };
    fs::write(path, content)?;

    info!(
        "saved {} working proxies to {} ({})",
        ranked.len(),
        path.display(),
        format
    );
    Ok(true)
}
