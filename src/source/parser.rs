//! Candidate list parsing

use crate::validate::models::{CandidateSet, Endpoint};
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Matches `a.b.c.d:port` anywhere in a body of text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid IP:PORT regex")
});

/// Parser for plain-text candidate lists
pub struct CandidateParser;

impl CandidateParser {
    /// Parse a single line
    ///
    /// Accepts `host:port` and `http(s)://host:port`, optionally followed by
    /// whitespace and trailing text such as `# 120ms`. Blank lines,
    /// comments and invalid entries yield `None`.
    pub fn parse_line(line: &str) -> Option<Endpoint> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let token = line.split_whitespace().next()?;
        let token = token
            .strip_prefix("http://")
            .or_else(|| token.strip_prefix("https://"))
            .unwrap_or(token);
        let token = token.trim_end_matches('/');

        match token.parse::<Endpoint>() {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                debug!("skipping candidate line {:?}: {}", line, e);
                None
            }
        }
    }

    /// Parse every line, keeping the first occurrence of each endpoint
    pub fn parse_string(content: &str) -> CandidateSet {
        content.lines().filter_map(Self::parse_line).collect()
    }

    /// Parse a body that may be a plain list or an HTML page.
    ///
    /// Falls back to scanning for `ip:port` pairs when no line parses.
    pub fn parse_body(content: &str) -> CandidateSet {
        let parsed = Self::parse_string(content);
        if !parsed.is_empty() {
            return parsed;
        }
        Self::extract_with_regex(content)
    }

    /// Pull `ip:port` pairs out of arbitrary text
    pub fn extract_with_regex(content: &str) -> CandidateSet {
        IP_PORT_REGEX
            .captures_iter(content)
            .filter_map(|cap| {
                let host = cap.get(1)?.as_str();
                let port: u16 = cap.get(2)?.as_str().parse().ok()?;
                Endpoint::new(host, port).ok()
            })
            .collect()
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<CandidateSet> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_body(&content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_simple_format() {
        let endpoint = CandidateParser::parse_line("192.168.1.1:8080").unwrap();
        assert_eq!(endpoint.host(), "192.168.1.1");
        assert_eq!(endpoint.port(), 8080);
    }

    #[test]
    fn test_parse_url_format() {
        assert_eq!(
            CandidateParser::parse_line("http://192.168.1.1:8080"),
            Some(ep("192.168.1.1:8080"))
        );
        assert_eq!(
            CandidateParser::parse_line("https://proxy.example.com:3128/"),
            Some(ep("proxy.example.com:3128"))
        );
    }

    #[test]
    fn test_parse_takes_first_token() {
        assert_eq!(
            CandidateParser::parse_line("  10.0.0.1:3128  # 120ms"),
            Some(ep("10.0.0.1:3128"))
        );
        assert_eq!(
            CandidateParser::parse_line("10.0.0.1:3128 US elite"),
            Some(ep("10.0.0.1:3128"))
        );
    }

    #[test]
    fn test_parse_skips_blank_and_comments() {
        assert!(CandidateParser::parse_line("").is_none());
        assert!(CandidateParser::parse_line("   ").is_none());
        assert!(CandidateParser::parse_line("# This is a comment").is_none());
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(CandidateParser::parse_line("invalid").is_none());
        assert!(CandidateParser::parse_line("192.168.1.1").is_none());
        assert!(CandidateParser::parse_line("192.168.1.1:abc").is_none());
        assert!(CandidateParser::parse_line("192.168.1.1:0").is_none());
        assert!(CandidateParser::parse_line("192.168.1.1:70000").is_none());
        assert!(CandidateParser::parse_line("socks5://192.168.1.1:1080").is_none());
    }

    #[test]
    fn test_parse_string_dedups_in_order() {
        let content = r#"
# HTTP proxies
192.168.1.2:3128
192.168.1.1:8080
http://192.168.1.2:3128
garbage line
"#;
        let set = CandidateParser::parse_string(content);
        let order: Vec<String> = set.iter().map(ToString::to_string).collect();
        assert_eq!(order, vec!["192.168.1.2:3128", "192.168.1.1:8080"]);
    }

    #[test]
    fn test_parse_body_falls_back_to_regex() {
        let content = r#"
<html>
<body>
<table>
<tr><td>192.168.1.1</td><td>8080</td></tr>
</table>
Some text with 10.0.0.1:3128 embedded, again 10.0.0.1:3128
</body>
</html>
"#;
        let set = CandidateParser::parse_body(content);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&ep("10.0.0.1:3128")));
    }

    #[test]
    fn test_extract_rejects_bad_octets_and_ports() {
        assert!(CandidateParser::extract_with_regex("999.999.999.999:8080").is_empty());
        assert!(CandidateParser::extract_with_regex("192.168.1.1:0").is_empty());
        assert_eq!(
            CandidateParser::extract_with_regex("a 192.168.1.1:8080 b 10.0.0.1:3128.").len(),
            2
        );
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("candidates.txt");
        fs::write(&path, "1.1.1.1:80\n2.2.2.2:8080\n").unwrap();

        let set = CandidateParser::parse_file(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert!(CandidateParser::parse_file(dir.path().join("missing.txt")).is_err());
    }
}
