//! `web_search` — DuckDuckGo HTML search with domain filtering.
//!
//! Results are parsed from the HTML endpoint, filtered through the caller's
//! allow/block domain lists (suffix match), de-duplicated by
//! scheme+host+path, and capped at 10.

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use serde_json::{json, Map, Value};

use warren_domain::tool::{ErrorCode, PermissionLevel, ToolResult};
use warren_domain::Result;

use crate::fetch_url::html_to_text;
use crate::{Tool, ToolContext};

const DEFAULT_LIMIT: usize = 5;
const MAX_LIMIT: usize = 10;

fn result_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#)
            .expect("static regex")
    })
}

fn snippet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)class="result__snippet"[^>]*>(.*?)</a>"#).expect("static regex")
    })
}

fn domain_match(hostname: &str, domain: &str) -> bool {
    let host = hostname.to_lowercase();
    let host = host.trim().trim_start_matches('.');
    let target = domain.to_lowercase();
    let target = target.trim().trim_start_matches('.');
    if target.is_empty() {
        return false;
    }
    host == target || host.ends_with(&format!(".{target}"))
}

fn normalize_domains(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|d| d.to_lowercase().trim().trim_start_matches('.').to_string())
                .filter(|d| !d.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// DuckDuckGo wraps result links in a redirect (`/l/?uddg=<encoded>`);
/// unwrap to the target when present.
fn unwrap_result_url(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let parsed = Url::parse(&absolute).ok()?;
    if parsed.path().starts_with("/l/") {
        for (key, value) in parsed.query_pairs() {
            if key == "uddg" {
                return Some(value.into_owned());
            }
        }
    }
    Some(parsed.to_string())
}

/// Canonical form for de-duplication: scheme+host+path.
fn canonical_key(url: &Url) -> String {
    format!(
        "{}://{}{}",
        url.scheme(),
        url.host_str().unwrap_or(""),
        url.path().trim_end_matches('/')
    )
}

/// Map a recency window in days onto DuckDuckGo's `df` time limit.
fn recency_timelimit(days: u64) -> &'static str {
    match days {
        0..=1 => "d",
        2..=7 => "w",
        8..=31 => "m",
        _ => "y",
    }
}

pub struct WebSearchTool {
    timeout_seconds: u64,
}

impl WebSearchTool {
    pub fn new(timeout_seconds: u64) -> Self {
        Self { timeout_seconds }
    }

    fn parse_results(html: &str) -> Vec<(String, String, String)> {
        let snippets: Vec<String> = snippet_re()
            .captures_iter(html)
            .map(|cap| html_to_text(&cap[1], false).replace('\n', " "))
            .collect();

        result_link_re()
            .captures_iter(html)
            .enumerate()
            .filter_map(|(idx, cap)| {
                let href = unwrap_result_url(&cap[1])?;
                let title = html_to_text(&cap[2], false).replace('\n', " ");
                let snippet = snippets.get(idx).cloned().unwrap_or_default();
                Some((title, href, snippet))
            })
            .collect()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn description(&self) -> &'static str {
        "Search the web and return compact result snippets"
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::L2Network
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "integer", "minimum": 1, "maximum": MAX_LIMIT},
                "count": {"type": "integer", "minimum": 1, "maximum": MAX_LIMIT},
                "recency_days": {"type": "integer", "minimum": 1},
                "allowed_domains": {"type": "array", "items": {"type": "string"}},
                "blocked_domains": {"type": "array", "items": {"type": "string"}},
            }
        })
    }

    async fn run(&self, args: &Value, _context: &ToolContext) -> Result<ToolResult> {
        let started = Instant::now();
        let elapsed = |s: &Instant| s.elapsed().as_millis() as u64;

        let query = args
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if query.is_empty() {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                "Missing required 'query' argument",
                elapsed(&started),
            ));
        }

        let limit = args
            .get("limit")
            .or_else(|| args.get("count"))
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, MAX_LIMIT);

        let allowed = normalize_domains(args.get("allowed_domains"));
        let blocked = normalize_domains(args.get("blocked_domains"));

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_seconds.max(1)))
            .build()
            .map_err(|e| warren_domain::Error::Http(e.to_string()))?;

        let mut params: Vec<(&str, String)> = vec![("q", query.clone())];
        if let Some(days) = args.get("recency_days").and_then(Value::as_u64) {
            params.push(("df", recency_timelimit(days).to_string()));
        }
        let response = client
            .get("https://html.duckduckgo.com/html/")
            .query(&params)
            .header(reqwest::header::USER_AGENT, "warren/0.1")
            .send()
            .await;
        let html = match response {
            Ok(response) if response.status().is_success() => {
                response.text().await.unwrap_or_default()
            }
            Ok(response) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Http,
                    format!("Web search failed with status {}", response.status()),
                    elapsed(&started),
                )
                .retryable())
            }
            Err(e) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Http,
                    "Web search failed",
                    elapsed(&started),
                )
                .retryable()
                .with_detail("error", json!(e.to_string())))
            }
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut results = Vec::new();
        for (title, href, snippet) in Self::parse_results(&html) {
            let Ok(parsed) = Url::parse(&href) else {
                continue;
            };
            let hostname = parsed.host_str().unwrap_or("").to_lowercase();
            if !allowed.is_empty() && !allowed.iter().any(|d| domain_match(&hostname, d)) {
                continue;
            }
            if blocked.iter().any(|d| domain_match(&hostname, d)) {
                continue;
            }
            if !seen.insert(canonical_key(&parsed)) {
                continue;
            }
            results.push(json!({
                "title": title,
                "url": parsed.to_string(),
                "snippet": snippet,
                "source": "duckduckgo",
            }));
            if results.len() >= limit {
                break;
            }
        }

        let mut data = Map::new();
        data.insert("query".into(), json!(query));
        data.insert("results".into(), Value::Array(results));
        Ok(ToolResult::success(self.name(), data, elapsed(&started), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_match_is_suffix_based() {
        assert!(domain_match("docs.rs", "docs.rs"));
        assert!(domain_match("api.docs.rs", "docs.rs"));
        assert!(!domain_match("notdocs.rs", "docs.rs"));
        assert!(!domain_match("docs.rs", ""));
    }

    #[test]
    fn unwraps_duckduckgo_redirects() {
        let href = "//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fpage&rut=abc";
        let url = unwrap_result_url(href).unwrap();
        assert_eq!(url, "https://example.com/page");
    }

    #[test]
    fn direct_links_pass_through() {
        let url = unwrap_result_url("https://example.com/a?b=1").unwrap();
        assert!(url.starts_with("https://example.com/a"));
    }

    #[test]
    fn recency_maps_onto_ddg_buckets() {
        assert_eq!(recency_timelimit(1), "d");
        assert_eq!(recency_timelimit(7), "w");
        assert_eq!(recency_timelimit(30), "m");
        assert_eq!(recency_timelimit(365), "y");
    }

    #[test]
    fn canonical_key_drops_query_and_trailing_slash() {
        let a = Url::parse("https://example.com/path/?q=1").unwrap();
        let b = Url::parse("https://example.com/path").unwrap();
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }

    #[test]
    fn parses_result_blocks() {
        let html = r##"
            <div class="result">
              <a rel="nofollow" class="result__a" href="https://example.com/one">First <b>Hit</b></a>
              <a class="result__snippet" href="#">Snippet one</a>
            </div>
            <div class="result">
              <a rel="nofollow" class="result__a" href="https://example.org/two">Second</a>
              <a class="result__snippet" href="#">Snippet two</a>
            </div>
        "##;
        let rows = WebSearchTool::parse_results(html);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "First Hit");
        assert!(rows[0].1.contains("example.com"));
        assert_eq!(rows[1].2, "Snippet two");
    }
}
