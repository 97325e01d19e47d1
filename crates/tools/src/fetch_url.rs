//! `fetch_url` — SSRF-guarded HTTP fetch with HTML extraction.
//!
//! Safety properties:
//! - scheme must be http or https
//! - the host must not resolve to any private/loopback/link-local/CGNAT/
//!   reserved/unspecified address
//! - redirects are followed manually (≤ 5 hops) and every hop re-validates
//! - `Content-Length` and the streamed body are both capped
//! - output is truncated to `maxChars` ∈ [256, 100000]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, USER_AGENT};
use reqwest::Url;
use serde_json::{json, Map, Value};

use warren_domain::tool::{ErrorCode, PermissionLevel, ToolResult};
use warren_domain::Result;

use crate::{Tool, ToolContext};

const MAX_REDIRECTS: usize = 5;
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;
const MIN_OUTPUT_CHARS: usize = 256;
const MAX_OUTPUT_CHARS: usize = 100_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSRF guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn is_v4_blocked(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        // 100.64.0.0/10 shared address space (CGNAT)
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
        // documentation ranges
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 2)
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100)
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)
        // 198.18.0.0/15 benchmarking
        || (octets[0] == 198 && (octets[1] & 0xFE) == 18)
}

fn is_v6_blocked(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique-local
        || (segments[0] & 0xFE00) == 0xFC00
        // fe80::/10 link-local
        || (segments[0] & 0xFFC0) == 0xFE80
}

pub(crate) fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_v4_blocked(v4),
        IpAddr::V6(v6) => is_v6_blocked(v6),
    }
}

/// Validate a URL before fetching: scheme, host presence, and every
/// resolved address public.
pub(crate) async fn validate_url(raw_url: &str) -> std::result::Result<Url, String> {
    let parsed = Url::parse(raw_url).map_err(|e| format!("invalid URL: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("blocked scheme: {other}")),
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| "URL has no host".to_string())?
        .to_string();
    let port = parsed.port_or_known_default().unwrap_or(80);

    let addrs: Vec<std::net::SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| format!("DNS resolution failed for {host}: {e}"))?
        .collect();
    if addrs.is_empty() {
        return Err(format!("DNS resolution returned no addresses for {host}"));
    }
    for addr in &addrs {
        if is_blocked_ip(&addr.ip()) {
            return Err(format!(
                "blocked private/internal address: {host} resolves to {}",
                addr.ip()
            ));
        }
    }
    Ok(parsed)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTML extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

/// Strip tags and collapse whitespace. With `markdown` set, headings and
/// list items keep lightweight markers.
pub(crate) fn html_to_text(html: &str, markdown: bool) -> String {
    let mut out = String::new();
    let mut tag_buf = String::new();
    let mut in_tag = false;
    let mut in_script = false;
    let mut in_style = false;

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag_buf.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let tag = tag_buf.to_lowercase();
                let name = tag
                    .trim_start_matches('/')
                    .split([' ', '/'])
                    .next()
                    .unwrap_or("");
                let closing = tag.starts_with('/');

                match name {
                    "script" => in_script = !closing,
                    "style" => in_style = !closing,
                    "br" => out.push('\n'),
                    "h1" | "h2" | "h3" | "h4" | "h5" | "h6" if !closing && markdown => {
                        let depth = name[1..].parse::<usize>().unwrap_or(1);
                        out.push('\n');
                        out.push_str(&"#".repeat(depth));
                        out.push(' ');
                    }
                    "li" if !closing && markdown => out.push_str("\n- "),
                    "p" | "div" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "li" | "tr"
                    | "article" | "section" | "header" | "footer" | "blockquote"
                        if closing =>
                    {
                        if !out.ends_with('\n') {
                            out.push('\n');
                        }
                    }
                    _ => {}
                }
                tag_buf.clear();
            }
            _ if in_tag => tag_buf.push(ch),
            _ if in_script || in_style => {}
            _ => out.push(ch),
        }
    }

    let decoded = decode_entities(&out);
    let mut result = String::new();
    let mut prev_blank = false;
    for line in decoded.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            if !prev_blank {
                result.push('\n');
                prev_blank = true;
            }
        } else {
            result.push_str(&collapsed);
            result.push('\n');
            prev_blank = false;
        }
    }
    result.trim().to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FetchUrlTool {
    timeout_seconds: u64,
    output_char_limit: usize,
}

impl FetchUrlTool {
    pub fn new(timeout_seconds: u64, output_char_limit: usize) -> Self {
        Self {
            timeout_seconds,
            output_char_limit,
        }
    }

    fn client(&self) -> std::result::Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_seconds.max(1)))
            // Redirects are followed manually so each hop is re-validated.
            .redirect(reqwest::redirect::Policy::none())
            .build()
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &'static str {
        "fetch_url"
    }

    fn description(&self) -> &'static str {
        "Fetch remote URL and convert content to compact text"
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::L2Network
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": {"type": "string", "description": "HTTP or HTTPS URL to fetch"},
                "extractMode": {"type": "string", "enum": ["markdown", "text", "html"]},
                "maxChars": {"type": "integer", "minimum": MIN_OUTPUT_CHARS, "maximum": MAX_OUTPUT_CHARS},
            }
        })
    }

    async fn run(&self, args: &Value, _context: &ToolContext) -> Result<ToolResult> {
        let started = Instant::now();
        let elapsed = |s: &Instant| s.elapsed().as_millis() as u64;

        let url = args.get("url").and_then(Value::as_str).unwrap_or("").trim();
        if url.is_empty() {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                "Missing required 'url' argument",
                elapsed(&started),
            ));
        }

        let extract_mode = args
            .get("extractMode")
            .or_else(|| args.get("extract_mode"))
            .and_then(Value::as_str)
            .unwrap_or("markdown")
            .to_lowercase();
        if !matches!(extract_mode.as_str(), "markdown" | "text" | "html") {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                "extractMode must be one of: markdown, text, html",
                elapsed(&started),
            ));
        }

        let max_chars = match args.get("maxChars").or_else(|| args.get("max_chars")) {
            Some(raw) => match raw.as_u64() {
                Some(value) => (value as usize).clamp(MIN_OUTPUT_CHARS, MAX_OUTPUT_CHARS),
                None => {
                    return Ok(ToolResult::failure(
                        self.name(),
                        ErrorCode::InvalidArgs,
                        "maxChars must be an integer",
                        elapsed(&started),
                    ))
                }
            },
            None => self.output_char_limit.clamp(MIN_OUTPUT_CHARS, MAX_OUTPUT_CHARS),
        };

        let client = match self.client() {
            Ok(client) => client,
            Err(e) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Internal,
                    format!("Failed to build HTTP client: {e}"),
                    elapsed(&started),
                ))
            }
        };

        // ── Fetch with manual, re-validated redirects ───────────────
        let mut current = url.to_string();
        let mut response = None;
        for _hop in 0..=MAX_REDIRECTS {
            let validated = match validate_url(&current).await {
                Ok(validated) => validated,
                Err(reason) => {
                    return Ok(ToolResult::failure(
                        self.name(),
                        ErrorCode::PolicyDenied,
                        reason,
                        elapsed(&started),
                    ))
                }
            };

            let sent = match client
                .get(validated.clone())
                .header(USER_AGENT, "warren/0.1")
                .send()
                .await
            {
                Ok(sent) => sent,
                Err(e) if e.is_timeout() => {
                    return Ok(ToolResult::failure(
                        self.name(),
                        ErrorCode::Timeout,
                        "Request timed out",
                        elapsed(&started),
                    )
                    .retryable())
                }
                Err(e) => {
                    return Ok(ToolResult::failure(
                        self.name(),
                        ErrorCode::Http,
                        "Failed to fetch URL",
                        elapsed(&started),
                    )
                    .with_detail("error", json!(e.to_string())))
                }
            };

            if sent.status().is_redirection() {
                let Some(location) = sent
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                else {
                    return Ok(ToolResult::failure(
                        self.name(),
                        ErrorCode::Http,
                        "Redirect without Location header",
                        elapsed(&started),
                    ));
                };
                current = match validated.join(&location) {
                    Ok(next) => next.to_string(),
                    Err(e) => {
                        return Ok(ToolResult::failure(
                            self.name(),
                            ErrorCode::Http,
                            format!("Invalid redirect target: {e}"),
                            elapsed(&started),
                        ))
                    }
                };
                continue;
            }
            response = Some(sent);
            break;
        }
        let Some(response) = response else {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::Http,
                format!("Too many redirects (>{MAX_REDIRECTS})"),
                elapsed(&started),
            ));
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if let Some(length) = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
        {
            if length > MAX_BODY_BYTES {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Http,
                    format!("Response exceeds {MAX_BODY_BYTES} byte limit"),
                    elapsed(&started),
                ));
            }
        }

        // Stream the body with a hard byte cap.
        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    return Ok(ToolResult::failure(
                        self.name(),
                        ErrorCode::Http,
                        "Failed while reading response body",
                        elapsed(&started),
                    )
                    .with_detail("error", json!(e.to_string())))
                }
            };
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Http,
                    format!("Response exceeds {MAX_BODY_BYTES} byte limit"),
                    elapsed(&started),
                ));
            }
            body.extend_from_slice(&chunk);
        }

        // ── Extract ─────────────────────────────────────────────────
        let decoded = String::from_utf8_lossy(&body).into_owned();
        let text = if content_type.contains("application/json") {
            serde_json::from_str::<Value>(&decoded)
                .and_then(|v| serde_json::to_string_pretty(&v))
                .unwrap_or(decoded)
        } else if content_type.contains("text/html") {
            match extract_mode.as_str() {
                "html" => decoded,
                "text" => html_to_text(&decoded, false),
                _ => html_to_text(&decoded, true),
            }
        } else {
            decoded
        };

        let mut truncated = false;
        let mut content = text;
        if content.chars().count() > max_chars {
            content = content.chars().take(max_chars).collect();
            content.push_str("\n...[truncated]");
            truncated = true;
        }

        let mut data = Map::new();
        data.insert("status".into(), json!(status));
        data.insert("url".into(), json!(current));
        data.insert("content".into(), json!(content));
        data.insert("truncated".into(), json!(truncated));
        data.insert("extract_mode".into(), json!(extract_mode));
        data.insert("max_chars".into(), json!(max_chars));
        Ok(ToolResult::success(
            self.name(),
            data,
            elapsed(&started),
            truncated,
        ))
    }
}
