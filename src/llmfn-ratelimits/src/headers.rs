//! Rate limit state advertised in provider response headers.
//!
//! Header names are expected in lowercase.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use crate::window::WindowLimit;

/// Window lengths assumed for header-derived resetting windows. Headers only
/// report when the current window resets, not how long the next one lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderWindows {
    pub requests: Duration,
    pub tokens: Duration,
}

impl Default for HeaderWindows {
    fn default() -> Self {
        Self {
            requests: Duration::from_secs(60),
            tokens: Duration::from_secs(60),
        }
    }
}

static DURATION_PART_REGEX: OnceLock<Regex> = OnceLock::new();

fn duration_part_regex() -> &'static Regex {
    DURATION_PART_REGEX.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)(ns|us|µs|ms|h|m|s)").expect("Duration part regex is valid")
    })
}

/// Parse a Go formatted duration such as `6m0s`, `1.5s` or `20ms`.
pub fn parse_go_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let mut consumed = 0;
    let mut nanos = 0.0f64;
    for caps in duration_part_regex().captures_iter(s) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let value: f64 = caps[1].parse().ok()?;
        nanos += value
            * match &caps[2] {
                "h" => 3_600e9,
                "m" => 60e9,
                "s" => 1e9,
                "ms" => 1e6,
                "us" | "µs" => 1e3,
                _ => 1.0,
            };
    }

    if consumed != s.len() {
        return None;
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}

fn parse_number(headers: &HashMap<String, String>, name: &str) -> Option<u64> {
    let value = headers.get(name)?;
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(header = name, value = %value, "Invalid rate limit header");
            None
        }
    }
}

/// Parse OpenAI style `x-ratelimit-*` headers, also sent by Groq and other
/// compatible servers. Resets are relative Go durations.
pub fn parse_openai_headers(
    headers: &HashMap<String, String>,
    windows: &HeaderWindows,
) -> HashMap<String, WindowLimit> {
    let now = Instant::now();
    let mut limits = HashMap::new();

    for (name, window) in [("requests", windows.requests), ("tokens", windows.tokens)] {
        let limit = parse_number(headers, &format!("x-ratelimit-limit-{name}"));
        let remaining = parse_number(headers, &format!("x-ratelimit-remaining-{name}"));
        let reset_header = format!("x-ratelimit-reset-{name}");
        let reset = headers.get(&reset_header).and_then(|v| {
            let parsed = parse_go_duration(v);
            if parsed.is_none() {
                warn!(header = %reset_header, value = %v, "Invalid rate limit reset header");
            }
            parsed
        });

        if let (Some(limit), Some(remaining), Some(reset)) = (limit, remaining, reset) {
            limits.insert(
                name.to_string(),
                WindowLimit::resetting_at(limit, remaining, window, now + reset),
            );
        }
    }

    limits
}

/// Parse Anthropic style `anthropic-ratelimit-*` headers. Resets are
/// RFC 3339 timestamps, compared against `now`.
pub fn parse_anthropic_headers(
    headers: &HashMap<String, String>,
    windows: &HeaderWindows,
    now: DateTime<Utc>,
) -> HashMap<String, WindowLimit> {
    let instant = Instant::now();
    let mut limits = HashMap::new();

    for (name, window) in [("requests", windows.requests), ("tokens", windows.tokens)] {
        let limit = parse_number(headers, &format!("anthropic-ratelimit-{name}-limit"));
        let remaining = parse_number(headers, &format!("anthropic-ratelimit-{name}-remaining"));
        let reset_header = format!("anthropic-ratelimit-{name}-reset");
        let reset = headers.get(&reset_header).and_then(|v| {
            match DateTime::parse_from_rfc3339(v.trim()) {
                Ok(at) => Some(
                    at.with_timezone(&Utc)
                        .signed_duration_since(now)
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                ),
                Err(e) => {
                    warn!(header = %reset_header, value = %v, error = %e, "Invalid rate limit reset header");
                    None
                }
            }
        });

        if let (Some(limit), Some(remaining), Some(reset)) = (limit, remaining, reset) {
            limits.insert(
                name.to_string(),
                WindowLimit::resetting_at(limit, remaining, window, instant + reset),
            );
        }
    }

    limits
}

/// Delay requested by `retry-after-ms` or `retry-after` (seconds).
pub fn retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
    {
        return Some(Duration::from_micros((ms * 1_000.0).round() as u64));
    }
    headers
        .get("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn headers(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_go_duration() {
        assert_eq!(parse_go_duration("6m0s"), Some(Duration::from_secs(360)));
        assert_eq!(parse_go_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_go_duration("20ms"), Some(Duration::from_millis(20)));
        assert_eq!(parse_go_duration("1h2m3s"), Some(Duration::from_secs(3723)));
        assert_eq!(parse_go_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_go_duration(""), None);
        assert_eq!(parse_go_duration("soon"), None);
        assert_eq!(parse_go_duration("5s later"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_openai_headers() {
        let h = headers(&[
            ("x-ratelimit-limit-requests", "500"),
            ("x-ratelimit-remaining-requests", "499"),
            ("x-ratelimit-reset-requests", "120ms"),
            ("x-ratelimit-limit-tokens", "30000"),
            ("x-ratelimit-remaining-tokens", "29000"),
            ("x-ratelimit-reset-tokens", "2s"),
        ]);
        let now = Instant::now();

        let limits = parse_openai_headers(&h, &HeaderWindows::default());

        assert_eq!(
            limits["requests"],
            WindowLimit::resetting_at(500, 499, Duration::from_secs(60), now + Duration::from_millis(120))
        );
        assert_eq!(
            limits["tokens"],
            WindowLimit::resetting_at(30000, 29000, Duration::from_secs(60), now + Duration::from_secs(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_headers_are_skipped() {
        let h = headers(&[
            ("x-ratelimit-limit-requests", "500"),
            ("x-ratelimit-remaining-requests", "many"),
            ("x-ratelimit-reset-requests", "1s"),
        ]);

        assert!(parse_openai_headers(&h, &HeaderWindows::default()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_anthropic_headers() {
        let h = headers(&[
            ("anthropic-ratelimit-requests-limit", "50"),
            ("anthropic-ratelimit-requests-remaining", "49"),
            ("anthropic-ratelimit-requests-reset", "2024-01-01T00:00:30Z"),
        ]);
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let instant = Instant::now();

        let limits = parse_anthropic_headers(&h, &HeaderWindows::default(), now);

        assert_eq!(limits.len(), 1);
        assert_eq!(
            limits["requests"],
            WindowLimit::resetting_at(50, 49, Duration::from_secs(60), instant + Duration::from_secs(30))
        );
    }

    #[test]
    fn test_retry_after() {
        assert_eq!(
            retry_after(&headers(&[("retry-after", "3")])),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            retry_after(&headers(&[("retry-after", "3"), ("retry-after-ms", "250")])),
            Some(Duration::from_millis(250))
        );
        assert_eq!(retry_after(&headers(&[("retry-after", "-1")])), None);
        assert_eq!(retry_after(&headers(&[])), None);
    }
}
