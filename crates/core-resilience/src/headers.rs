//! Interpretation of server rate-limit hints
//!
//! Only header *values* are handled here; fetching them from a response is
//! the transport's job. Header names are matched case-insensitively.

use crate::token_bucket::MAX_RETRY_AFTER;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

pub const RETRY_AFTER: &str = "Retry-After";
pub const RATE_LIMIT_LIMIT: &str = "X-RateLimit-Limit";
pub const RATE_LIMIT_REMAINING: &str = "X-RateLimit-Remaining";
pub const RATE_LIMIT_RESET: &str = "X-RateLimit-Reset";

/// `X-RateLimit-Reset` values above this are epoch seconds, below it deltas
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

/// Look up a header value ignoring ASCII case
pub fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

/// Parse a `Retry-After` value: delay-seconds or an HTTP-date.
///
/// Dates in the past yield zero; anything unparseable yields `None`.
/// Values are capped at [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    let delay = match value.parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(_) => {
            let date = DateTime::parse_from_rfc2822(value).ok()?;
            let delta = date.with_timezone(&Utc) - now;
            delta.to_std().unwrap_or(Duration::ZERO)
        }
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

/// Rate-limit information advertised by a server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    /// Requests allowed per window
    pub limit: Option<u64>,
    /// Requests left in the current window
    pub remaining: Option<u64>,
    /// Time until the window resets
    pub reset_in: Option<Duration>,
    /// Server-requested pause
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Extract rate-limit hints from response headers
    pub fn from_headers(headers: &HashMap<String, String>, now: DateTime<Utc>) -> Self {
        let number = |name: &str| header_value(headers, name).and_then(|v| v.parse::<u64>().ok());

        let reset_in = number(RATE_LIMIT_RESET).map(|reset| {
            if reset >= EPOCH_THRESHOLD {
                let now_secs = now.timestamp().max(0) as u64;
                Duration::from_secs(reset.saturating_sub(now_secs))
            } else {
                Duration::from_secs(reset)
            }
        });

        Self {
            limit: number(RATE_LIMIT_LIMIT),
            remaining: number(RATE_LIMIT_REMAINING),
            reset_in,
            retry_after: header_value(headers, RETRY_AFTER)
                .and_then(|value| parse_retry_after(value, now)),
        }
    }

    /// Check if no recognised header was present
    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset_in.is_none()
            && self.retry_after.is_none()
    }

    /// Sustainable request rate until the window resets, if derivable
    pub fn sustainable_rate(&self) -> Option<f64> {
        let remaining = self.remaining?;
        let reset_in = self.reset_in?.as_secs_f64();
        if remaining == 0 || reset_in <= 0.0 {
            return None;
        }
        Some(remaining as f64 / reset_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2015-10-21T07:28:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_retry_after_seconds() {
        assert_eq!(
            parse_retry_after("120", now()),
            Some(Duration::from_secs(120))
        );
        assert_eq!(parse_retry_after(" 0 ", now()), Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_http_date() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now()),
            Some(Duration::from_secs(30))
        );
        // Already passed
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now()),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_retry_after_is_capped() {
        assert_eq!(
            parse_retry_after("18446744073709551615", now()),
            Some(MAX_RETRY_AFTER)
        );
        assert_eq!(
            parse_retry_after("Fri, 01 Jan 2100 00:00:00 GMT", now()),
            Some(MAX_RETRY_AFTER)
        );
    }

    #[test]
    fn test_retry_after_garbage() {
        assert_eq!(parse_retry_after("soon", now()), None);
        assert_eq!(parse_retry_after("-5", now()), None);
        assert_eq!(parse_retry_after("", now()), None);
    }

    #[test]
    fn test_rate_limit_headers_parsing() {
        let reset = (now().timestamp() + 3600).to_string();
        let parsed = RateLimitHeaders::from_headers(
            &headers(&[
                ("X-RateLimit-Limit", "100"),
                ("x-ratelimit-remaining", "42"),
                ("X-RateLimit-Reset", &reset),
                ("retry-after", "60"),
            ]),
            now(),
        );

        assert_eq!(parsed.limit, Some(100));
        assert_eq!(parsed.remaining, Some(42));
        assert_eq!(parsed.reset_in, Some(Duration::from_secs(3600)));
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(60)));
        assert!(!parsed.is_empty());
    }

    #[test]
    fn test_reset_as_delta_seconds() {
        let parsed = RateLimitHeaders::from_headers(
            &headers(&[("X-RateLimit-Remaining", "5"), ("X-RateLimit-Reset", "300")]),
            now(),
        );

        assert_eq!(parsed.reset_in, Some(Duration::from_secs(300)));
        let rate = parsed.sustainable_rate().unwrap();
        assert!((rate - 5.0 / 300.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_headers() {
        let parsed = RateLimitHeaders::from_headers(&headers(&[("Content-Type", "json")]), now());
        assert!(parsed.is_empty());
        assert_eq!(parsed.sustainable_rate(), None);
    }
}
