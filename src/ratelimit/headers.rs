//! Rate limit response headers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::RequestLimit;

/// Names of the headers written for the reported limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMapping {
    #[serde(default = "default_limit_header")]
    pub limit: String,
    #[serde(default = "default_remaining_header")]
    pub remaining: String,
    #[serde(default = "default_reset_header")]
    pub reset: String,
    #[serde(default = "default_retry_after_header")]
    pub retry_after: String,
}

fn default_limit_header() -> String {
    "X-RateLimit-Limit".to_string()
}

fn default_remaining_header() -> String {
    "X-RateLimit-Remaining".to_string()
}

fn default_reset_header() -> String {
    "X-RateLimit-Reset".to_string()
}

fn default_retry_after_header() -> String {
    "Retry-After".to_string()
}

impl Default for HeaderMapping {
    fn default() -> Self {
        Self {
            limit: default_limit_header(),
            remaining: default_remaining_header(),
            reset: default_reset_header(),
            retry_after: default_retry_after_header(),
        }
    }
}

/// How the `Retry-After` value is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryAfterFormat {
    #[default]
    DeltaSeconds,
    HttpDate,
}

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Render an epoch timestamp as an HTTP date.
pub fn http_date(epoch_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .unwrap_or_default()
        .format(HTTP_DATE)
        .to_string()
}

/// Parse a `Retry-After` value, either an HTTP date or a number of seconds
/// relative to `now`, into epoch seconds.
///
/// Negative delays and instants outside the representable date range are
/// rejected.
pub fn parse_retry_after(value: &str, now: i64) -> Option<i64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return now
            .checked_add(seconds)
            .filter(|at| DateTime::<Utc>::from_timestamp(*at, 0).is_some());
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.timestamp())
}

/// Headers describing `reported`.
///
/// A `Retry-After` already present on the response wins when it points
/// further into the future than the reset of the limit.
pub fn populate_headers(
    reported: &RequestLimit,
    mapping: &HeaderMapping,
    format: RetryAfterFormat,
    now: i64,
    existing_retry_after: Option<&str>,
) -> Vec<(String, String)> {
    let mut reset_at = reported.reset_at;
    if let Some(existing) = existing_retry_after.and_then(|value| parse_retry_after(value, now)) {
        reset_at = reset_at.max(existing);
    }

    let retry_after = match format {
        RetryAfterFormat::HttpDate => http_date(reset_at),
        RetryAfterFormat::DeltaSeconds => (reset_at - now).max(0).to_string(),
    };

    vec![
        (mapping.limit.clone(), reported.limit.amount().to_string()),
        (mapping.remaining.clone(), reported.remaining.to_string()),
        (mapping.reset.clone(), reported.reset_at.to_string()),
        (mapping.retry_after.clone(), retry_after),
    ]
}
