//! Per-request inputs and outputs of the limiter.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::limit::{LimitCategory, LimitSpec};
use super::rate::RateLimitItem;

/// Everything the limiter needs to know about an incoming request.
///
/// Namespaces are listed from the outermost to the innermost one.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub route_id: String,
    pub method: String,
    pub namespace_chain: Vec<String>,
    pub remote_addr: Option<String>,
    pub attributes: HashMap<String, String>,
    pub start_time: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(route_id: impl Into<String>, method: impl AsRef<str>) -> Self {
        Self {
            route_id: route_id.into(),
            method: method.as_ref().to_ascii_uppercase(),
            namespace_chain: Vec::new(),
            remote_addr: None,
            attributes: HashMap::new(),
            start_time: Utc::now(),
        }
    }

    pub fn with_namespaces<I, S>(mut self, chain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespace_chain = chain.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// The parts of a response that deferred deductions may look at.
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseInfo {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// State of one limit as observed while handling a request.
#[derive(Debug, Clone)]
pub struct RequestLimit {
    pub limit: RateLimitItem,
    /// Storage key the limit was counted under.
    pub key: String,
    pub remaining: u64,
    /// Epoch seconds at which the current window resets.
    pub reset_at: i64,
    pub breached: bool,
    pub shared: bool,
    pub category: LimitCategory,
    pub spec: Arc<LimitSpec>,
}

impl RequestLimit {
    /// Seconds until the window resets, never negative.
    pub fn retry_after(&self, now: i64) -> u64 {
        (self.reset_at - now).max(0) as u64
    }
}
