//! Counting backend trait for abstracting in-process and remote stores.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

use super::rate::RateLimitItem;

/// Windowing algorithm a backend counts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    FixedWindow,
    MovingWindow,
    SlidingWindowCounter,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::FixedWindow => f.write_str("fixed-window"),
            Strategy::MovingWindow => f.write_str("moving-window"),
            Strategy::SlidingWindowCounter => f.write_str("sliding-window-counter"),
        }
    }
}

/// Snapshot of a single counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    /// Epoch seconds at which the window (or its oldest entry) expires.
    pub reset_at: i64,
    pub remaining: u64,
}

/// Result of a hit or a test against one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumption {
    pub allowed: bool,
    pub stats: WindowStats,
}

/// Trait for counting backend implementations.
///
/// Implementations must make `hit` atomic per key: concurrent callers may
/// never consume more than the configured amount within one window.
#[async_trait]
pub trait CountingBackend: Send + Sync {
    /// Consume `cost` from the counter at `key` if the window allows it.
    async fn hit(
        &self,
        key: &str,
        item: &RateLimitItem,
        cost: u32,
    ) -> Result<Consumption, BackendError>;

    /// Check whether `cost` could be consumed without consuming it.
    async fn test(
        &self,
        key: &str,
        item: &RateLimitItem,
        cost: u32,
    ) -> Result<Consumption, BackendError>;

    /// Current state of the counter at `key`.
    async fn window_stats(
        &self,
        key: &str,
        item: &RateLimitItem,
    ) -> Result<WindowStats, BackendError>;

    /// Remove the counter at `key`.
    async fn clear(&self, key: &str) -> Result<(), BackendError>;

    /// Remove every counter.
    async fn reset(&self) -> Result<(), BackendError>;

    /// Health check, used to detect recovery after failures.
    async fn check(&self) -> bool;

    /// Strategy the backend counts with.
    fn strategy(&self) -> Strategy;
}
