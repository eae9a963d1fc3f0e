//! In-process counting backend.
//!
//! Counters live in a `DashMap` keyed by storage key. Every operation on a key
//! runs under that key's shard lock, which makes hits atomic per key.
//! Counters whose window has fully elapsed are swept at most once per
//! [`SWEEP_INTERVAL`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::trace;

use crate::error::BackendError;

use super::backend::{Consumption, CountingBackend, Strategy, WindowStats};
use super::rate::RateLimitItem;

/// Minimum clock time between two sweeps of expired counters.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Wall clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// A clock that only moves when told to. Used to step through windows
/// deterministically.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_secs: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_secs * 1000),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_secs(&self, secs: u64) {
        self.millis.store(secs * 1000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

fn ceil_secs(millis: u64) -> i64 {
    millis.div_ceil(1000) as i64
}

/// State of one counter.
#[derive(Debug)]
enum Counter {
    Fixed {
        count: u64,
        expires_at: u64,
    },
    Moving {
        hits: VecDeque<u64>,
    },
    SlidingCounter {
        window_start: u64,
        previous: u64,
        current: u64,
    },
}

impl Counter {
    fn new(strategy: Strategy, now: u64, period: u64) -> Self {
        match strategy {
            Strategy::FixedWindow => Counter::Fixed {
                count: 0,
                expires_at: now + period,
            },
            Strategy::MovingWindow => Counter::Moving {
                hits: VecDeque::new(),
            },
            Strategy::SlidingWindowCounter => Counter::SlidingCounter {
                window_start: now - now % period,
                previous: 0,
                current: 0,
            },
        }
    }

    /// Drop state that fell out of the window.
    fn refresh(&mut self, now: u64, period: u64) {
        match self {
            Counter::Fixed { count, expires_at } => {
                if now >= *expires_at {
                    *count = 0;
                    *expires_at = now + period;
                }
            }
            Counter::Moving { hits } => {
                while hits.front().is_some_and(|&at| at + period <= now) {
                    hits.pop_front();
                }
            }
            Counter::SlidingCounter {
                window_start,
                previous,
                current,
            } => {
                let aligned = now - now % period;
                if aligned > *window_start {
                    *previous = if aligned - *window_start >= 2 * period {
                        0
                    } else {
                        *current
                    };
                    *current = 0;
                    *window_start = aligned;
                }
            }
        }
    }

    fn used(&self, now: u64, period: u64) -> u64 {
        match self {
            Counter::Fixed { count, .. } => *count,
            Counter::Moving { hits } => hits.len() as u64,
            Counter::SlidingCounter {
                window_start,
                previous,
                current,
            } => {
                let elapsed = now.saturating_sub(*window_start).min(period);
                let weight = (period - elapsed) as f64 / period as f64;
                (*previous as f64 * weight).floor() as u64 + *current
            }
        }
    }

    fn consume(&mut self, now: u64, cost: u64) {
        match self {
            Counter::Fixed { count, .. } => *count += cost,
            Counter::Moving { hits } => hits.extend(std::iter::repeat(now).take(cost as usize)),
            Counter::SlidingCounter { current, .. } => *current += cost,
        }
    }

    fn reset_at(&self, now: u64, period: u64) -> i64 {
        match self {
            Counter::Fixed { expires_at, .. } => ceil_secs(*expires_at),
            Counter::Moving { hits } => ceil_secs(hits.front().copied().unwrap_or(now) + period),
            Counter::SlidingCounter { window_start, .. } => ceil_secs(*window_start + period),
        }
    }

    /// Whether the counter holds no state any more, so that dropping it is
    /// the same as starting over.
    fn expired(&self, now: u64, period: u64) -> bool {
        match self {
            Counter::Fixed { expires_at, .. } => now >= *expires_at,
            Counter::Moving { hits } => hits.back().map_or(true, |&at| at + period <= now),
            Counter::SlidingCounter { window_start, .. } => now >= *window_start + 2 * period,
        }
    }

    fn stats(&self, now: u64, item: &RateLimitItem) -> WindowStats {
        let period = period_millis(item);
        WindowStats {
            reset_at: self.reset_at(now, period),
            remaining: item.amount().saturating_sub(self.used(now, period)),
        }
    }
}

fn period_millis(item: &RateLimitItem) -> u64 {
    item.expiry_secs() * 1000
}

/// A counter and the window length it was created for.
#[derive(Debug)]
struct Slot {
    counter: Counter,
    period: u64,
}

/// In-memory backend for a single process.
pub struct MemoryBackend {
    counters: DashMap<String, Slot>,
    strategy: Strategy,
    clock: Arc<dyn Clock>,
    last_sweep: AtomicU64,
}

impl MemoryBackend {
    pub fn new(strategy: Strategy) -> Self {
        Self::with_clock(strategy, Arc::new(SystemClock))
    }

    pub fn with_clock(strategy: Strategy, clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            strategy,
            clock,
            last_sweep: AtomicU64::new(0),
        }
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop every counter whose window has elapsed. Runs at most once per
    /// [`SWEEP_INTERVAL`]; must not be called while holding a map guard.
    fn sweep(&self, now: u64) {
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now < last + SWEEP_INTERVAL.as_millis() as u64 {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let before = self.counters.len();
        self.counters
            .retain(|_, slot| !slot.counter.expired(now, slot.period));
        let swept = before.saturating_sub(self.counters.len());
        if swept > 0 {
            trace!(swept, remaining = self.counters.len(), "Expired memory counters swept");
        }
    }

    fn evaluate(&self, key: &str, item: &RateLimitItem, cost: u32, commit: bool) -> Consumption {
        let now = self.clock.now_millis();
        let period = period_millis(item);
        let cost = u64::from(cost);
        self.sweep(now);

        if !commit && !self.counters.contains_key(key) {
            let fresh = Counter::new(self.strategy, now, period);
            return Consumption {
                allowed: cost <= item.amount(),
                stats: fresh.stats(now, item),
            };
        }

        let mut slot = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Slot {
                counter: Counter::new(self.strategy, now, period),
                period,
            });
        slot.period = period;
        let counter = &mut slot.counter;
        counter.refresh(now, period);

        let allowed = counter.used(now, period) + cost <= item.amount();
        if allowed && commit {
            counter.consume(now, cost);
        }
        let stats = counter.stats(now, item);

        trace!(
            key = %key,
            allowed,
            remaining = stats.remaining,
            commit,
            "Memory counter evaluated"
        );

        Consumption { allowed, stats }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Strategy::default())
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("strategy", &self.strategy)
            .field("counters", &self.counters.len())
            .finish()
    }
}

#[async_trait]
impl CountingBackend for MemoryBackend {
    async fn hit(
        &self,
        key: &str,
        item: &RateLimitItem,
        cost: u32,
    ) -> Result<Consumption, BackendError> {
        Ok(self.evaluate(key, item, cost, true))
    }

    async fn test(
        &self,
        key: &str,
        item: &RateLimitItem,
        cost: u32,
    ) -> Result<Consumption, BackendError> {
        Ok(self.evaluate(key, item, cost, false))
    }

    async fn window_stats(
        &self,
        key: &str,
        item: &RateLimitItem,
    ) -> Result<WindowStats, BackendError> {
        Ok(self.evaluate(key, item, 0, false).stats)
    }

    async fn clear(&self, key: &str) -> Result<(), BackendError> {
        self.counters.remove(key);
        Ok(())
    }

    async fn reset(&self) -> Result<(), BackendError> {
        self.counters.clear();
        Ok(())
    }

    async fn check(&self) -> bool {
        true
    }

    fn strategy(&self) -> Strategy {
        self.strategy
    }
}
