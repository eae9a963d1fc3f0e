//! Switching between the primary backend and an in-memory fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::backend::CountingBackend;
use super::memory::{Clock, MemoryBackend, SystemClock};

/// Number of recovery probes after which the backoff starts over.
const MAX_BACKEND_CHECKS: u32 = 5;

#[derive(Debug, Default)]
struct ProbeSchedule {
    checks: u32,
    last_check_ms: u64,
}

impl ProbeSchedule {
    /// Whether a recovery probe is due, advancing the schedule if so.
    ///
    /// Probes are spaced `2^n` seconds apart, `n` restarting after
    /// `MAX_BACKEND_CHECKS` probes.
    fn due(&mut self, now_ms: u64) -> bool {
        if self.checks > MAX_BACKEND_CHECKS {
            self.checks = 0;
        }
        let wait_ms = (1u64 << self.checks) * 1000;
        if now_ms > self.last_check_ms + wait_ms {
            self.last_check_ms = now_ms;
            self.checks += 1;
            true
        } else {
            false
        }
    }
}

/// The backend that should serve a request.
pub struct ActiveBackend {
    pub backend: Arc<dyn CountingBackend>,
    pub fallback: bool,
}

/// Primary backend plus optional in-memory fallback.
///
/// The fallback does not share state with the primary; counts start from zero
/// whenever the limiter switches over.
pub struct Failover {
    primary: Arc<dyn CountingBackend>,
    fallback: Option<Arc<MemoryBackend>>,
    dead: AtomicBool,
    schedule: Mutex<ProbeSchedule>,
    clock: Arc<dyn Clock>,
}

impl Failover {
    pub fn new(primary: Arc<dyn CountingBackend>, fallback: Option<Arc<MemoryBackend>>) -> Self {
        Self::with_clock(primary, fallback, Arc::new(SystemClock))
    }

    pub fn with_clock(
        primary: Arc<dyn CountingBackend>,
        fallback: Option<Arc<MemoryBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            primary,
            fallback,
            dead: AtomicBool::new(false),
            schedule: Mutex::new(ProbeSchedule::default()),
            clock,
        }
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Record a primary failure. Returns `true` when a fallback is available
    /// and the request should be retried against it.
    pub fn mark_dead(&self) -> bool {
        if self.fallback.is_none() {
            return false;
        }
        if !self.dead.swap(true, Ordering::SeqCst) {
            warn!(
                strategy = %self.primary.strategy(),
                "Rate limit storage unreachable, switching to in-memory fallback"
            );
            *self.schedule.lock() = ProbeSchedule {
                checks: 0,
                last_check_ms: self.clock.now_millis(),
            };
        }
        true
    }

    /// The backend to use right now, probing the primary for recovery when a
    /// probe is due.
    pub async fn active(&self) -> ActiveBackend {
        if let (true, Some(fallback)) = (self.is_dead(), &self.fallback) {
            let due = self.schedule.lock().due(self.clock.now_millis());
            if due && self.primary.check().await {
                info!("Rate limit storage recovered, leaving in-memory fallback");
                self.dead.store(false, Ordering::SeqCst);
                *self.schedule.lock() = ProbeSchedule::default();
            } else {
                return ActiveBackend {
                    backend: fallback.clone(),
                    fallback: true,
                };
            }
        }
        ActiveBackend {
            backend: self.primary.clone(),
            fallback: false,
        }
    }

    /// The fallback when asked for and configured, the primary otherwise.
    pub fn backend(&self, fallback: bool) -> Arc<dyn CountingBackend> {
        match (&self.fallback, fallback) {
            (Some(memory), true) => memory.clone(),
            _ => self.primary.clone(),
        }
    }

    /// Every backend that may hold counters.
    pub fn all(&self) -> Vec<Arc<dyn CountingBackend>> {
        let mut backends = vec![self.primary.clone()];
        if let Some(fallback) = &self.fallback {
            backends.push(fallback.clone() as Arc<dyn CountingBackend>);
        }
        backends
    }
}
