//! Evaluation of resolved limits against a counting backend.

use std::collections::HashSet;

use tracing::{debug, error, trace};

use crate::error::{CallbackError, LimiterError, Result};

use super::backend::CountingBackend;
use super::context::{RequestContext, RequestLimit, ResponseInfo};
use super::key::{Bucket, LimitKey};
use super::limit::{KeyFunc, RuntimeLimit};

/// How limits are evaluated.
#[derive(Debug, Clone)]
pub struct EnforcementPolicy {
    /// Stop at the first breached limit instead of consuming all of them.
    pub fail_on_first_breach: bool,
    /// Log and ignore backend and callback failures.
    pub swallow_errors: bool,
    pub key_prefix: String,
}

impl Default for EnforcementPolicy {
    fn default() -> Self {
        Self {
            fail_on_first_breach: true,
            swallow_errors: false,
            key_prefix: "LIMITER".to_string(),
        }
    }
}

/// A hit postponed until the response is known.
#[derive(Debug, Clone)]
pub struct PendingDeduction {
    pub limit: RuntimeLimit,
    pub key: String,
    pub cost: u32,
}

/// Outcome of evaluating the limits of one request.
#[derive(Debug, Clone, Default)]
pub struct EnforcementDecision {
    pub allowed: bool,
    /// Every breached limit, in evaluation order.
    pub breached: Vec<RequestLimit>,
    /// The limit that governs the response headers.
    pub reported: Option<RequestLimit>,
    pub all_tested: Vec<RequestLimit>,
    /// A backend failure was swallowed while evaluating.
    pub failed: bool,
    pub pending: Vec<PendingDeduction>,
}

impl EnforcementDecision {
    /// The first breached limit.
    pub fn first_breach(&self) -> Option<&RequestLimit> {
        self.breached.first()
    }
}

/// Pick the limit to report: the first breach, otherwise the smallest window
/// with the earliest one winning ties.
pub fn select_reported(tested: &[RequestLimit]) -> Option<RequestLimit> {
    if let Some(breached) = tested.iter().find(|l| l.breached) {
        return Some(breached.clone());
    }
    tested
        .iter()
        .fold(None::<&RequestLimit>, |best, candidate| match best {
            Some(best) if best.limit.expiry_secs() <= candidate.limit.expiry_secs() => Some(best),
            _ => Some(candidate),
        })
        .cloned()
}

/// Stateless evaluator of limits.
#[derive(Debug, Clone, Default)]
pub struct Enforcer {
    policy: EnforcementPolicy,
}

impl Enforcer {
    pub fn new(policy: EnforcementPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EnforcementPolicy {
        &self.policy
    }

    fn callback<T>(
        &self,
        result: std::result::Result<T, CallbackError>,
        fallback: T,
        what: &str,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if self.policy.swallow_errors => {
                error!(error = %e, "{} failed, ignoring", what);
                Ok(fallback)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Storage key of a limit for this request, `None` when the limit has no
    /// identity to count against.
    pub fn key_for(
        &self,
        limit: &RuntimeLimit,
        ctx: &RequestContext,
        default_key: &KeyFunc,
    ) -> Result<Option<(String, Bucket)>> {
        let key_func = limit.spec.key_function().unwrap_or(default_key);
        let Some(identity) = self.callback(key_func.evaluate(ctx).map(Some), None, "key function")?
        else {
            return Ok(None);
        };
        if identity.is_empty() {
            debug!(
                route = %ctx.route_id,
                limit = %limit.item,
                "Empty rate limit key, skipping limit"
            );
            return Ok(None);
        }
        let Some(bucket) = self.callback(Bucket::for_limit(limit, ctx).map(Some), None, "scope")?
        else {
            return Ok(None);
        };
        let key = LimitKey::new(&self.policy.key_prefix, limit.item, &identity, &bucket);
        Ok(Some((key.to_string_key(), bucket)))
    }

    /// Evaluate limits in order, consuming from the backend as configured.
    pub async fn evaluate(
        &self,
        limits: &[RuntimeLimit],
        ctx: &RequestContext,
        backend: &dyn CountingBackend,
        default_key: &KeyFunc,
    ) -> Result<EnforcementDecision> {
        let mut decision = EnforcementDecision {
            allowed: true,
            ..Default::default()
        };
        let mut seen = HashSet::new();

        for limit in limits {
            let cost = self.callback(limit.spec.cost_for(ctx), 1, "cost function")?;
            if cost == 0 {
                trace!(route = %ctx.route_id, limit = %limit.item, "Zero cost, skipping limit");
                continue;
            }
            let Some((key, bucket)) = self.key_for(limit, ctx, default_key)? else {
                continue;
            };
            if !seen.insert(key.clone()) {
                trace!(key = %key, "Limit already evaluated for this request");
                continue;
            }

            let deferred = limit.spec.has_deferred_deduction();
            let result = if deferred {
                backend.test(&key, &limit.item, cost).await
            } else {
                backend.hit(&key, &limit.item, cost).await
            };
            let consumption = match result {
                Ok(consumption) => consumption,
                Err(e) if self.policy.swallow_errors => {
                    error!(key = %key, error = %e, "Rate limit storage failed, limit skipped");
                    decision.failed = true;
                    continue;
                }
                Err(e) => return Err(LimiterError::Backend(e)),
            };

            let tested = RequestLimit {
                limit: limit.item,
                key: key.clone(),
                remaining: consumption.stats.remaining,
                reset_at: consumption.stats.reset_at,
                breached: !consumption.allowed,
                shared: bucket.shared,
                category: limit.category.clone(),
                spec: limit.spec.clone(),
            };
            trace!(
                key = %key,
                remaining = tested.remaining,
                breached = tested.breached,
                deferred,
                "Limit evaluated"
            );

            if deferred && consumption.allowed {
                decision.pending.push(PendingDeduction {
                    limit: limit.clone(),
                    key,
                    cost,
                });
            }
            let breached = tested.breached;
            if breached {
                decision.allowed = false;
                decision.breached.push(tested.clone());
            }
            decision.all_tested.push(tested);
            if breached && self.policy.fail_on_first_breach {
                break;
            }
        }

        decision.reported = select_reported(&decision.all_tested);
        if !decision.allowed {
            // Deferred hits of a denied request never happen.
            decision.pending.clear();
        }
        Ok(decision)
    }

    /// Apply deferred deductions once the response is known. Returns the
    /// number of hits made.
    pub async fn deduct(
        &self,
        pending: &[PendingDeduction],
        response: &ResponseInfo,
        backend: &dyn CountingBackend,
    ) -> Result<usize> {
        let mut deducted = 0;
        for deduction in pending {
            if !self.callback(deduction.limit.spec.should_deduct(response), false, "deduct_when")? {
                continue;
            }
            match backend
                .hit(&deduction.key, &deduction.limit.item, deduction.cost)
                .await
            {
                Ok(consumption) => {
                    deducted += 1;
                    debug!(
                        key = %deduction.key,
                        status = response.status,
                        remaining = consumption.stats.remaining,
                        "Deferred deduction applied"
                    );
                }
                Err(e) if self.policy.swallow_errors => {
                    error!(key = %deduction.key, error = %e, "Deferred deduction failed");
                }
                Err(e) => return Err(LimiterError::Backend(e)),
            }
        }
        Ok(deducted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::error::BackendError;
    use crate::ratelimit::backend::{Consumption, Strategy, WindowStats};
    use crate::ratelimit::limit::{remote_address, Evaluatable, LimitCategory, LimitSpec};
    use crate::ratelimit::memory::MemoryBackend;
    use crate::ratelimit::rate::RateLimitItem;

    struct Unreachable;

    fn lenient() -> Enforcer {
        Enforcer::new(EnforcementPolicy {
            swallow_errors: true,
            ..Default::default()
        })
    }

    #[async_trait]
    impl CountingBackend for Unreachable {
        async fn hit(
            &self,
            _: &str,
            _: &RateLimitItem,
            _: u32,
        ) -> std::result::Result<Consumption, BackendError> {
            Err(BackendError::Timeout(std::time::Duration::from_millis(50)))
        }
        async fn test(
            &self,
            _: &str,
            _: &RateLimitItem,
            _: u32,
        ) -> std::result::Result<Consumption, BackendError> {
            Err(BackendError::Unavailable("connection refused".into()))
        }
        async fn window_stats(
            &self,
            _: &str,
            _: &RateLimitItem,
        ) -> std::result::Result<WindowStats, BackendError> {
            Err(BackendError::Unavailable("connection refused".into()))
        }
        async fn clear(&self, _: &str) -> std::result::Result<(), BackendError> {
            Ok(())
        }
        async fn reset(&self) -> std::result::Result<(), BackendError> {
            Ok(())
        }
        async fn check(&self) -> bool {
            false
        }
        fn strategy(&self) -> Strategy {
            Strategy::FixedWindow
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("route", "GET").with_remote_addr("1.2.3.4")
    }

    fn limits(spec: LimitSpec, category: LimitCategory) -> Vec<RuntimeLimit> {
        RuntimeLimit::expand(&Arc::new(spec), category, &ctx()).unwrap()
    }

    #[tokio::test]
    async fn test_exhausts_then_denies() {
        let enforcer = Enforcer::default();
        let backend = MemoryBackend::default();
        let limits = limits(LimitSpec::new("2/minute"), LimitCategory::Default);
        let key = remote_address();

        for remaining in [1, 0] {
            let decision = enforcer.evaluate(&limits, &ctx(), &backend, &key).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.reported.unwrap().remaining, remaining);
        }
        let decision = enforcer.evaluate(&limits, &ctx(), &backend, &key).await.unwrap();
        assert!(!decision.allowed);
        let breach = decision.first_breach().unwrap();
        assert_eq!(breach.key, "LIMITER:2/1/minute:1.2.3.4:route");
        assert_eq!(decision.reported.as_ref().unwrap().key, breach.key);
    }

    #[tokio::test]
    async fn test_fail_on_first_breach_stops_consuming() {
        let backend = MemoryBackend::default();
        let key = remote_address();
        let mut all = limits(LimitSpec::new("1/minute"), LimitCategory::Default);
        all.extend(limits(LimitSpec::new("10/hour"), LimitCategory::Route("route".into())));

        let enforcer = Enforcer::default();
        enforcer.evaluate(&all, &ctx(), &backend, &key).await.unwrap();
        let denied = enforcer.evaluate(&all, &ctx(), &backend, &key).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.all_tested.len(), 1);

        let hourly = backend
            .window_stats("LIMITER:10/1/hour:1.2.3.4:route", &all[1].item)
            .await
            .unwrap();
        assert_eq!(hourly.remaining, 9);
    }

    #[tokio::test]
    async fn test_consume_all_mode_hits_every_limit() {
        let backend = MemoryBackend::default();
        let key = remote_address();
        let mut all = limits(LimitSpec::new("1/minute"), LimitCategory::Default);
        all.extend(limits(LimitSpec::new("10/hour"), LimitCategory::Route("route".into())));

        let enforcer = Enforcer::new(EnforcementPolicy {
            fail_on_first_breach: false,
            ..Default::default()
        });
        enforcer.evaluate(&all, &ctx(), &backend, &key).await.unwrap();
        let denied = enforcer.evaluate(&all, &ctx(), &backend, &key).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.all_tested.len(), 2);
        assert_eq!(denied.breached.len(), 1);
        assert_eq!(denied.all_tested[1].remaining, 8);
    }

    #[tokio::test]
    async fn test_reported_is_smallest_window() {
        let backend = MemoryBackend::default();
        let mut all = limits(LimitSpec::new("100/day"), LimitCategory::Default);
        all.extend(limits(
            LimitSpec::new("10/minute;20/minute"),
            LimitCategory::Route("route".into()),
        ));

        let decision = Enforcer::default()
            .evaluate(&all, &ctx(), &backend, &remote_address())
            .await
            .unwrap();
        let reported = decision.reported.unwrap();
        assert_eq!(reported.limit, RateLimitItem::per_minute(10).unwrap());
        assert_eq!(reported.remaining, 9);
    }

    #[tokio::test]
    async fn test_zero_cost_never_denies() {
        let backend = MemoryBackend::default();
        let limits = limits(
            LimitSpec::new("1/hour").cost(Evaluatable::dynamic(|_: &RequestContext| 0u32)),
            LimitCategory::Default,
        );
        for _ in 0..10 {
            let decision = Enforcer::default()
                .evaluate(&limits, &ctx(), &backend, &remote_address())
                .await
                .unwrap();
            assert!(decision.allowed);
            assert!(decision.reported.is_none());
        }
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_keys_counted_once() {
        let backend = MemoryBackend::default();
        let mut all = limits(LimitSpec::new("5/minute").shared("x"), LimitCategory::Default);
        all.extend(limits(
            LimitSpec::new("5/minute").shared("x"),
            LimitCategory::Route("route".into()),
        ));

        let decision = Enforcer::default()
            .evaluate(&all, &ctx(), &backend, &remote_address())
            .await
            .unwrap();
        assert_eq!(decision.all_tested.len(), 1);
        assert_eq!(decision.reported.unwrap().remaining, 4);
    }

    #[tokio::test]
    async fn test_empty_identity_skips_limit() {
        let backend = MemoryBackend::default();
        let limits = limits(
            LimitSpec::new("1/hour")
                .key_func(Evaluatable::dynamic(|_: &RequestContext| String::new())),
            LimitCategory::Default,
        );
        let decision = Enforcer::default()
            .evaluate(&limits, &ctx(), &backend, &remote_address())
            .await
            .unwrap();
        assert!(decision.all_tested.is_empty());
    }

    #[tokio::test]
    async fn test_deferred_deduction() {
        let backend = MemoryBackend::default();
        let enforcer = Enforcer::default();
        let limits = limits(
            LimitSpec::new("2/minute").deduct_when(|response| response.status != 200),
            LimitCategory::Route("route".into()),
        );
        let key = remote_address();

        for _ in 0..5 {
            let decision = enforcer.evaluate(&limits, &ctx(), &backend, &key).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.pending.len(), 1);
            let deducted = enforcer
                .deduct(&decision.pending, &ResponseInfo::new(200), &backend)
                .await
                .unwrap();
            assert_eq!(deducted, 0);
        }

        for _ in 0..2 {
            let decision = enforcer.evaluate(&limits, &ctx(), &backend, &key).await.unwrap();
            enforcer
                .deduct(&decision.pending, &ResponseInfo::new(500), &backend)
                .await
                .unwrap();
        }
        let decision = enforcer.evaluate(&limits, &ctx(), &backend, &key).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.pending.is_empty());
    }

    #[tokio::test]
    async fn test_backend_errors_follow_policy() {
        let limits = limits(LimitSpec::new("1/second"), LimitCategory::Default);

        let strict = Enforcer::default();
        let result = strict
            .evaluate(&limits, &ctx(), &Unreachable, &remote_address())
            .await;
        assert!(matches!(
            result,
            Err(LimiterError::Backend(BackendError::Timeout(_)))
        ));

        let decision = lenient()
            .evaluate(&limits, &ctx(), &Unreachable, &remote_address())
            .await
            .unwrap();
        assert!(decision.allowed);
        assert!(decision.failed);
    }

    #[tokio::test]
    async fn test_cost_callback_error_counts_as_one_when_swallowed() {
        let backend = MemoryBackend::default();
        let limits = limits(
            LimitSpec::new("5/minute").cost(Evaluatable::fallible(|_: &RequestContext| {
                Err(CallbackError::new("no cost"))
            })),
            LimitCategory::Default,
        );
        let strict = Enforcer::default();
        assert!(strict
            .evaluate(&limits, &ctx(), &backend, &remote_address())
            .await
            .is_err());

        let decision = lenient()
            .evaluate(&limits, &ctx(), &backend, &remote_address())
            .await
            .unwrap();
        assert_eq!(decision.reported.unwrap().remaining, 4);
    }

    #[test]
    fn test_select_reported_prefers_earliest_on_ties() {
        let spec = Arc::new(LimitSpec::new("1/minute"));
        let make = |key: &str, item: RateLimitItem, breached: bool| RequestLimit {
            limit: item,
            key: key.to_string(),
            remaining: 1,
            reset_at: 0,
            breached,
            shared: false,
            category: LimitCategory::Default,
            spec: spec.clone(),
        };
        let minute = RateLimitItem::per_minute(5).unwrap();
        let hour = RateLimitItem::per_hour(5).unwrap();

        let tested = vec![
            make("a", hour, false),
            make("b", minute, false),
            make("c", minute, false),
        ];
        assert_eq!(select_reported(&tested).unwrap().key, "b");

        let tested = vec![make("a", minute, false), make("b", hour, true)];
        assert_eq!(select_reported(&tested).unwrap().key, "b");
        assert!(select_reported(&[]).is_none());
    }
}
