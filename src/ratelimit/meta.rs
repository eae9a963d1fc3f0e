//! Meta limits: limits on how often an identity breaches other limits.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info};

use crate::error::{LimiterError, Result};

use super::backend::CountingBackend;
use super::context::{RequestContext, RequestLimit};
use super::enforcement::Enforcer;
use super::limit::{KeyFunc, RuntimeLimit};

/// Checks and records meta limit buckets.
///
/// Meta buckets are keyed by identity and meta scope only, so one identity
/// shares them across every route.
#[derive(Debug, Clone, Default)]
pub struct MetaLimitGuard {
    enforcer: Enforcer,
}

impl MetaLimitGuard {
    pub fn new(enforcer: Enforcer) -> Self {
        Self { enforcer }
    }

    /// Meta limits to record for a breach: every global one plus those
    /// attached to a breached limit.
    pub fn triggered<'a>(
        global: &'a [RuntimeLimit],
        attached: &'a [RuntimeLimit],
        breached: &'a [RequestLimit],
    ) -> Vec<RuntimeLimit> {
        global
            .iter()
            .chain(attached.iter().filter(|meta| {
                breached.iter().any(|b| {
                    b.spec
                        .meta_limits()
                        .iter()
                        .any(|spec| Arc::ptr_eq(spec, &meta.spec))
                })
            }))
            .cloned()
            .collect()
    }

    /// Peek every meta limit at its cost for this request. The first one
    /// that cannot absorb that cost blocks the request.
    pub async fn check(
        &self,
        meta: &[RuntimeLimit],
        ctx: &RequestContext,
        backend: &dyn CountingBackend,
        default_key: &KeyFunc,
    ) -> Result<Option<RequestLimit>> {
        for limit in meta {
            let Some((key, bucket)) = self.enforcer.key_for(limit, ctx, default_key)? else {
                continue;
            };
            let cost = match limit.spec.cost_for(ctx) {
                Ok(cost) => cost,
                Err(e) if self.enforcer.policy().swallow_errors => {
                    error!(key = %key, error = %e, "Meta limit cost function failed, ignoring");
                    1
                }
                Err(e) => return Err(e.into()),
            };
            if cost == 0 {
                continue;
            }
            let consumption = match backend.test(&key, &limit.item, cost).await {
                Ok(consumption) => consumption,
                Err(e) if self.enforcer.policy().swallow_errors => {
                    error!(key = %key, error = %e, "Meta limit check failed, ignoring");
                    continue;
                }
                Err(e) => return Err(LimiterError::Backend(e)),
            };
            if !consumption.allowed {
                info!(
                    key = %key,
                    route = %ctx.route_id,
                    reset_at = consumption.stats.reset_at,
                    "Request blocked by meta limit"
                );
                return Ok(Some(RequestLimit {
                    limit: limit.item,
                    key,
                    remaining: consumption.stats.remaining,
                    reset_at: consumption.stats.reset_at,
                    breached: true,
                    shared: bucket.shared,
                    category: limit.category.clone(),
                    spec: limit.spec.clone(),
                }));
            }
        }
        Ok(None)
    }

    /// Record one breach against every given meta limit. Returns the number
    /// of buckets hit.
    pub async fn record(
        &self,
        meta: &[RuntimeLimit],
        ctx: &RequestContext,
        backend: &dyn CountingBackend,
        default_key: &KeyFunc,
    ) -> Result<usize> {
        let mut seen = HashSet::new();
        for limit in meta {
            let Some((key, _)) = self.enforcer.key_for(limit, ctx, default_key)? else {
                continue;
            };
            if !seen.insert(key.clone()) {
                continue;
            }
            match backend.hit(&key, &limit.item, 1).await {
                Ok(_) => {}
                Err(e) if self.enforcer.policy().swallow_errors => {
                    error!(key = %key, error = %e, "Failed to record meta limit breach");
                }
                Err(e) => return Err(LimiterError::Backend(e)),
            }
        }
        Ok(seen.len())
    }

    /// Record a breach when one happened, then report whether the identity
    /// is meta blocked.
    pub async fn check_and_record(
        &self,
        meta: &[RuntimeLimit],
        ctx: &RequestContext,
        breached: bool,
        backend: &dyn CountingBackend,
        default_key: &KeyFunc,
    ) -> Result<bool> {
        if breached {
            self.record(meta, ctx, backend, default_key).await?;
        }
        Ok(self.check(meta, ctx, backend, default_key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::limit::{remote_address, LimitCategory, LimitSpec};
    use crate::ratelimit::memory::MemoryBackend;

    fn meta(expression: &str) -> Vec<RuntimeLimit> {
        let ctx = RequestContext::new("any", "GET");
        RuntimeLimit::expand(&Arc::new(LimitSpec::new(expression)), LimitCategory::Meta, &ctx)
            .unwrap()
    }

    fn ctx(route: &str) -> RequestContext {
        RequestContext::new(route, "GET").with_remote_addr("1.2.3.4")
    }

    #[tokio::test]
    async fn test_blocks_after_recorded_breaches() {
        let guard = MetaLimitGuard::default();
        let backend = MemoryBackend::default();
        let meta = meta("2/hour");
        let key = remote_address();

        assert!(!guard.check_and_record(&meta, &ctx("a"), false, &backend, &key).await.unwrap());
        assert!(!guard.check_and_record(&meta, &ctx("a"), true, &backend, &key).await.unwrap());
        assert!(guard.check_and_record(&meta, &ctx("b"), true, &backend, &key).await.unwrap());

        // Shared across routes, keyed by identity.
        let blocked = guard.check(&meta, &ctx("c"), &backend, &key).await.unwrap().unwrap();
        assert_eq!(blocked.key, "LIMITER:2/1/hour:1.2.3.4:meta");
        assert!(blocked.breached);

        let other = RequestContext::new("c", "GET").with_remote_addr("5.6.7.8");
        assert!(guard.check(&meta, &other, &backend, &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_check_does_not_consume() {
        let guard = MetaLimitGuard::default();
        let backend = MemoryBackend::default();
        let meta = meta("1/hour");
        for _ in 0..5 {
            assert!(guard
                .check(&meta, &ctx("a"), &backend, &remote_address())
                .await
                .unwrap()
                .is_none());
        }
        assert_eq!(
            guard.record(&meta, &ctx("a"), &backend, &remote_address()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_check_uses_meta_limit_cost() {
        let guard = MetaLimitGuard::default();
        let backend = MemoryBackend::default();
        let ctx = ctx("a");
        let key = remote_address();
        let spec = Arc::new(LimitSpec::new("3/hour").cost(2));
        let meta = RuntimeLimit::expand(&spec, LimitCategory::Meta, &ctx).unwrap();

        // One recorded breach leaves room for a cost of two.
        assert!(!guard.check_and_record(&meta, &ctx, true, &backend, &key).await.unwrap());
        // Two leave one unit, which a cost of one would still fit into.
        assert!(guard.check_and_record(&meta, &ctx, true, &backend, &key).await.unwrap());

        let free = Arc::new(LimitSpec::new("1/hour").cost(0));
        let free_meta = RuntimeLimit::expand(&free, LimitCategory::Meta, &ctx).unwrap();
        guard.record(&free_meta, &ctx, &backend, &key).await.unwrap();
        assert!(guard.check(&free_meta, &ctx, &backend, &key).await.unwrap().is_none());
    }

    #[test]
    fn test_triggered_selects_attached_meta_of_breached_limits() {
        let attached_spec = LimitSpec::new("3/day");
        let parent = Arc::new(LimitSpec::new("1/minute").meta_limit(attached_spec));
        let ctx = ctx("login");
        let attached =
            RuntimeLimit::expand(&parent.meta_limits()[0], LimitCategory::Meta, &ctx).unwrap();
        let global = meta("2/hour");

        let breach = RequestLimit {
            limit: parent.static_items().unwrap()[0],
            key: "k".into(),
            remaining: 0,
            reset_at: 0,
            breached: true,
            shared: false,
            category: LimitCategory::Route("login".into()),
            spec: parent.clone(),
        };
        assert_eq!(MetaLimitGuard::triggered(&global, &attached, &[breach]).len(), 2);
        assert_eq!(MetaLimitGuard::triggered(&global, &attached, &[]).len(), 1);
    }
}
