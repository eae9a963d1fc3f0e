//! The limiter: wires limit resolution, meta limits, enforcement, backend
//! failover and response headers together.
//!
//! A request goes through [`Limiter::check`] before it is handled and through
//! [`Limiter::finalize`] once its response is known.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::LimiterConfig;
use crate::error::{CallbackError, LimiterError, Result};
use crate::scope::{ExemptionScope, ScopeTreeResolver};

use super::backend::CountingBackend;
use super::context::{RequestContext, RequestLimit, ResponseInfo};
use super::enforcement::{EnforcementDecision, EnforcementPolicy, Enforcer};
use super::failover::Failover;
use super::headers::populate_headers;
use super::limit::{
    remote_address, BreachCallback, KeyFunc, LimitCategory, LimitSpec, RuntimeLimit,
};
use super::manager::{LimitManager, RegisteredLimit, ResolvedLimits};
use super::memory::{Clock, MemoryBackend, SystemClock};
use super::meta::MetaLimitGuard;

/// Predicate over a request. A filter returning `true` exempts the request
/// from every limit.
pub type RequestFilter = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>;

/// Details of a rejected request.
#[derive(Debug, Clone)]
pub struct Breach {
    /// The limit that rejected the request.
    pub limit: RequestLimit,
    pub message: String,
    /// Custom response body produced by a breach callback.
    pub response: Option<String>,
    /// Whether a meta limit blocked the request.
    pub meta: bool,
}

/// Outcome of an allowed request, passed back to [`Limiter::finalize`].
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub decision: EnforcementDecision,
    /// The request was counted by the in-memory fallback.
    pub fallback: bool,
    /// No limit was evaluated: the limiter is disabled or a filter matched.
    pub skipped: bool,
}

impl RequestOutcome {
    fn skipped() -> Self {
        Self {
            decision: EnforcementDecision {
                allowed: true,
                ..Default::default()
            },
            fallback: false,
            skipped: true,
        }
    }

    /// The limit describing this request in headers.
    pub fn reported(&self) -> Option<&RequestLimit> {
        self.decision.reported.as_ref()
    }
}

enum Evaluation {
    MetaBlocked(RequestLimit),
    Decided(EnforcementDecision),
}

/// Builder for [`Limiter`].
pub struct LimiterBuilder {
    config: LimiterConfig,
    backend: Option<Arc<dyn CountingBackend>>,
    key_func: KeyFunc,
    default_limits: Option<Vec<LimitSpec>>,
    application_limits: Option<Vec<LimitSpec>>,
    meta_limits: Option<Vec<LimitSpec>>,
    on_breach: Option<BreachCallback>,
    on_meta_breach: Option<BreachCallback>,
    request_filters: Vec<RequestFilter>,
    clock: Arc<dyn Clock>,
}

impl LimiterBuilder {
    /// Counting backend. Defaults to a [`MemoryBackend`] with the configured
    /// strategy.
    pub fn backend(mut self, backend: Arc<dyn CountingBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Identity of a request, used by every limit without its own key function.
    pub fn key_func(mut self, key_func: impl Into<KeyFunc>) -> Self {
        self.key_func = key_func.into();
        self
    }

    /// Replace the default limits of the configuration.
    pub fn default_limits(mut self, limits: Vec<LimitSpec>) -> Self {
        self.default_limits = Some(limits);
        self
    }

    pub fn application_limits(mut self, limits: Vec<LimitSpec>) -> Self {
        self.application_limits = Some(limits);
        self
    }

    pub fn meta_limits(mut self, limits: Vec<LimitSpec>) -> Self {
        self.meta_limits = Some(limits);
        self
    }

    /// Called for the first breached limit of a rejected request.
    pub fn on_breach<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RequestLimit) -> std::result::Result<Option<String>, CallbackError>
            + Send
            + Sync
            + 'static,
    {
        self.on_breach = Some(Arc::new(callback));
        self
    }

    /// Called when a meta limit blocks a request.
    pub fn on_meta_breach<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RequestLimit) -> std::result::Result<Option<String>, CallbackError>
            + Send
            + Sync
            + 'static,
    {
        self.on_meta_breach = Some(Arc::new(callback));
        self
    }

    pub fn request_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&RequestContext) -> bool + Send + Sync + 'static,
    {
        self.request_filters.push(Arc::new(filter));
        self
    }

    /// Time source of the built-in memory backends and recovery probes.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Limiter> {
        let config = self.config;
        let swallow_errors = config.swallow_errors;

        let mut manager = LimitManager::new(Arc::new(ScopeTreeResolver::new()), swallow_errors);
        manager.set_default_limits(self.default_limits.unwrap_or_else(|| config.default_specs()))?;
        manager.set_application_limits(
            self.application_limits
                .unwrap_or_else(|| config.application_specs()),
        )?;
        manager.set_meta_limits(self.meta_limits.unwrap_or_else(|| config.meta_specs()))?;

        for namespace in &config.namespaces {
            manager.register_namespace(&namespace.name, namespace.parent.as_deref())?;
            for entry in &namespace.limits {
                manager.add_namespace_limit(&namespace.name, entry.to_spec())?;
            }
            if let Some(flags) = namespace.exempt {
                manager.exempt_namespace(&namespace.name, flags)?;
            }
        }
        for route in &config.routes {
            manager.register_route(&route.id, route.namespaces.iter().cloned());
            for entry in &route.limits {
                manager.add_route_limit(&route.id, entry.to_spec())?;
            }
            if let Some(flags) = route.exempt {
                manager.exempt_route(&route.id, flags);
            }
        }

        let fallback_limits = config
            .fallback_specs()
            .into_iter()
            .map(|spec| {
                spec.validate().map_err(|e| {
                    LimiterError::Configuration(format!("invalid in-memory fallback limit: {}", e))
                })?;
                Ok(Arc::new(spec))
            })
            .collect::<Result<Vec<_>>>()?;

        let primary = self.backend.unwrap_or_else(|| {
            Arc::new(MemoryBackend::with_clock(config.strategy, self.clock.clone()))
                as Arc<dyn CountingBackend>
        });
        let fallback = config.fallback_enabled().then(|| {
            Arc::new(MemoryBackend::with_clock(config.strategy, self.clock.clone()))
        });
        let failover = Failover::with_clock(primary, fallback, self.clock.clone());

        let enforcer = Enforcer::new(EnforcementPolicy {
            fail_on_first_breach: config.fail_on_first_breach,
            swallow_errors,
            key_prefix: config.key_prefix.clone(),
        });

        info!(
            enabled = config.enabled,
            strategy = %config.strategy,
            defaults = manager.default_limits().len(),
            application = manager.application_limits().len(),
            meta = manager.meta_limits().len(),
            fallback = failover.has_fallback(),
            "Rate limiter initialized"
        );

        Ok(Limiter {
            config,
            manager,
            enforcer,
            failover,
            key_func: self.key_func,
            fallback_limits,
            on_breach: self.on_breach,
            on_meta_breach: self.on_meta_breach,
            request_filters: self.request_filters,
            clock: self.clock,
        })
    }
}

/// Request-level rate limiter.
///
/// `Send + Sync`; share it through an `Arc`.
pub struct Limiter {
    config: LimiterConfig,
    manager: LimitManager,
    enforcer: Enforcer,
    failover: Failover,
    key_func: KeyFunc,
    fallback_limits: Vec<Arc<LimitSpec>>,
    on_breach: Option<BreachCallback>,
    on_meta_breach: Option<BreachCallback>,
    request_filters: Vec<RequestFilter>,
    clock: Arc<dyn Clock>,
}

impl Limiter {
    pub fn builder(config: LimiterConfig) -> LimiterBuilder {
        LimiterBuilder {
            config,
            backend: None,
            key_func: remote_address(),
            default_limits: None,
            application_limits: None,
            meta_limits: None,
            on_breach: None,
            on_meta_breach: None,
            request_filters: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// A limiter over the given configuration with an in-memory backend.
    pub fn from_config(config: LimiterConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn manager(&self) -> &LimitManager {
        &self.manager
    }

    pub fn register_namespace(&self, name: &str, parent: Option<&str>) -> Result<()> {
        self.manager.register_namespace(name, parent)
    }

    pub fn namespace_limit(&self, namespace: &str, spec: LimitSpec) -> Result<()> {
        self.manager.add_namespace_limit(namespace, spec)
    }

    pub fn exempt_namespace(&self, namespace: &str, flags: ExemptionScope) -> Result<()> {
        self.manager.exempt_namespace(namespace, flags)
    }

    pub fn register_route<I, S>(&self, route_id: &str, namespace_chain: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manager.register_route(route_id, namespace_chain)
    }

    pub fn route_limit(&self, route_id: &str, spec: LimitSpec) -> Result<()> {
        self.manager.add_route_limit(route_id, spec)
    }

    pub fn exempt_route(&self, route_id: &str, flags: ExemptionScope) {
        self.manager.exempt_route(route_id, flags)
    }

    pub fn registered_limits(&self) -> Vec<RegisteredLimit> {
        self.manager.registered_limits()
    }

    /// Whether the primary backend is currently replaced by the fallback.
    pub fn using_fallback(&self) -> bool {
        self.failover.is_dead()
    }

    fn now_secs(&self) -> i64 {
        (self.clock.now_millis() / 1000) as i64
    }

    /// Evaluate every limit of a request.
    ///
    /// Returns [`LimiterError::RateLimitExceeded`] when the request must be
    /// rejected.
    pub async fn check(&self, ctx: &RequestContext) -> Result<RequestOutcome> {
        if !self.config.enabled {
            return Ok(RequestOutcome::skipped());
        }
        if self.request_filters.iter().any(|filter| filter(ctx)) {
            debug!(route = %ctx.route_id, "Request exempted by filter");
            return Ok(RequestOutcome::skipped());
        }

        let resolved = self.manager.resolve(ctx)?;
        let active = self.failover.active().await;

        let (evaluation, fallback) = if active.fallback {
            (self.evaluate_fallback(&resolved, ctx).await?, true)
        } else {
            match self.evaluate(&resolved, ctx, active.backend.as_ref()).await {
                Err(LimiterError::Backend(e)) if self.failover.mark_dead() => {
                    warn!(
                        route = %ctx.route_id,
                        error = %e,
                        "Re-evaluating request against in-memory fallback"
                    );
                    (self.evaluate_fallback(&resolved, ctx).await?, true)
                }
                Ok(Evaluation::Decided(decision))
                    if decision.failed && self.failover.mark_dead() =>
                {
                    warn!(
                        route = %ctx.route_id,
                        "Re-evaluating request against in-memory fallback"
                    );
                    (self.evaluate_fallback(&resolved, ctx).await?, true)
                }
                other => (other?, false),
            }
        };

        match evaluation {
            Evaluation::MetaBlocked(limit) => Err(self.meta_breach(limit, ctx)),
            Evaluation::Decided(decision) if !decision.allowed => Err(self.breach(decision, ctx)),
            Evaluation::Decided(decision) => Ok(RequestOutcome {
                decision,
                fallback,
                skipped: false,
            }),
        }
    }

    async fn evaluate_fallback(
        &self,
        resolved: &ResolvedLimits,
        ctx: &RequestContext,
    ) -> Result<Evaluation> {
        let backend = self.failover.backend(true);
        if self.fallback_limits.is_empty() {
            return self.evaluate(resolved, ctx, backend.as_ref()).await;
        }
        let mut limits = Vec::new();
        for spec in &self.fallback_limits {
            limits.extend(RuntimeLimit::expand(spec, LimitCategory::Default, ctx)?);
        }
        let replaced = ResolvedLimits {
            limits,
            ..resolved.clone()
        };
        self.evaluate(&replaced, ctx, backend.as_ref()).await
    }

    async fn evaluate(
        &self,
        resolved: &ResolvedLimits,
        ctx: &RequestContext,
        backend: &dyn CountingBackend,
    ) -> Result<Evaluation> {
        let guard = MetaLimitGuard::new(self.enforcer.clone());
        let all_meta: Vec<RuntimeLimit> = resolved
            .meta
            .iter()
            .chain(resolved.limit_meta.iter())
            .cloned()
            .collect();
        if let Some(blocked) = guard.check(&all_meta, ctx, backend, &self.key_func).await? {
            return Ok(Evaluation::MetaBlocked(blocked));
        }

        let decision = self
            .enforcer
            .evaluate(&resolved.limits, ctx, backend, &self.key_func)
            .await?;
        if !decision.allowed {
            let triggered =
                MetaLimitGuard::triggered(&resolved.meta, &resolved.limit_meta, &decision.breached);
            if !triggered.is_empty() {
                guard.record(&triggered, ctx, backend, &self.key_func).await?;
            }
        }
        Ok(Evaluation::Decided(decision))
    }

    /// Run a user callback, obeying the error policy.
    fn swallow<T>(
        &self,
        result: std::result::Result<T, CallbackError>,
        fallback: T,
        what: &str,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if self.config.swallow_errors => {
                error!(error = %e, "{} failed, ignoring", what);
                Ok(fallback)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn message(&self, limit: &RequestLimit, ctx: &RequestContext) -> Result<String> {
        let custom = self.swallow(limit.spec.message_for(ctx), None, "error message")?;
        Ok(custom.unwrap_or_else(|| limit.limit.to_string()))
    }

    fn meta_breach(&self, limit: RequestLimit, ctx: &RequestContext) -> LimiterError {
        info!(
            route = %ctx.route_id,
            key = %limit.key,
            limit = %limit.limit,
            "Request blocked by meta limit"
        );
        let callback = limit.spec.breach_callback().or(self.on_meta_breach.as_ref());
        let response = match callback {
            Some(callback) => match self.swallow(callback(&limit), None, "meta breach callback") {
                Ok(response) => response,
                Err(e) => return e,
            },
            None => None,
        };
        let message = match self.message(&limit, ctx) {
            Ok(message) => message,
            Err(e) => return e,
        };
        LimiterError::RateLimitExceeded(Box::new(Breach {
            limit,
            message,
            response,
            meta: true,
        }))
    }

    fn breach(&self, decision: EnforcementDecision, ctx: &RequestContext) -> LimiterError {
        match self.build_breach(decision, ctx) {
            Ok(breach) => LimiterError::RateLimitExceeded(Box::new(breach)),
            Err(e) => e,
        }
    }

    fn build_breach(&self, decision: EnforcementDecision, ctx: &RequestContext) -> Result<Breach> {
        let mut breached = decision.breached.into_iter();
        let Some(first) = breached.next() else {
            return Err(LimiterError::Configuration(
                "denied request without a breached limit".to_string(),
            ));
        };
        info!(
            route = %ctx.route_id,
            method = %ctx.method,
            key = %first.key,
            limit = %first.limit,
            category = %first.category,
            "Rate limit exceeded"
        );

        let mut response = None;
        for limit in std::iter::once(&first).chain(breached.as_slice()) {
            if let Some(callback) = limit.spec.breach_callback() {
                let body = self.swallow(callback(limit), None, "breach callback")?;
                response = response.or(body);
            }
        }
        if let Some(callback) = &self.on_breach {
            let body = self.swallow(callback(&first), None, "breach callback")?;
            response = response.or(body);
        }

        let message = self.message(&first, ctx)?;
        Ok(Breach {
            limit: first,
            message,
            response,
            meta: false,
        })
    }

    /// Apply deferred deductions and render the rate limit headers of the
    /// response.
    ///
    /// A failed deduction yields [`LimiterError::Deduction`], which still
    /// carries the headers.
    pub async fn finalize(
        &self,
        outcome: &RequestOutcome,
        response: &ResponseInfo,
    ) -> Result<Vec<(String, String)>> {
        let headers = match outcome.reported() {
            Some(reported) => self.headers(
                reported,
                response.header(&self.config.header_mapping.retry_after),
            ),
            None => Vec::new(),
        };
        if !outcome.decision.pending.is_empty() {
            let backend = self.failover.backend(outcome.fallback);
            if let Err(e) = self
                .enforcer
                .deduct(&outcome.decision.pending, response, backend.as_ref())
                .await
            {
                return Err(LimiterError::Deduction {
                    source: Box::new(e),
                    headers,
                });
            }
        }
        Ok(headers)
    }

    /// Rate limit headers describing `reported`, empty when headers are
    /// disabled. Also used for rejected requests.
    pub fn headers(
        &self,
        reported: &RequestLimit,
        existing_retry_after: Option<&str>,
    ) -> Vec<(String, String)> {
        if !self.config.headers_enabled {
            return Vec::new();
        }
        populate_headers(
            reported,
            &self.config.header_mapping,
            self.config.retry_after,
            self.now_secs(),
            existing_retry_after,
        )
    }

    /// Current state of every limit of a request, without consuming anything.
    pub async fn peek(&self, ctx: &RequestContext) -> Result<Vec<RequestLimit>> {
        let resolved = self.manager.resolve(ctx)?;
        let backend = self.failover.active().await.backend;
        let mut states = Vec::new();
        for limit in resolved.meta.iter().chain(&resolved.limit_meta).chain(&resolved.limits) {
            let Some((key, bucket)) = self.enforcer.key_for(limit, ctx, &self.key_func)? else {
                continue;
            };
            let stats = backend.window_stats(&key, &limit.item).await?;
            states.push(RequestLimit {
                limit: limit.item,
                key,
                remaining: stats.remaining,
                reset_at: stats.reset_at,
                breached: stats.remaining == 0,
                shared: bucket.shared,
                category: limit.category.clone(),
                spec: limit.spec.clone(),
            });
        }
        Ok(states)
    }

    /// Clear every bucket the request would touch. Returns the number of keys
    /// cleared.
    pub async fn clear(&self, ctx: &RequestContext) -> Result<usize> {
        let resolved = self.manager.resolve(ctx)?;
        let mut keys = Vec::new();
        for limit in resolved.meta.iter().chain(&resolved.limit_meta).chain(&resolved.limits) {
            if let Some((key, _)) = self.enforcer.key_for(limit, ctx, &self.key_func)? {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        let mut first_err = None;
        for backend in self.failover.all() {
            for key in &keys {
                if let Err(e) = backend.clear(key).await {
                    warn!(key = %key, error = %e, "Failed to clear rate limit");
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e.into());
        }
        info!(route = %ctx.route_id, keys = keys.len(), "Cleared rate limits");
        Ok(keys.len())
    }

    /// Remove every counter from every backend.
    pub async fn reset(&self) -> Result<()> {
        let mut first_err = None;
        for backend in self.failover.all() {
            if let Err(e) = backend.reset().await {
                warn!(strategy = %backend.strategy(), error = %e, "Failed to reset rate limits");
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            return Err(e.into());
        }
        info!("Reset all rate limits");
        Ok(())
    }
}
