//! Registration of limits and their resolution for a request.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{LimiterError, Result};
use crate::scope::{ExemptionScope, ScopeLookup, ScopeTreeResolver};

use super::context::RequestContext;
use super::limit::{Evaluatable, LimitCategory, LimitSpec, RuntimeLimit};

/// One concrete endpoint and the limits attached to it.
#[derive(Debug, Clone, Default)]
pub struct RouteRecord {
    pub route_id: String,
    /// Namespaces from the root down to the one owning the route.
    pub namespace_chain: Vec<String>,
    pub limits: Vec<Arc<LimitSpec>>,
    pub exemption: ExemptionScope,
}

/// The limits that apply to one request, in evaluation order.
#[derive(Debug, Clone, Default)]
pub struct ResolvedLimits {
    /// Meta limits to check before anything else.
    pub meta: Vec<RuntimeLimit>,
    /// Meta limits attached to individual limits of `limits`.
    pub limit_meta: Vec<RuntimeLimit>,
    /// Application, default, namespace and route limits.
    pub limits: Vec<RuntimeLimit>,
    pub meta_exempt: bool,
    /// Effective exemption of the route and its namespaces.
    pub exemption: ExemptionScope,
}

impl ResolvedLimits {
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.limit_meta.is_empty() && self.limits.is_empty()
    }
}

/// A registered limit, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredLimit {
    pub category: LimitCategory,
    pub limit: String,
    pub shared: bool,
    pub methods: Option<Vec<String>>,
    pub per_method: bool,
    pub override_defaults: bool,
    #[serde(skip)]
    pub spec: Arc<LimitSpec>,
}

impl RegisteredLimit {
    fn new(category: LimitCategory, spec: &Arc<LimitSpec>) -> Self {
        Self {
            category,
            limit: spec.describe(),
            shared: spec.is_shared(),
            methods: spec.allowed_methods().map(<[String]>::to_vec),
            per_method: spec.is_per_method(),
            override_defaults: spec.overrides_defaults(),
            spec: spec.clone(),
        }
    }
}

/// Holds every registered limit and resolves the applicable ones per request.
pub struct LimitManager {
    defaults: Vec<Arc<LimitSpec>>,
    application: Vec<Arc<LimitSpec>>,
    meta: Vec<Arc<LimitSpec>>,
    routes: RwLock<HashMap<String, RouteRecord>>,
    scopes: Arc<ScopeTreeResolver>,
    /// Static shared scopes and the limit expression registered for them.
    shared_scopes: RwLock<HashMap<String, String>>,
    swallow_errors: bool,
}

impl LimitManager {
    pub fn new(scopes: Arc<ScopeTreeResolver>, swallow_errors: bool) -> Self {
        Self {
            defaults: Vec::new(),
            application: Vec::new(),
            meta: Vec::new(),
            routes: RwLock::new(HashMap::new()),
            scopes,
            shared_scopes: RwLock::new(HashMap::new()),
            swallow_errors,
        }
    }

    pub fn scopes(&self) -> &Arc<ScopeTreeResolver> {
        &self.scopes
    }

    /// Validate limits that must be well formed at startup.
    fn validate_strict(&self, limits: Vec<LimitSpec>, kind: &str) -> Result<Vec<Arc<LimitSpec>>> {
        limits
            .into_iter()
            .map(|spec| {
                spec.validate().map_err(|e| {
                    LimiterError::Configuration(format!("invalid {} limit: {}", kind, e))
                })?;
                self.claim_shared_scope(&spec)?;
                Ok(Arc::new(spec))
            })
            .collect()
    }

    pub fn set_default_limits(&mut self, limits: Vec<LimitSpec>) -> Result<()> {
        self.defaults = self.validate_strict(limits, "default")?;
        Ok(())
    }

    pub fn set_application_limits(&mut self, limits: Vec<LimitSpec>) -> Result<()> {
        self.application = self.validate_strict(limits, "application")?;
        Ok(())
    }

    pub fn set_meta_limits(&mut self, limits: Vec<LimitSpec>) -> Result<()> {
        for spec in &limits {
            for meta in spec.meta_limits() {
                meta.validate().map_err(|e| {
                    LimiterError::Configuration(format!("invalid meta limit: {}", e))
                })?;
            }
        }
        self.meta = self.validate_strict(limits, "meta")?;
        Ok(())
    }

    /// Remember which expression a static shared scope was registered with.
    ///
    /// One shared scope can only ever carry one expression, otherwise routes
    /// would disagree about the size of the bucket they share.
    fn claim_shared_scope(&self, spec: &LimitSpec) -> Result<()> {
        if !spec.is_shared() {
            return Ok(());
        }
        let (Some(Evaluatable::Static(scope)), Some(_)) = (spec.scope_value(), spec.static_items())
        else {
            return Ok(());
        };
        let expression = spec.describe();
        let mut shared = self.shared_scopes.write();
        match shared.get(scope) {
            Some(existing) if *existing != expression => Err(LimiterError::Configuration(format!(
                "shared scope '{}' is registered with both '{}' and '{}'",
                scope, existing, expression
            ))),
            Some(_) => Ok(()),
            None => {
                shared.insert(scope.clone(), expression);
                Ok(())
            }
        }
    }

    /// Check a route or namespace limit. Malformed ones are logged and
    /// reported as `false` so that they are never attached.
    fn accept(&self, spec: &LimitSpec, owner: &LimitCategory) -> Result<bool> {
        let attached = spec.meta_limits().iter().map(|m| m.as_ref());
        for candidate in std::iter::once(spec).chain(attached) {
            if let Err(e) = candidate.validate() {
                error!(owner = %owner, error = %e, "Failed to load rate limit, limit ignored");
                return Ok(false);
            }
        }
        self.claim_shared_scope(spec)?;
        Ok(true)
    }

    pub fn register_namespace(&self, name: &str, parent: Option<&str>) -> Result<()> {
        self.scopes.register(name, parent)?;
        debug!(namespace = %name, parent = ?parent, "Registered namespace");
        Ok(())
    }

    pub fn add_namespace_limit(&self, namespace: &str, spec: LimitSpec) -> Result<()> {
        if !self.scopes.contains(namespace) {
            return Err(LimiterError::Configuration(format!(
                "unknown namespace '{}'",
                namespace
            )));
        }
        if self.accept(&spec, &LimitCategory::Namespace(namespace.to_string()))? {
            self.scopes.add_limit(namespace, Arc::new(spec))?;
        }
        Ok(())
    }

    pub fn exempt_namespace(&self, namespace: &str, flags: ExemptionScope) -> Result<()> {
        self.scopes.set_exemption(namespace, flags)
    }

    /// Register a route, or update the namespace chain of a known one.
    pub fn register_route<I, S>(&self, route_id: &str, namespace_chain: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chain: Vec<String> = namespace_chain.into_iter().map(Into::into).collect();
        let mut routes = self.routes.write();
        let record = routes
            .entry(route_id.to_string())
            .or_insert_with(|| RouteRecord {
                route_id: route_id.to_string(),
                ..Default::default()
            });
        record.namespace_chain = chain;
    }

    pub fn add_route_limit(&self, route_id: &str, spec: LimitSpec) -> Result<()> {
        if !self.accept(&spec, &LimitCategory::Route(route_id.to_string()))? {
            return Ok(());
        }
        let mut routes = self.routes.write();
        routes
            .entry(route_id.to_string())
            .or_insert_with(|| RouteRecord {
                route_id: route_id.to_string(),
                ..Default::default()
            })
            .limits
            .push(Arc::new(spec));
        Ok(())
    }

    pub fn exempt_route(&self, route_id: &str, flags: ExemptionScope) {
        let mut routes = self.routes.write();
        routes
            .entry(route_id.to_string())
            .or_insert_with(|| RouteRecord {
                route_id: route_id.to_string(),
                ..Default::default()
            })
            .exemption = flags;
    }

    pub fn route(&self, route_id: &str) -> Option<RouteRecord> {
        self.routes.read().get(route_id).cloned()
    }

    pub fn default_limits(&self) -> &[Arc<LimitSpec>] {
        &self.defaults
    }

    pub fn application_limits(&self) -> &[Arc<LimitSpec>] {
        &self.application
    }

    pub fn meta_limits(&self) -> &[Arc<LimitSpec>] {
        &self.meta
    }

    /// Exemption of a route including the one inherited from its namespaces.
    pub fn route_exemption(&self, route_id: &str) -> Option<ExemptionScope> {
        let route = self.route(route_id)?;
        let inherited = match self.scopes.lookup(&route.namespace_chain) {
            ScopeLookup::Namespace(scope) => scope.exemption,
            _ => ExemptionScope::NONE,
        };
        Some(route.exemption | inherited)
    }

    /// Every registered limit. Namespaces follow registration order and
    /// routes are sorted by id.
    pub fn registered_limits(&self) -> Vec<RegisteredLimit> {
        let mut listed: Vec<RegisteredLimit> = Vec::new();
        listed.extend(self.meta.iter().map(|s| RegisteredLimit::new(LimitCategory::Meta, s)));
        listed.extend(
            self.application
                .iter()
                .map(|s| RegisteredLimit::new(LimitCategory::Application, s)),
        );
        listed.extend(
            self.defaults
                .iter()
                .map(|s| RegisteredLimit::new(LimitCategory::Default, s)),
        );

        let snapshot = self.scopes.snapshot();
        for (_, node) in snapshot.tree().nodes() {
            listed.extend(node.limits.iter().map(|s| {
                RegisteredLimit::new(LimitCategory::Namespace(node.name.clone()), s)
            }));
        }

        let routes = self.routes.read();
        let sorted: BTreeMap<&String, &RouteRecord> = routes.iter().collect();
        for (route_id, record) in sorted {
            listed.extend(
                record
                    .limits
                    .iter()
                    .map(|s| RegisteredLimit::new(LimitCategory::Route(route_id.clone()), s)),
            );
        }
        listed
    }

    /// Evaluate a callback result under the error policy, using `fallback`
    /// when errors are swallowed.
    fn policy<T>(
        &self,
        result: std::result::Result<T, crate::error::CallbackError>,
        fallback: T,
        what: &str,
        ctx: &RequestContext,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if self.swallow_errors => {
                error!(route = %ctx.route_id, error = %e, "{} failed, ignoring", what);
                Ok(fallback)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Expand the specifications that survive method and `exempt_when`
    /// filtering into runtime limits.
    fn expand(
        &self,
        specs: Vec<(Arc<LimitSpec>, LimitCategory)>,
        ctx: &RequestContext,
    ) -> Result<Vec<RuntimeLimit>> {
        let mut expanded = Vec::new();
        for (spec, category) in specs {
            if spec.method_exempt(&ctx.method) {
                continue;
            }
            if self.policy(spec.is_exempt(ctx), false, "exempt_when", ctx)? {
                debug!(route = %ctx.route_id, category = %category, "Limit exempted for request");
                continue;
            }
            match RuntimeLimit::expand(&spec, category.clone(), ctx) {
                Ok(limits) => expanded.extend(limits),
                Err(LimiterError::MalformedLimit(reason)) => {
                    error!(
                        route = %ctx.route_id,
                        category = %category,
                        reason = %reason,
                        "Failed to load dynamic rate limit, limit ignored"
                    );
                }
                Err(LimiterError::Callback(e)) if self.swallow_errors => {
                    error!(
                        route = %ctx.route_id,
                        error = %e,
                        "Rate limit provider failed, ignoring"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(expanded)
    }

    /// Resolve the limits that apply to a request, in evaluation order.
    pub fn resolve(&self, ctx: &RequestContext) -> Result<ResolvedLimits> {
        let route = self.route(&ctx.route_id);
        let chain = match (&route, ctx.namespace_chain.is_empty()) {
            (Some(route), true) => route.namespace_chain.clone(),
            _ => ctx.namespace_chain.clone(),
        };

        let scope = match self.scopes.lookup(&chain) {
            ScopeLookup::Root => None,
            ScopeLookup::Namespace(scope) => Some(scope),
            ScopeLookup::Unknown(reason) => {
                warn!(
                    route = %ctx.route_id,
                    reason = %reason,
                    "Request references an unknown namespace, no limits applied"
                );
                return Ok(ResolvedLimits::default());
            }
        };

        let route_exemption = route.as_ref().map(|r| r.exemption).unwrap_or_default();
        let exemption = route_exemption.categories()
            | scope.as_ref().map(|s| s.exemption).unwrap_or_default();

        let route_limits: Vec<(Arc<LimitSpec>, LimitCategory)> = match &route {
            Some(route) if route_exemption.is_empty() => route
                .limits
                .iter()
                .map(|s| (s.clone(), LimitCategory::Route(route.route_id.clone())))
                .collect(),
            _ => Vec::new(),
        };

        let include_namespace =
            route_limits.is_empty() || route_limits.iter().all(|(s, _)| !s.overrides_defaults());
        let namespace_limits: Vec<(Arc<LimitSpec>, LimitCategory)> = match &scope {
            Some(scope) if include_namespace => scope
                .limits
                .iter()
                .map(|l| (l.spec.clone(), LimitCategory::Namespace(l.namespace.clone())))
                .collect(),
            _ => Vec::new(),
        };

        let namespace_overrides =
            include_namespace && scope.as_ref().is_some_and(|s| s.overrides_defaults);
        let explicit = || route_limits.iter().chain(namespace_limits.iter());
        let explicit_method_exempt = explicit().all(|(s, _)| s.method_exempt(&ctx.method));
        let combined_defaults =
            !namespace_overrides && route_limits.iter().all(|(s, _)| !s.overrides_defaults());
        let include_defaults = (explicit_method_exempt || combined_defaults)
            && !exemption.contains(ExemptionScope::DEFAULT);
        let include_application = !exemption.contains(ExemptionScope::APPLICATION);
        let meta_exempt = exemption.contains(ExemptionScope::META);

        let mut candidates: Vec<(Arc<LimitSpec>, LimitCategory)> = Vec::new();
        if include_application {
            candidates.extend(
                self.application
                    .iter()
                    .map(|s| (s.clone(), LimitCategory::Application)),
            );
        }
        if include_defaults {
            candidates.extend(self.defaults.iter().map(|s| (s.clone(), LimitCategory::Default)));
        }
        candidates.extend(namespace_limits);
        candidates.extend(route_limits);

        let limits = self.expand(candidates, ctx)?;

        let (meta, limit_meta) = if meta_exempt {
            (Vec::new(), Vec::new())
        } else {
            let global = self
                .meta
                .iter()
                .map(|s| (s.clone(), LimitCategory::Meta))
                .collect();
            let mut attached: Vec<(Arc<LimitSpec>, LimitCategory)> = Vec::new();
            for limit in &limits {
                for spec in limit.spec.meta_limits() {
                    if !attached.iter().any(|(m, _)| Arc::ptr_eq(m, spec)) {
                        attached.push((spec.clone(), LimitCategory::Meta));
                    }
                }
            }
            (self.expand(global, ctx)?, self.expand(attached, ctx)?)
        };

        debug!(
            route = %ctx.route_id,
            method = %ctx.method,
            limits = limits.len(),
            meta = meta.len() + limit_meta.len(),
            exemption = %exemption,
            "Resolved rate limits"
        );

        Ok(ResolvedLimits {
            meta,
            limit_meta,
            limits,
            meta_exempt,
            exemption,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;

    fn manager() -> LimitManager {
        let mut manager = LimitManager::new(Arc::new(ScopeTreeResolver::new()), false);
        manager
            .set_default_limits(vec![LimitSpec::new("200/day;50/hour")])
            .unwrap();
        manager
            .set_application_limits(vec![LimitSpec::new("1000/hour")])
            .unwrap();
        manager.set_meta_limits(vec![LimitSpec::new("2/hour")]).unwrap();
        manager
    }

    fn categories(resolved: &ResolvedLimits) -> Vec<String> {
        resolved
            .limits
            .iter()
            .map(|l| format!("{}={}", l.category, l.item))
            .collect()
    }

    #[test]
    fn test_invalid_defaults_fail_registration() {
        let mut manager = LimitManager::new(Arc::new(ScopeTreeResolver::new()), false);
        let result = manager.set_default_limits(vec![LimitSpec::new("lots per fortnight")]);
        assert!(matches!(result, Err(LimiterError::Configuration(_))));
        assert!(manager
            .set_meta_limits(vec![LimitSpec::new("")])
            .is_err());
    }

    #[test]
    fn test_route_without_limits_gets_defaults() {
        let manager = manager();
        let resolved = manager
            .resolve(&RequestContext::new("index", "GET"))
            .unwrap();
        assert_eq!(
            categories(&resolved),
            vec![
                "application=1000 per 1 hour",
                "default=200 per 1 day",
                "default=50 per 1 hour"
            ]
        );
        assert_eq!(resolved.meta.len(), 1);
        assert!(!resolved.meta_exempt);
    }

    #[test]
    fn test_route_limits_replace_defaults() {
        let manager = manager();
        manager.add_route_limit("slow", LimitSpec::new("1/day")).unwrap();
        let resolved = manager.resolve(&RequestContext::new("slow", "GET")).unwrap();
        assert_eq!(
            categories(&resolved),
            vec!["application=1000 per 1 hour", "route:slow=1 per 1 day"]
        );
    }

    #[test]
    fn test_non_overriding_route_limits_keep_defaults() {
        let manager = manager();
        manager
            .add_route_limit("fast", LimitSpec::new("10/second").override_defaults(false))
            .unwrap();
        let resolved = manager.resolve(&RequestContext::new("fast", "GET")).unwrap();
        assert_eq!(resolved.limits.len(), 4);
        assert_eq!(resolved.limits[3].category, LimitCategory::Route("fast".into()));
    }

    #[test]
    fn test_method_exempt_route_limits_fall_back_to_defaults() {
        let manager = manager();
        manager
            .add_route_limit("items", LimitSpec::new("1/second").methods(["POST"]))
            .unwrap();

        let get = manager.resolve(&RequestContext::new("items", "GET")).unwrap();
        assert_eq!(get.limits.len(), 3);
        assert!(get
            .limits
            .iter()
            .all(|l| l.category != LimitCategory::Route("items".into())));

        let post = manager.resolve(&RequestContext::new("items", "POST")).unwrap();
        assert_eq!(
            categories(&post),
            vec!["application=1000 per 1 hour", "route:items=1 per 1 second"]
        );
    }

    #[test]
    fn test_namespace_limits_and_order() {
        let manager = manager();
        manager.register_namespace("api", None).unwrap();
        manager
            .add_namespace_limit("api", LimitSpec::new("2/minute").override_defaults(false))
            .unwrap();
        manager
            .add_route_limit("api.users", LimitSpec::new("10/minute").override_defaults(false))
            .unwrap();

        let ctx = RequestContext::new("api.users", "GET").with_namespaces(["api"]);
        let resolved = manager.resolve(&ctx).unwrap();
        assert_eq!(
            categories(&resolved),
            vec![
                "application=1000 per 1 hour",
                "default=200 per 1 day",
                "default=50 per 1 hour",
                "namespace:api=2 per 1 minute",
                "route:api.users=10 per 1 minute",
            ]
        );
    }

    #[test]
    fn test_overriding_namespace_limits_replace_defaults() {
        let manager = manager();
        manager.register_namespace("api", None).unwrap();
        manager
            .add_namespace_limit("api", LimitSpec::new("2/minute"))
            .unwrap();

        let ctx = RequestContext::new("api.status", "GET").with_namespaces(["api"]);
        let resolved = manager.resolve(&ctx).unwrap();
        assert_eq!(
            categories(&resolved),
            vec!["application=1000 per 1 hour", "namespace:api=2 per 1 minute"]
        );
    }

    #[test]
    fn test_route_limits_hide_namespace_limits() {
        let manager = manager();
        manager.register_namespace("api", None).unwrap();
        manager
            .add_namespace_limit("api", LimitSpec::new("2/minute"))
            .unwrap();
        manager.add_route_limit("api.users", LimitSpec::new("10/minute")).unwrap();

        let ctx = RequestContext::new("api.users", "GET").with_namespaces(["api"]);
        let resolved = manager.resolve(&ctx).unwrap();
        assert_eq!(
            categories(&resolved),
            vec!["application=1000 per 1 hour", "route:api.users=10 per 1 minute"]
        );
    }

    #[test]
    fn test_exempt_route_drops_everything() {
        let manager = manager();
        manager.add_route_limit("health", LimitSpec::new("1/second")).unwrap();
        manager.exempt_route("health", ExemptionScope::exempt_default());

        let resolved = manager.resolve(&RequestContext::new("health", "GET")).unwrap();
        assert!(resolved.is_empty());
        assert!(resolved.meta_exempt);
        assert_eq!(
            manager.route_exemption("health"),
            Some(ExemptionScope::exempt_default())
        );
    }

    #[test]
    fn test_malformed_route_limit_falls_back_to_defaults() {
        let manager = manager();
        manager
            .add_route_limit("broken", LimitSpec::new("1 per fortnight"))
            .unwrap();
        let resolved = manager.resolve(&RequestContext::new("broken", "GET")).unwrap();
        assert_eq!(resolved.limits.len(), 3);
    }

    #[test]
    fn test_unknown_namespace_resolves_to_nothing() {
        let manager = manager();
        let ctx = RequestContext::new("x", "GET").with_namespaces(["ghost"]);
        let resolved = manager.resolve(&ctx).unwrap();
        assert!(resolved.is_empty());
        assert!(manager
            .add_namespace_limit("ghost", LimitSpec::new("1/second"))
            .is_err());
    }

    #[test]
    fn test_exempt_when_filters_per_request() {
        let manager = manager();
        manager
            .add_route_limit(
                "admin",
                LimitSpec::new("1/minute").exempt_when(Evaluatable::dynamic(
                    |ctx: &RequestContext| ctx.attribute("role") == Some("admin"),
                )),
            )
            .unwrap();

        let admin = RequestContext::new("admin", "GET").with_attribute("role", "admin");
        let guest = RequestContext::new("admin", "GET");
        assert_eq!(manager.resolve(&admin).unwrap().limits.len(), 1);
        assert_eq!(manager.resolve(&guest).unwrap().limits.len(), 2);
    }

    #[test]
    fn test_callback_errors_follow_policy() {
        let failing = || {
            LimitSpec::new("1/minute").exempt_when(Evaluatable::fallible(|_: &RequestContext| {
                Err(CallbackError::new("lookup failed"))
            }))
        };

        let strict = manager();
        strict.add_route_limit("r", failing()).unwrap();
        assert!(matches!(
            strict.resolve(&RequestContext::new("r", "GET")),
            Err(LimiterError::Callback(_))
        ));

        let lenient = LimitManager::new(Arc::new(ScopeTreeResolver::new()), true);
        lenient.add_route_limit("r", failing()).unwrap();
        let resolved = lenient.resolve(&RequestContext::new("r", "GET")).unwrap();
        assert_eq!(resolved.limits.len(), 1);
    }

    #[test]
    fn test_shared_scope_misuse_is_rejected() {
        let manager = manager();
        manager
            .add_route_limit("a", LimitSpec::new("1/second").shared("x"))
            .unwrap();
        manager
            .add_route_limit("b", LimitSpec::new("1/second").shared("x"))
            .unwrap();
        let result = manager.add_route_limit("c", LimitSpec::new("5/second").shared("x"));
        assert!(matches!(result, Err(LimiterError::Configuration(_))));
    }

    #[test]
    fn test_meta_limits_include_per_limit_meta() {
        let manager = manager();
        manager
            .add_route_limit(
                "login",
                LimitSpec::new("5/minute").meta_limit(LimitSpec::new("3/day")),
            )
            .unwrap();
        let resolved = manager.resolve(&RequestContext::new("login", "POST")).unwrap();
        let meta: Vec<String> = resolved
            .meta
            .iter()
            .chain(resolved.limit_meta.iter())
            .map(|l| l.item.to_string())
            .collect();
        assert_eq!(meta, vec!["2 per 1 hour", "3 per 1 day"]);
        assert_eq!(resolved.limit_meta.len(), 1);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let manager = manager();
        manager.register_namespace("api", None).unwrap();
        manager
            .add_namespace_limit("api", LimitSpec::new("5/minute;100/day").override_defaults(false))
            .unwrap();
        let ctx = RequestContext::new("api.items", "GET").with_namespaces(["api"]);

        let first = manager.resolve(&ctx).unwrap();
        let second = manager.resolve(&ctx).unwrap();
        assert_eq!(first.limits, second.limits);
        assert_eq!(first.meta, second.meta);
    }

    #[test]
    fn test_registered_limits_listing() {
        let manager = manager();
        manager.register_namespace("api", None).unwrap();
        manager.add_namespace_limit("api", LimitSpec::new("2/minute")).unwrap();
        manager.add_route_limit("b", LimitSpec::new("1/second")).unwrap();
        manager.add_route_limit("a", LimitSpec::new("2/second")).unwrap();

        let listed: Vec<String> = manager
            .registered_limits()
            .iter()
            .map(|l| format!("{} {}", l.category, l.limit))
            .collect();
        assert_eq!(
            listed,
            vec![
                "meta 2 per 1 hour",
                "application 1000 per 1 hour",
                "default 200 per 1 day, 50 per 1 hour",
                "namespace:api 2 per 1 minute",
                "route:a 2 per 1 second",
                "route:b 1 per 1 second",
            ]
        );
    }
}
