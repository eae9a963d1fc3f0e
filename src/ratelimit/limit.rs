//! Limit specifications and their per-request runtime form.

use std::fmt;
use std::sync::Arc;

use crate::error::{CallbackError, LimiterError, Result};

use super::context::{RequestContext, RequestLimit, ResponseInfo};
use super::rate::{parse_many, RateLimitItem};

/// Callback evaluated against the current request.
pub type Callback<T> =
    Arc<dyn Fn(&RequestContext) -> std::result::Result<T, CallbackError> + Send + Sync>;

/// Predicate evaluated against the response, used for deferred deductions.
pub type ResponsePredicate =
    Arc<dyn Fn(&ResponseInfo) -> std::result::Result<bool, CallbackError> + Send + Sync>;

/// Callback invoked when a limit is breached. A returned string replaces the
/// default response body.
pub type BreachCallback =
    Arc<dyn Fn(&RequestLimit) -> std::result::Result<Option<String>, CallbackError> + Send + Sync>;

/// A value that is either fixed at configuration time or computed per request.
pub enum Evaluatable<T> {
    Static(T),
    Dynamic(Callback<T>),
}

impl<T: Clone> Evaluatable<T> {
    /// Wrap an infallible function of the request.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> T + Send + Sync + 'static,
    {
        Evaluatable::Dynamic(Arc::new(move |ctx: &RequestContext| Ok(f(ctx))))
    }

    /// Wrap a function of the request that may fail.
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> std::result::Result<T, CallbackError> + Send + Sync + 'static,
    {
        Evaluatable::Dynamic(Arc::new(f))
    }

    pub fn evaluate(&self, ctx: &RequestContext) -> std::result::Result<T, CallbackError> {
        match self {
            Evaluatable::Static(value) => Ok(value.clone()),
            Evaluatable::Dynamic(f) => f(ctx),
        }
    }
}

impl<T: Clone> Clone for Evaluatable<T> {
    fn clone(&self) -> Self {
        match self {
            Evaluatable::Static(value) => Evaluatable::Static(value.clone()),
            Evaluatable::Dynamic(f) => Evaluatable::Dynamic(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Evaluatable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evaluatable::Static(value) => write!(f, "Static({:?})", value),
            Evaluatable::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

impl From<&str> for Evaluatable<String> {
    fn from(value: &str) -> Self {
        Evaluatable::Static(value.to_string())
    }
}

impl From<String> for Evaluatable<String> {
    fn from(value: String) -> Self {
        Evaluatable::Static(value)
    }
}

impl From<u32> for Evaluatable<u32> {
    fn from(value: u32) -> Self {
        Evaluatable::Static(value)
    }
}

impl From<bool> for Evaluatable<bool> {
    fn from(value: bool) -> Self {
        Evaluatable::Static(value)
    }
}

/// Function deriving the identity a limit is bucketed by.
pub type KeyFunc = Evaluatable<String>;

/// Key function bucketing by the remote address of the request.
pub fn remote_address() -> KeyFunc {
    Evaluatable::dynamic(|ctx: &RequestContext| {
        ctx.remote_addr.clone().unwrap_or_else(|| "127.0.0.1".to_string())
    })
}

/// Where the rate expressions of a limit come from.
#[derive(Clone)]
enum RateSource {
    Parsed(Vec<RateLimitItem>),
    Dynamic(Callback<String>),
    Invalid { expression: String, reason: String },
}

/// Which registration a limit belongs to. Also the evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "owner")]
pub enum LimitCategory {
    Meta,
    Application,
    Default,
    Namespace(String),
    Route(String),
}

impl fmt::Display for LimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitCategory::Meta => f.write_str("meta"),
            LimitCategory::Application => f.write_str("application"),
            LimitCategory::Default => f.write_str("default"),
            LimitCategory::Namespace(name) => write!(f, "namespace:{}", name),
            LimitCategory::Route(route) => write!(f, "route:{}", route),
        }
    }
}

/// Immutable description of one configured quota.
///
/// Built with [`LimitSpec::new`] (static expression, parsed eagerly) or
/// [`LimitSpec::dynamic`] (expression produced per request) and refined with
/// the consuming builder methods.
#[derive(Clone)]
pub struct LimitSpec {
    rates: RateSource,
    key_func: Option<KeyFunc>,
    scope: Option<Evaluatable<String>>,
    shared: bool,
    methods: Option<Vec<String>>,
    per_method: bool,
    cost: Evaluatable<u32>,
    exempt_when: Option<Evaluatable<bool>>,
    deduct_when: Option<ResponsePredicate>,
    override_defaults: bool,
    on_breach: Option<BreachCallback>,
    error_message: Option<Evaluatable<String>>,
    meta_limits: Vec<Arc<LimitSpec>>,
}

impl LimitSpec {
    /// Create a limit from a static expression like `"10/minute;100/day"`.
    ///
    /// Parse failures are kept and reported by [`LimitSpec::validate`], so that
    /// route level limits can be dropped with a log line instead of failing.
    pub fn new(expression: impl Into<String>) -> Self {
        let expression = expression.into();
        let rates = match parse_many(&expression) {
            Ok(items) if !items.is_empty() => RateSource::Parsed(items),
            Ok(_) => RateSource::Invalid {
                expression,
                reason: "no rate limit expressions".to_string(),
            },
            Err(e) => RateSource::Invalid {
                expression,
                reason: e.to_string(),
            },
        };
        Self::with_rates(rates)
    }

    /// Create a limit whose expression is computed for every request.
    pub fn dynamic<F>(provider: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        Self::with_rates(RateSource::Dynamic(Arc::new(
            move |ctx: &RequestContext| Ok(provider(ctx)),
        )))
    }

    fn with_rates(rates: RateSource) -> Self {
        Self {
            rates,
            key_func: None,
            scope: None,
            shared: false,
            methods: None,
            per_method: false,
            cost: Evaluatable::Static(1),
            exempt_when: None,
            deduct_when: None,
            override_defaults: true,
            on_breach: None,
            error_message: None,
            meta_limits: Vec::new(),
        }
    }

    pub fn key_func(mut self, key_func: impl Into<KeyFunc>) -> Self {
        self.key_func = Some(key_func.into());
        self
    }

    /// Additional scope combined with the route, giving the limit its own bucket.
    pub fn scope(mut self, scope: impl Into<Evaluatable<String>>) -> Self {
        self.scope = Some(scope.into());
        self.shared = false;
        self
    }

    /// Share one bucket between every route carrying this scope.
    pub fn shared(mut self, scope: impl Into<Evaluatable<String>>) -> Self {
        self.scope = Some(scope.into());
        self.shared = true;
        self
    }

    /// Restrict the limit to the given HTTP methods.
    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.methods = Some(
            methods
                .into_iter()
                .map(|m| m.as_ref().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// Count every HTTP method in its own bucket.
    pub fn per_method(mut self, per_method: bool) -> Self {
        self.per_method = per_method;
        self
    }

    pub fn cost(mut self, cost: impl Into<Evaluatable<u32>>) -> Self {
        self.cost = cost.into();
        self
    }

    pub fn exempt_when(mut self, predicate: impl Into<Evaluatable<bool>>) -> Self {
        self.exempt_when = Some(predicate.into());
        self
    }

    /// Only deduct from the quota when the predicate holds for the response.
    pub fn deduct_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResponseInfo) -> bool + Send + Sync + 'static,
    {
        self.deduct_when = Some(Arc::new(move |response: &ResponseInfo| Ok(predicate(response))));
        self
    }

    pub fn deduct_when_fallible(mut self, predicate: ResponsePredicate) -> Self {
        self.deduct_when = Some(predicate);
        self
    }

    pub fn override_defaults(mut self, override_defaults: bool) -> Self {
        self.override_defaults = override_defaults;
        self
    }

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

    pub fn error_message(mut self, message: impl Into<Evaluatable<String>>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Meta limit triggered every time this limit is breached.
    pub fn meta_limit(mut self, meta: LimitSpec) -> Self {
        self.meta_limits.push(Arc::new(meta));
        self
    }

    /// Check that a static expression parsed correctly.
    pub fn validate(&self) -> Result<()> {
        match &self.rates {
            RateSource::Invalid { expression, reason } => Err(LimiterError::MalformedLimit(
                format!("'{}': {}", expression, reason),
            )),
            _ => Ok(()),
        }
    }

    /// The rate items for this request. Static expressions are returned as
    /// parsed at construction time.
    pub fn rate_items(&self, ctx: &RequestContext) -> Result<Vec<RateLimitItem>> {
        match &self.rates {
            RateSource::Parsed(items) => Ok(items.clone()),
            RateSource::Dynamic(provider) => {
                let expression = provider(ctx)?;
                parse_many(&expression)
            }
            RateSource::Invalid { expression, reason } => Err(LimiterError::MalformedLimit(
                format!("'{}': {}", expression, reason),
            )),
        }
    }

    /// Statically known items, `None` for dynamic or invalid expressions.
    pub fn static_items(&self) -> Option<&[RateLimitItem]> {
        match &self.rates {
            RateSource::Parsed(items) => Some(items),
            _ => None,
        }
    }

    /// Human readable form of the expression for listings.
    pub fn describe(&self) -> String {
        match &self.rates {
            RateSource::Parsed(items) => items
                .iter()
                .map(|item| item.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            RateSource::Dynamic(_) => "<dynamic>".to_string(),
            RateSource::Invalid { expression, .. } => format!("<invalid: {}>", expression),
        }
    }

    pub fn key_function(&self) -> Option<&KeyFunc> {
        self.key_func.as_ref()
    }

    pub fn scope_value(&self) -> Option<&Evaluatable<String>> {
        self.scope.as_ref()
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn allowed_methods(&self) -> Option<&[String]> {
        self.methods.as_deref()
    }

    pub fn is_per_method(&self) -> bool {
        self.per_method
    }

    pub fn overrides_defaults(&self) -> bool {
        self.override_defaults
    }

    pub fn has_deferred_deduction(&self) -> bool {
        self.deduct_when.is_some()
    }

    pub fn meta_limits(&self) -> &[Arc<LimitSpec>] {
        &self.meta_limits
    }

    pub fn breach_callback(&self) -> Option<&BreachCallback> {
        self.on_breach.as_ref()
    }

    /// Whether the method of the request is outside of this limit's methods.
    pub fn method_exempt(&self, method: &str) -> bool {
        match &self.methods {
            Some(methods) => !methods.iter().any(|m| m.eq_ignore_ascii_case(method)),
            None => false,
        }
    }

    pub fn is_exempt(&self, ctx: &RequestContext) -> std::result::Result<bool, CallbackError> {
        match &self.exempt_when {
            Some(predicate) => predicate.evaluate(ctx),
            None => Ok(false),
        }
    }

    pub fn cost_for(&self, ctx: &RequestContext) -> std::result::Result<u32, CallbackError> {
        self.cost.evaluate(ctx)
    }

    pub fn should_deduct(
        &self,
        response: &ResponseInfo,
    ) -> std::result::Result<bool, CallbackError> {
        match &self.deduct_when {
            Some(predicate) => predicate(response),
            None => Ok(true),
        }
    }

    /// The custom error message for this request, if one is configured.
    pub fn message_for(
        &self,
        ctx: &RequestContext,
    ) -> std::result::Result<Option<String>, CallbackError> {
        self.error_message
            .as_ref()
            .map(|message| message.evaluate(ctx))
            .transpose()
    }
}

impl fmt::Debug for LimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitSpec")
            .field("rates", &self.describe())
            .field("scope", &self.scope)
            .field("shared", &self.shared)
            .field("methods", &self.methods)
            .field("per_method", &self.per_method)
            .field("cost", &self.cost)
            .field("override_defaults", &self.override_defaults)
            .field("deduct_when", &self.deduct_when.is_some())
            .field("meta_limits", &self.meta_limits.len())
            .finish()
    }
}

/// One rate item of a [`LimitSpec`], resolved for a specific request.
#[derive(Debug, Clone)]
pub struct RuntimeLimit {
    pub item: RateLimitItem,
    pub spec: Arc<LimitSpec>,
    pub category: LimitCategory,
    /// Position of `item` within the expression of `spec`.
    pub index: usize,
}

impl RuntimeLimit {
    /// Expand a specification into its runtime limits for this request.
    pub fn expand(
        spec: &Arc<LimitSpec>,
        category: LimitCategory,
        ctx: &RequestContext,
    ) -> Result<Vec<RuntimeLimit>> {
        Ok(spec
            .rate_items(ctx)?
            .into_iter()
            .enumerate()
            .map(|(index, item)| RuntimeLimit {
                item,
                spec: Arc::clone(spec),
                category: category.clone(),
                index,
            })
            .collect())
    }

    /// Whether both refer to the same item of the same specification.
    pub fn same_limit(&self, other: &RuntimeLimit) -> bool {
        Arc::ptr_eq(&self.spec, &other.spec) && self.index == other.index && self.item == other.item
    }
}

impl PartialEq for RuntimeLimit {
    fn eq(&self, other: &Self) -> bool {
        self.same_limit(other) && self.category == other.category
    }
}
