//! Storage key generation.

use std::fmt;

use crate::error::CallbackError;

use super::context::RequestContext;
use super::limit::{LimitCategory, RuntimeLimit};
use super::rate::RateLimitItem;

/// Scope used by application wide limits that do not declare their own.
pub const APPLICATION_SCOPE: &str = "global";

/// Scope used by meta limits that do not declare their own.
pub const META_SCOPE: &str = "meta";

/// The bucket a limit counts into, before the identity is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bucket {
    pub name: String,
    pub shared: bool,
}

impl Bucket {
    /// Derive the bucket of a limit for this request.
    ///
    /// Shared limits count into their scope alone, scoped limits into
    /// `{route}:{scope}` and everything else into the route. Per-method limits
    /// append the uppercase method.
    pub fn for_limit(limit: &RuntimeLimit, ctx: &RequestContext) -> Result<Self, CallbackError> {
        let spec = &limit.spec;
        let scope = match spec.scope_value() {
            Some(scope) => Some(scope.evaluate(ctx)?),
            None => match limit.category {
                LimitCategory::Application => Some(APPLICATION_SCOPE.to_string()),
                LimitCategory::Meta => Some(META_SCOPE.to_string()),
                _ => None,
            },
        };
        let implicitly_shared =
            matches!(limit.category, LimitCategory::Application | LimitCategory::Meta);
        let shared = spec.is_shared() || implicitly_shared;

        let mut name = match scope.filter(|s| !s.is_empty()) {
            Some(scope) if shared => scope,
            Some(scope) => format!("{}:{}", ctx.route_id, scope),
            None => ctx.route_id.clone(),
        };
        if spec.is_per_method() {
            name.push(':');
            name.push_str(&ctx.method.to_ascii_uppercase());
        }

        Ok(Self { name, shared })
    }
}

/// A fully qualified key under which a backend stores one counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    pub prefix: String,
    pub item: RateLimitItem,
    pub identity: String,
    pub bucket: String,
}

impl LimitKey {
    pub fn new(prefix: &str, item: RateLimitItem, identity: &str, bucket: &Bucket) -> Self {
        Self {
            prefix: prefix.to_string(),
            item,
            identity: identity.to_string(),
            bucket: bucket.name.clone(),
        }
    }

    /// Render as `{prefix}:{amount}/{multiple}/{granularity}:{identity}:{bucket}`.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.prefix,
            self.item.discriminator(),
            self.identity,
            self.bucket
        )
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
