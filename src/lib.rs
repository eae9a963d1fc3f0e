//! Scoped request-level rate limiting.
//!
//! Limits are attached to the whole application, to nested namespaces of
//! routes, or to single routes. For every request the [`Limiter`] resolves the
//! limits that apply, checks meta limits, counts the request against a
//! pluggable [`CountingBackend`] and reports the outcome for response headers.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod scope;

pub use config::LimiterConfig;
pub use error::{LimiterError, Result};
pub use ratelimit::{
    Breach, CountingBackend, LimitSpec, Limiter, RequestContext, RequestOutcome, ResponseInfo,
};
pub use scope::ExemptionScope;
