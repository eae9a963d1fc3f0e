//! Rate limiting logic and state management.

pub mod backend;
pub mod context;
pub mod enforcement;
pub mod failover;
pub mod headers;
pub mod key;
pub mod limit;
mod limiter;
pub mod manager;
pub mod memory;
pub mod meta;
pub mod rate;

pub use backend::{Consumption, CountingBackend, Strategy, WindowStats};
pub use context::{RequestContext, RequestLimit, ResponseInfo};
pub use enforcement::{EnforcementDecision, EnforcementPolicy, Enforcer, PendingDeduction};
pub use headers::{populate_headers, HeaderMapping, RetryAfterFormat};
pub use key::{Bucket, LimitKey, APPLICATION_SCOPE, META_SCOPE};
pub use limit::{remote_address, Evaluatable, KeyFunc, LimitCategory, LimitSpec, RuntimeLimit};
pub use limiter::{Breach, Limiter, LimiterBuilder, RequestFilter, RequestOutcome};
pub use manager::{LimitManager, RegisteredLimit, ResolvedLimits, RouteRecord};
pub use memory::{Clock, ManualClock, MemoryBackend, SystemClock};
pub use meta::MetaLimitGuard;
pub use rate::{Granularity, RateLimitItem};
