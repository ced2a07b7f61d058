//! Rate limiting logic: descriptors, counters, storage traits and the
//! fixed-window limiter.

mod backend;
mod clock;
mod counter;
mod descriptor;
mod limiter;
mod modifier;
mod response;
mod rules;

pub use backend::{ManuallyResettable, RateLimitStorage, StorageResult};
pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{LimitReached, StoredRateLimit};
pub use descriptor::{Fingerprint, RateLimit};
pub use limiter::{Decision, RateLimiter, Verdict};
pub use modifier::{
    apply_modifiers, HttpMethodModifier, RateLimitModifier, RequestAttributeModifier,
    RequestContext,
};
pub use response::{RateLimitHeaders, TooManyRequests, TOO_MANY_REQUESTS};
pub use rules::{GraphQLEndpoint, LimitOverride, RouteRules, GRAPHQL_VARY_KEY, ROUTE_VARY_KEY};
