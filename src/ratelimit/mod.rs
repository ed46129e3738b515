//! Rate limiting logic and state management.

mod clock;
mod history;
mod key;
mod limiter;
mod policy;
mod scopes;

pub use clock::{Clock, ManualClock, SystemClock};
pub use history::HistoryRecord;
pub use key::ThrottleKey;
pub use limiter::{Decision, RateLimiter, DEFAULT_MAX_RETRIES};
pub use policy::{RatePolicy, TimeWindow};
pub use scopes::{combine, ScopeRates, ThrottleSet};
