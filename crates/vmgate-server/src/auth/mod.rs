//! Pre-upgrade gates: origin allow-list, bearer credentials and the
//! per-user reconnect limiter.

pub mod credential;
pub mod origin;
pub mod rate_limit;

pub use credential::{AuthRejection, ConsoleAuthenticator, TokenValidator};
pub use origin::{is_origin_allowed, OriginPolicy};
pub use rate_limit::RateLimiter;
