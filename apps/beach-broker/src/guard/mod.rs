//! Request guards applied in front of the session and image routes.

pub mod csrf;
pub mod rate_limit;

pub use csrf::{csrf_protect, CsrfGuard, CsrfToken, CSRF_COOKIE, CSRF_HEADER};
pub use rate_limit::{rate_limit, RateLimitConfig, RateLimiter};
