pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot};
pub use rate_limiter::RateLimiter;
