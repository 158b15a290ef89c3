mod ema;
mod semaphore;

pub use ema::EmaRateLimiter;
pub use semaphore::{ConcurrencyLimiter, LimiterGuard};
