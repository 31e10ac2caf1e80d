//! Per-key QPS limiting.
//!
//! Two [`RateLimiter`](magsag_protocol::RateLimiter) implementations:
//! - [`InMemoryRateLimiter`]: token buckets in process memory. Not shared
//!   across processes.
//! - [`DistributedRateLimiter`]: delegates every check-and-record to a
//!   [`WindowStore`] that performs it as one atomic operation, so concurrent
//!   callers in different processes can never both take the last slot.
//!   Store outages fail open and are reported; other store errors propagate.

mod clock;
mod distributed;
mod local;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::{Admission, DistributedRateLimiter, StoreError, WindowStore};
pub use local::LocalWindowStore;
pub use memory::InMemoryRateLimiter;
#[cfg(feature = "redis")]
pub use redis_store::RedisWindowStore;

use magsag_protocol::{GateError, GateResult};

/// Rolling window the QPS budget applies to.
pub const WINDOW_MS: u64 = 1_000;

pub(crate) fn validate(key: &str, qps_limit: u32) -> GateResult<()> {
    if key.is_empty() || key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(GateError::InvalidRateLimitKey(key.to_owned()));
    }
    if qps_limit == 0 {
        return Err(GateError::InvalidRateLimit(format!(
            "qps_limit must be positive for key {key}"
        )));
    }
    Ok(())
}
