//! Resource budgets and rate limiting for block copy operations
//!
//! This crate provides the back-pressure primitives used by the block copy engine to bound
//! the amount of memory held by in-flight copy requests and, optionally, the copy bandwidth.
//!
//! # Overview
//!
//! Two kinds of limits are provided:
//!
//! 1. **Shared resource** ([`SharedResource`]) - a fixed budget (e.g. bytes of bounce buffer
//!    memory) that tasks reserve before doing work and return when done
//! 2. **Rate limit** ([`RateLimit`]) - a token bucket that is replenished at a fixed interval,
//!    limiting how many bytes per second may be submitted
//!
//! Both are built on tokio semaphores, so waiting tasks are parked rather than spinning, and
//! waiters are served in FIFO order.
//!
//! # Usage Patterns
//!
//! ## Shared Resource
//!
//! ```rust,no_run
//! use throttle::SharedResource;
//!
//! # async fn example() {
//! // at most 128 MiB of buffers in flight
//! let mem = SharedResource::new(128 << 20);
//!
//! let reservation = mem.acquire(1 << 20).await;
//! // use up to 1 MiB of memory here
//! reservation.release();
//! # }
//! ```
//!
//! ## Rate Limit
//!
//! ```rust,no_run
//! use throttle::RateLimit;
//!
//! # async fn example() {
//! // 100 MiB per second, replenished every 100ms
//! let limit = RateLimit::per_second(100 << 20);
//!
//! // wait until 1 MiB worth of tokens is available
//! limit.consume(1 << 20).await;
//! # }
//! ```
//!
//! # Token Calculation
//!
//! The rate limit tops the bucket up to `bytes_per_second * interval` tokens every interval.
//! A single request larger than one interval's budget is clamped to that budget, so a large
//! request is delayed by at most one interval instead of blocking forever.
//!
//! # Thread Safety
//!
//! All primitives are thread-safe and can be shared across tasks and worker threads.

mod bucket;
mod resource;

pub use resource::{Reservation, SharedResource};

/// Interval at which [`RateLimit`] replenishes its token bucket.
pub const REPLENISH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Byte-rate limiter replenished by a background tokio task.
///
/// The background task is aborted when the limiter is dropped.
#[derive(Debug)]
pub struct RateLimit {
    bucket: std::sync::Arc<bucket::TokenBucket>,
    replenisher: tokio::task::AbortHandle,
}

impl RateLimit {
    /// Creates a limiter that allows `bytes_per_second` bytes per second.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn per_second(bytes_per_second: u64) -> Self {
        let per_interval = bytes_per_second.saturating_mul(REPLENISH_INTERVAL.as_millis() as u64)
            / 1000;
        Self::new(per_interval, REPLENISH_INTERVAL)
    }

    /// Creates a limiter handing out `tokens_per_interval` tokens every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(tokens_per_interval: u64, interval: std::time::Duration) -> Self {
        let tokens_per_interval = u32::try_from(tokens_per_interval)
            .unwrap_or(u32::MAX)
            .max(1);
        let bucket = std::sync::Arc::new(bucket::TokenBucket::new(tokens_per_interval));
        let replenisher = {
            let bucket = std::sync::Arc::clone(&bucket);
            tokio::spawn(async move { bucket.run_refill(interval).await }).abort_handle()
        };
        tracing::debug!(
            "rate limit: {} tokens every {:?}",
            tokens_per_interval,
            interval
        );
        Self {
            bucket,
            replenisher,
        }
    }

    #[must_use]
    pub fn tokens_per_interval(&self) -> u64 {
        u64::from(self.bucket.size())
    }

    /// Waits until `tokens` tokens (clamped to one interval's worth) are available and consumes them.
    pub async fn consume(&self, tokens: u64) {
        let tokens = u32::try_from(tokens).unwrap_or(u32::MAX);
        self.bucket.take(tokens).await;
    }
}

impl Drop for RateLimit {
    fn drop(&mut self) {
        self.replenisher.abort();
    }
}
