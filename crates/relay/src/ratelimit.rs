// Token-bucket rate limiting for mutating playground operations.
//
// One `RateLimiter` instance exists per operation kind (the save path owns
// the `save_file` instance); buckets are keyed by user id, so a user
// exhausting one operation kind never starves another. Buckets live for the
// coordinator process lifetime and are not persisted.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::RwLock;

/// Capacity and refill rate of the buckets managed by one limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum tokens a bucket can hold.
    pub capacity: f64,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { capacity: 5.0, refill_per_sec: 1.0 }
    }
}

/// The bucket had fewer tokens than the operation cost; nothing was debited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded")]
pub struct RateLimitExceeded;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter for a single operation kind, keyed by user id.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, buckets: RwLock::new(HashMap::new()) }
    }

    /// Debits `cost` tokens from the user's bucket, refilling from elapsed
    /// time first. Fails with [`RateLimitExceeded`] and leaves the bucket
    /// unchanged when not enough tokens are available.
    ///
    /// The refill-check-debit sequence runs under the bucket map's write
    /// lock with no internal await, so it is atomic with respect to every
    /// other consume call.
    pub async fn consume(&self, user_id: &str, cost: f64) -> Result<(), RateLimitExceeded> {
        self.consume_at(user_id, cost, Instant::now()).await
    }

    async fn consume_at(
        &self,
        user_id: &str,
        cost: f64,
        now: Instant,
    ) -> Result<(), RateLimitExceeded> {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(user_id.to_owned()).or_insert_with(|| Bucket {
            tokens: self.config.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.config.refill_per_sec)
            .min(self.config.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Ok(())
        } else {
            Err(RateLimitExceeded)
        }
    }

    /// Tokens currently available to a user, without debiting.
    #[cfg(test)]
    async fn available(&self, user_id: &str) -> Option<f64> {
        self.buckets.read().await.get(user_id).map(|bucket| bucket.tokens)
    }
}
