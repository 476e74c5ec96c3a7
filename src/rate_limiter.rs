use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Token bucket bounding how often a full reconciliation pass may run, no matter
/// how many triggering events arrive. `accept` only ever delays, it never rejects.
pub struct RateLimiter {
    /// Refill rate in tokens per second. Must be positive.
    qps: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        assert!(qps > 0.0, "rate limiter qps must be positive");
        Self {
            qps,
            burst: f64::from(burst),
            state: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available, then consumes it.
    pub async fn accept(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().expect("rate limiter mutex poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.qps)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_accepted_immediately() {
        let limiter = RateLimiter::new(0.05, 4);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.accept().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_delays_once_burst_is_spent() {
        let limiter = RateLimiter::new(2.0, 1);
        limiter.accept().await;

        let start = Instant::now();
        limiter.accept().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_over_time() {
        let limiter = RateLimiter::new(1.0, 1);
        limiter.accept().await;

        tokio::time::advance(Duration::from_secs(2)).await;
        let start = Instant::now();
        limiter.accept().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_do_not_accumulate_beyond_burst() {
        let limiter = RateLimiter::new(1.0, 2);
        tokio::time::advance(Duration::from_secs(60)).await;

        let start = Instant::now();
        limiter.accept().await;
        limiter.accept().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        let start = Instant::now();
        limiter.accept().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
