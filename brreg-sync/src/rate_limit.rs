use crate::config::RateLimitConfig;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket shared by every caller of the registry API.
///
/// Callers that find the bucket empty sleep until a token is due instead of
/// failing, so bursts are queued rather than rejected.
pub struct RateLimiter {
    state: Mutex<BucketState>,
    rate_per_second: f64,
    capacity: f64
}

struct BucketState {
    tokens: f64,
    last_refill: Instant
}

impl RateLimiter {
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now()
            }),
            rate_per_second: f64::from(requests_per_second.max(1)),
            capacity
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_second, config.burst)
    }

    /// Waits until a request may be issued.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }

                Duration::from_secs_f64((1.0 - state.tokens) / self.rate_per_second)
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Takes a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens.floor() as u32
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.capacity);
        state.last_refill = now;
    }
}
