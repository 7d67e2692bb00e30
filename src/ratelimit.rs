// =============================================================================
// Token Bucket — shared rate-limit discipline for external APIs
// =============================================================================
//
// One bucket per external budget (TA aggregator, LLM). Producers either
// `try_acquire` and skip the cycle when the budget is exhausted, or
// `acquire` and suspend cooperatively until a token refills.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket. Capacity and refill rate are fixed at
/// construction; tokens refill continuously.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A bucket that allows `per_minute` acquisitions per rolling minute.
    pub fn per_minute(per_minute: f64) -> Self {
        Self::new(per_minute, per_minute / 60.0)
    }

    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            state.last_refill = Instant::now();
        }
    }

    /// Take one token if available. Returns `false` (without blocking) when
    /// the budget is exhausted.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until one token becomes available (0.0 when one is ready).
    fn wait_hint(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            0.0
        } else if self.refill_per_sec > 0.0 {
            (1.0 - state.tokens) / self.refill_per_sec
        } else {
            f64::INFINITY
        }
    }

    /// Take one token, suspending cooperatively until one refills. Logs a
    /// warning when a caller has to wait more than a second.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let wait = self.wait_hint().clamp(0.05, 5.0);
            if wait > 1.0 {
                warn!(wait_secs = wait, "rate-limit budget exhausted — waiting");
            }
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// Current token count (test/diagnostic use).
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }
}
