//! Token bucket throughput throttler.
//!
//! Callers charge the number of bytes they are about to push out and are
//! delayed until the bucket has refilled far enough. A throttler without a
//! rate limit admits everything immediately.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Byte-rate throttler shared between request handlers.
pub struct ThroughputThrottler {
    limit: Option<u64>,
    state: Mutex<BucketState>,
}

struct BucketState {
    /// May go negative: a single oversized charge is admitted and paid off
    /// by subsequent refills.
    available: i64,
    last_refill: Instant,
}

impl ThroughputThrottler {
    /// `limit` is in bytes per second; `None` means unlimited.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            state: Mutex::new(BucketState {
                available: limit.map(|l| l as i64).unwrap_or(0),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    fn refill(&self, state: &mut BucketState, limit: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let refill = (elapsed.as_secs_f64() * limit as f64) as i64;
        if refill > 0 {
            state.available = (state.available + refill).min(limit as i64);
            state.last_refill = now;
        }
    }

    /// Charge `amount` bytes and sleep until the charge has drained at
    /// the configured rate. An oversized charge is admitted as a single
    /// debt, delaying its caller (and everyone after) proportionally.
    pub async fn throttle(&self, amount: u64) {
        let Some(limit) = self.limit else { return };
        if limit == 0 || amount == 0 {
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            self.refill(&mut state, limit);
            state.available -= amount as i64;
            if state.available >= 0 {
                return;
            }
        }

        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state, limit);
                if state.available >= 0 {
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (-state.available) as f64 / limit as f64,
                    ))
                }
            };

            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Non-blocking variant used for statistics budgets: charge if the
    /// bucket is non-empty, otherwise report failure.
    pub fn try_acquire(&self, amount: u64) -> bool {
        let Some(limit) = self.limit else { return true };
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let refill = (elapsed.as_secs_f64() * limit as f64) as i64;
        if refill > 0 {
            state.available = (state.available + refill).min(limit as i64);
            state.last_refill = now;
        }
        if state.available > 0 {
            state.available -= amount as i64;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_throttler_delays() {
        let throttler = ThroughputThrottler::new(Some(1000));

        let start = tokio::time::Instant::now();
        // first charge drains the initial bucket
        throttler.throttle(1000).await;
        // second charge of one full second worth of bytes
        throttler.throttle(1000).await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_unlimited_throttler() {
        let throttler = ThroughputThrottler::unlimited();
        throttler.throttle(u64::MAX / 2).await;
        assert!(throttler.try_acquire(123));
    }
}
