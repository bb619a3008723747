use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Upper bound on the failure streak; keeps `2^failures` from overflowing.
const MAX_STREAK: u32 = 16;

/// Spaces outbound API calls and widens the spacing while the upstream is
/// failing.
///
/// Spacing is `min_delay * 2^failures`, capped at `max_delay`. Every failure
/// extends the streak by one and every success shortens it by one, so a
/// recovering upstream is ramped back gradually instead of being hammered.
pub struct AdaptiveRateLimiter {
    min_delay: Duration,
    max_delay: Duration,
    state: Mutex<LimiterState>,
}

#[derive(Default)]
struct LimiterState {
    failures: u32,
    last_call: Option<Instant>,
}

impl AdaptiveRateLimiter {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn from_config(cfg: &crate::config::RateLimit) -> Self {
        Self::new(
            Duration::from_millis(cfg.min_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
        )
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(MAX_STREAK);
        self.min_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Reserve the next call slot, then wait for it.
    ///
    /// The slot is claimed under the lock and the sleep happens after the lock
    /// is released, so concurrent callers are spaced from each other while
    /// `record_success`/`record_failure` never wait behind a sleeper.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        let delay = self.delay_for(state.failures);
        let now = Instant::now();
        let slot = match state.last_call {
            Some(last) => (last + delay).max(now),
            None => now,
        };
        state.last_call = Some(slot);
        drop(state);

        if slot > now {
            tokio::time::sleep_until(slot).await;
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.failures = state.failures.saturating_sub(1);
        let delay = self.delay_for(state.failures);
        drop(state);
        metrics::gauge!("enricher_rate_limit_delay_ms").set(delay.as_secs_f64() * 1000.0);
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.failures = (state.failures + 1).min(MAX_STREAK);
        let delay = self.delay_for(state.failures);
        drop(state);
        metrics::gauge!("enricher_rate_limit_delay_ms").set(delay.as_secs_f64() * 1000.0);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "rate limiter backing off");
    }

    pub async fn current_delay(&self) -> Duration {
        let failures = self.state.lock().await.failures;
        self.delay_for(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(Duration::from_millis(100), Duration::from_millis(1000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_is_immediate_then_spaced() {
        let l = limiter();
        let start = Instant::now();
        l.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        l.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_grow_delay_up_to_cap() {
        let l = limiter();
        assert_eq!(l.current_delay().await, Duration::from_millis(100));

        l.record_failure().await;
        assert_eq!(l.current_delay().await, Duration::from_millis(200));
        l.record_failure().await;
        assert_eq!(l.current_delay().await, Duration::from_millis(400));

        for _ in 0..40 {
            l.record_failure().await;
        }
        assert_eq!(l.current_delay().await, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successes_shrink_delay_back_to_min() {
        let l = limiter();
        for _ in 0..3 {
            l.record_failure().await;
        }
        assert_eq!(l.current_delay().await, Duration::from_millis(800));

        l.record_success().await;
        assert_eq!(l.current_delay().await, Duration::from_millis(400));

        for _ in 0..10 {
            l.record_success().await;
        }
        assert_eq!(l.current_delay().await, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_spacing_is_enforced() {
        let l = limiter();
        l.acquire().await;
        l.record_failure().await;
        l.record_failure().await;

        let start = Instant::now();
        l.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_callers_do_not_block_outcome_reporting() {
        let l = std::sync::Arc::new(limiter());
        l.acquire().await;

        let waiters: Vec<_> = (0..20)
            .map(|_| {
                let l = std::sync::Arc::clone(&l);
                tokio::spawn(async move { l.acquire().await })
            })
            .collect();
        tokio::task::yield_now().await;

        let start = Instant::now();
        l.record_success().await;
        l.record_failure().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        for w in waiters {
            w.await.unwrap();
        }
        // 20 queued callers, each a full slot after the previous.
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_get_distinct_slots() {
        let l = std::sync::Arc::new(limiter());
        let start = Instant::now();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let l = std::sync::Arc::clone(&l);
                tokio::spawn(async move {
                    l.acquire().await;
                    Instant::now()
                })
            })
            .collect();
        let mut times = Vec::new();
        for h in handles {
            times.push(h.await.unwrap() - start);
        }
        times.sort();
        assert_eq!(times[0], Duration::ZERO);
        assert!(times[1] >= Duration::from_millis(100));
        assert!(times[2] >= Duration::from_millis(200));
    }
}
