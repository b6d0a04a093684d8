//! Adaptive request pacing shared by every worker.
//!
//! A token bucket whose rate follows observed server behavior: sustained
//! success nudges the rate up one step at a time toward `max_rps`; a 429, or
//! a burst of 5xx inside the sliding window, halves it and applies a
//! cool-off sleep. The rate never drops below `min_rps`, so a run always
//! keeps crawling forward.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{ExtractError, ExtractResult};

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub initial_rps: f64,
    pub max_rps: f64,
    pub min_rps: f64,
    /// Consecutive successes before one additive step up.
    pub increase_after: u32,
    pub increase_step: f64,
    /// Sleep applied after each multiplicative decrease.
    pub cooloff: Duration,
    /// 5xx responses inside this window before the rate halves.
    pub error_window: Duration,
    pub error_threshold: usize,
}

impl RateLimitConfig {
    pub fn new(initial_rps: u32, max_rps: u32, min_rps: u32) -> Self {
        RateLimitConfig {
            initial_rps: initial_rps as f64,
            max_rps: max_rps as f64,
            min_rps: (min_rps.max(1)) as f64,
            increase_after: 32,
            increase_step: 1.0,
            cooloff: Duration::from_secs(15),
            error_window: Duration::from_secs(10),
            error_threshold: 3,
        }
    }
}

struct BucketState {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
    cooloff_until: Option<Instant>,
    recent_errors: VecDeque<Instant>,
}

pub struct AdaptiveLimiter {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
    successes: AtomicU32,
}

impl AdaptiveLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let rate = config.initial_rps.clamp(config.min_rps, config.max_rps);
        AdaptiveLimiter {
            config,
            state: Mutex::new(BucketState {
                rate,
                tokens: 1.0,
                last_refill: Instant::now(),
                cooloff_until: None,
                recent_errors: VecDeque::new(),
            }),
            successes: AtomicU32::new(0),
        }
    }

    /// Take one token, sleeping as long as pacing requires. Returns
    /// `Cancelled` instead of a token once the run is shutting down.
    pub async fn acquire(&self, cancel: &CancellationToken) -> ExtractResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }
            let wait;
            {
                let mut s = self.state.lock().await;
                let now = Instant::now();
                if let Some(until) = s.cooloff_until {
                    if now >= until {
                        s.cooloff_until = None;
                        s.last_refill = now;
                    }
                }
                match s.cooloff_until {
                    Some(until) => {
                        wait = until.saturating_duration_since(now);
                    }
                    None => {
                        let elapsed = now.saturating_duration_since(s.last_refill).as_secs_f64();
                        // Burst capacity is one second of the current rate.
                        s.tokens = (s.tokens + elapsed * s.rate).min(s.rate.max(1.0));
                        s.last_refill = now;
                        if s.tokens >= 1.0 {
                            s.tokens -= 1.0;
                            return Ok(());
                        }
                        wait = Duration::from_secs_f64(((1.0 - s.tokens) / s.rate).max(0.001));
                    }
                }
            }
            tokio::select! {
                _ = sleep(wait) => {}
                _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
            }
        }
    }

    /// Additive increase: one step up per `increase_after` consecutive
    /// successes, capped at `max_rps`.
    pub async fn on_success(&self) {
        let n = self.successes.fetch_add(1, Ordering::Relaxed) + 1;
        if n < self.config.increase_after {
            return;
        }
        self.successes.store(0, Ordering::Relaxed);
        let mut s = self.state.lock().await;
        let new_rate = (s.rate + self.config.increase_step).min(self.config.max_rps);
        if new_rate > s.rate {
            debug!("rate limiter: sustained success, {:.1} -> {:.1} rps", s.rate, new_rate);
            s.rate = new_rate;
        }
    }

    /// Multiplicative decrease on explicit throttling.
    pub async fn on_throttle(&self) {
        self.successes.store(0, Ordering::Relaxed);
        let mut s = self.state.lock().await;
        self.decrease_locked(&mut s, "throttled (429)");
    }

    /// 5xx responses only halve the rate once they cluster: `error_threshold`
    /// of them inside `error_window`.
    pub async fn on_server_error(&self) {
        self.successes.store(0, Ordering::Relaxed);
        let mut s = self.state.lock().await;
        let now = Instant::now();
        s.recent_errors.push_back(now);
        while let Some(front) = s.recent_errors.front() {
            if now.saturating_duration_since(*front) > self.config.error_window {
                s.recent_errors.pop_front();
            } else {
                break;
            }
        }
        if s.recent_errors.len() >= self.config.error_threshold {
            self.decrease_locked(&mut s, "server error burst");
        }
    }

    fn decrease_locked(&self, s: &mut BucketState, why: &str) {
        let new_rate = (s.rate / 2.0).max(self.config.min_rps);
        warn!(
            "rate limiter: {}, {:.1} -> {:.1} rps, cooling off for {:?}",
            why, s.rate, new_rate, self.config.cooloff
        );
        s.rate = new_rate;
        s.tokens = 0.0;
        s.recent_errors.clear();
        s.cooloff_until = Some(Instant::now() + self.config.cooloff);
    }

    #[cfg(test)]
    pub async fn current_rate(&self) -> f64 {
        self.state.lock().await.rate
    }

    #[cfg(test)]
    pub async fn cooling_off(&self) -> bool {
        let s = self.state.lock().await;
        matches!(s.cooloff_until, Some(until) if Instant::now() < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            increase_after: 4,
            cooloff: Duration::from_secs(2),
            ..RateLimitConfig::new(4, 10, 1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_token_is_immediate_then_pacing_kicks_in() {
        let limiter = AdaptiveLimiter::new(config());
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Bucket is empty now; the next token takes ~1/rate seconds.
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(240));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_halves_rate_with_a_floor() {
        let limiter = AdaptiveLimiter::new(config());
        limiter.on_throttle().await;
        assert_eq!(limiter.current_rate().await, 2.0);
        for _ in 0..10 {
            limiter.on_throttle().await;
        }
        assert_eq!(limiter.current_rate().await, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_success_increases_rate_up_to_the_cap() {
        let limiter = AdaptiveLimiter::new(config());
        for _ in 0..4 {
            limiter.on_success().await;
        }
        assert_eq!(limiter.current_rate().await, 5.0);
        for _ in 0..100 {
            limiter.on_success().await;
        }
        assert_eq!(limiter.current_rate().await, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cooloff_delays_the_next_acquire() {
        let limiter = AdaptiveLimiter::new(config());
        let cancel = CancellationToken::new();
        limiter.on_throttle().await;
        assert!(limiter.cooling_off().await);

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(!limiter.cooling_off().await);
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_server_errors_do_not_move_the_rate() {
        let limiter = AdaptiveLimiter::new(config());
        limiter.on_server_error().await;
        limiter.on_server_error().await;
        assert_eq!(limiter.current_rate().await, 4.0);
        // Third error within the window crosses the threshold.
        limiter.on_server_error().await;
        assert_eq!(limiter.current_rate().await, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_waiting_acquire() {
        let limiter = AdaptiveLimiter::new(config());
        let cancel = CancellationToken::new();
        limiter.on_throttle().await;
        cancel.cancel();
        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
