//! Token budget accounting for the description queue.
//!
//! This is a fixed-window approximation of a token bucket. The usage counter
//! only grows inside a window and is reset unconditionally when the wall
//! clock crosses a window boundary, whatever is in flight at the time. A
//! burst right after a reset is therefore possible, and usage charged just
//! before a boundary is forgotten with it.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Extra tokens charged when a frame is attached to a request.
pub const IMAGE_TOKEN_ESTIMATE: u32 = 85;

/// Rough token count for English text (about four characters per token).
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    tokens_per_window: u32,
    cooldown_threshold: f64,
    window: Duration,
    tokens_used: u32,
    window_start: Instant,
    backoff: Duration,
    backoff_floor: Duration,
    backoff_ceiling: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, now: Instant) -> Self {
        let backoff_floor = Duration::from_millis(config.backoff_floor_ms);
        Self {
            tokens_per_window: config.tokens_per_minute,
            cooldown_threshold: config.cooldown_threshold,
            window: Duration::from_millis(config.window_ms),
            tokens_used: 0,
            window_start: now,
            backoff: backoff_floor,
            backoff_floor,
            backoff_ceiling: Duration::from_millis(config.backoff_ceiling_ms),
        }
    }

    /// Resets usage if `now` has crossed one or more window boundaries.
    /// Boundaries stay on the grid laid down at construction.
    pub fn roll_window(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return false;
        }

        let windows = (elapsed.as_millis() / self.window.as_millis().max(1)) as u32;
        self.window_start += self.window * windows;
        if self.tokens_used > 0 {
            debug!(tokens_used = self.tokens_used, "Rate window reset");
        }
        self.tokens_used = 0;
        true
    }

    pub fn record_usage(&mut self, tokens: u32) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
    }

    pub fn is_cooling_down(&self) -> bool {
        self.tokens_used as f64 > self.cooldown_threshold * self.tokens_per_window as f64
    }

    pub fn next_reset(&self) -> Instant {
        self.window_start + self.window
    }

    pub fn tokens_used(&self) -> u32 {
        self.tokens_used
    }

    pub fn budget(&self) -> u32 {
        self.tokens_per_window
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Returns the delay to wait now and doubles the next one, up to the ceiling.
    pub fn escalate_backoff(&mut self) -> Duration {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.backoff_ceiling);
        delay
    }

    /// Halves the backoff after a success, never below the floor.
    pub fn relax_backoff(&mut self) {
        self.backoff = (self.backoff / 2).max(self.backoff_floor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(now: Instant) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig::default(), now)
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn cooldown_starts_above_threshold() {
        let now = Instant::now();
        let mut limiter = limiter(now);
        limiter.record_usage(8_000);
        assert!(!limiter.is_cooling_down());
        limiter.record_usage(1);
        assert!(limiter.is_cooling_down());
    }

    #[test]
    fn window_resets_on_fixed_grid() {
        let start = Instant::now();
        let mut limiter = limiter(start);
        limiter.record_usage(9_000);

        assert!(!limiter.roll_window(start + Duration::from_secs(59)));
        assert_eq!(limiter.tokens_used(), 9_000);

        assert!(limiter.roll_window(start + Duration::from_secs(150)));
        assert_eq!(limiter.tokens_used(), 0);
        assert_eq!(limiter.next_reset(), start + Duration::from_secs(180));
    }

    #[test]
    fn backoff_doubles_caps_and_relaxes() {
        let mut limiter = limiter(Instant::now());
        assert_eq!(limiter.escalate_backoff(), Duration::from_secs(1));
        assert_eq!(limiter.escalate_backoff(), Duration::from_secs(2));
        assert_eq!(limiter.backoff(), Duration::from_secs(4));

        for _ in 0..10 {
            limiter.escalate_backoff();
        }
        assert_eq!(limiter.backoff(), Duration::from_secs(60));

        limiter.relax_backoff();
        assert_eq!(limiter.backoff(), Duration::from_secs(30));
        for _ in 0..10 {
            limiter.relax_backoff();
        }
        assert_eq!(limiter.backoff(), Duration::from_secs(1));
    }
}
