//! Reconnection Backoff
//!
//! Exponential backoff with jitter between endpoint re-open attempts.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::ReconnectSettings;

/// Default jitter, as a fraction of the nominal delay.
pub const DEFAULT_JITTER: f64 = 0.1;

/// Backoff state for one endpoint.
///
/// The delay grows by `reconnect_delay_multiplier` after every attempt up to
/// `reconnect_delay_max`, and returns to `reconnect_delay_initial` after a
/// successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    settings: ReconnectSettings,
    jitter: f64,
    next: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy with the default jitter.
    #[must_use]
    pub const fn new(settings: ReconnectSettings) -> Self {
        Self::with_jitter(settings, DEFAULT_JITTER)
    }

    /// Create a policy with an explicit jitter fraction (0 disables jitter).
    #[must_use]
    pub const fn with_jitter(settings: ReconnectSettings, jitter: f64) -> Self {
        let next = settings.reconnect_delay_initial;
        Self {
            settings,
            jitter,
            next,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;

        let delay = self.jittered(self.next);
        self.next = self.grow(self.next);
        Some(delay)
    }

    /// Forget previous attempts after a successful connect.
    pub const fn reset(&mut self) {
        self.next = self.settings.reconnect_delay_initial;
        self.attempts = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Check if the attempt limit was reached. A limit of 0 never exhausts.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        let limit = self.settings.max_reconnect_attempts;
        limit > 0 && self.attempts >= limit
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn grow(&self, delay: Duration) -> Duration {
        let max = self.settings.reconnect_delay_max;
        let multiplier = self.settings.reconnect_delay_multiplier;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return delay.min(max);
        }

        let scaled = (delay.as_millis() as f64 * multiplier).round();
        if scaled >= max.as_millis() as f64 {
            return max;
        }
        Duration::from_millis(scaled as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }

        #[allow(clippy::cast_precision_loss)]
        let millis = delay.as_millis() as f64;
        let spread = millis * self.jitter;
        let offset: f64 = rand::rng().random_range(-spread..=spread);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted = (millis + offset).max(1.0) as u64;
        Duration::from_millis(adjusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(initial_ms: u64, max_ms: u64, multiplier: f64, attempts: u32) -> ReconnectSettings {
        ReconnectSettings {
            reconnect_delay_initial: Duration::from_millis(initial_ms),
            reconnect_delay_max: Duration::from_millis(max_ms),
            reconnect_delay_multiplier: multiplier,
            max_reconnect_attempts: attempts,
        }
    }

    #[test]
    fn delays_grow_until_capped() {
        let mut policy = ReconnectPolicy::with_jitter(settings(100, 500, 2.0, 0), 0.0);

        let delays: Vec<u128> = (0..5)
            .filter_map(|_| policy.next_delay())
            .map(|d| d.as_millis())
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn attempts_exhaust_at_limit() {
        let mut policy = ReconnectPolicy::with_jitter(settings(10, 100, 2.0, 2), 0.0);

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.is_exhausted());
        assert!(policy.next_delay().is_none());
        assert_eq!(policy.attempts(), 2);
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut policy = ReconnectPolicy::with_jitter(settings(50, 1_000, 3.0, 1), 0.0);
        let _ = policy.next_delay();
        assert!(policy.is_exhausted());

        policy.reset();

        assert!(!policy.is_exhausted());
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn non_positive_multiplier_keeps_delay() {
        let mut policy = ReconnectPolicy::with_jitter(settings(100, 1_000, 0.0, 0), 0.0);
        let _ = policy.next_delay();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(settings(1_000, 10_000, 2.0, 0));
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1_100).contains(&millis), "delay {millis}ms out of range");
        }
    }
}
