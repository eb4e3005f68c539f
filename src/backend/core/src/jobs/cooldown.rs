//! Cooldown policy for automatic retries.
//!
//! `next_cooldown(attempts) = min(base * 2^attempts, max)`, where `attempts` is
//! the queue entry's count after the attempt that just failed. A fresh entry has
//! `attempts == 0`, so the first failure waits exactly `base`.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential cooldown with a ceiling and optional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CooldownPolicy {
    base: Duration,
    max: Duration,
    jitter_factor: f64,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl CooldownPolicy {
    /// Create a policy without jitter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter_factor: 0.0,
        }
    }

    /// Add up to `factor * cooldown` of random delay. Clamped to `[0, 1]`.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_cooldown, config.max_cooldown).with_jitter(config.jitter_factor)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Deterministic cooldown for an attempt count.
    pub fn next_cooldown(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Cooldown with jitter applied, never above `max`.
    pub fn jittered_cooldown(&self, attempts: u32) -> Duration {
        let delay = self.next_cooldown(attempts);
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread_ms = (delay.as_millis() as f64 * self.jitter_factor) as u64;
        if spread_ms == 0 {
            return delay;
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=spread_ms));
        (delay + jitter).min(self.max)
    }

    /// Instant at which an entry with `attempts` becomes eligible again.
    pub fn cooldown_until(&self, attempts: u32, from: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.jittered_cooldown(attempts);
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| from.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CooldownPolicy {
        CooldownPolicy::new(Duration::from_secs(30), Duration::from_secs(600))
    }

    #[test]
    fn test_first_failure_waits_base() {
        assert_eq!(policy().next_cooldown(0), Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_growth_and_ceiling() {
        let p = policy();
        assert_eq!(p.next_cooldown(1), Duration::from_secs(60));
        assert_eq!(p.next_cooldown(2), Duration::from_secs(120));
        assert_eq!(p.next_cooldown(5), Duration::from_secs(600));
        assert_eq!(p.next_cooldown(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy().with_jitter(0.5);
        for attempts in 0..8 {
            let base = p.next_cooldown(attempts);
            let jittered = p.jittered_cooldown(attempts);
            assert!(jittered >= base);
            assert!(jittered <= p.max());
            assert!(jittered <= base + base / 2);
        }
    }

    #[test]
    fn test_cooldown_until_without_jitter() {
        let now = Utc::now();
        let until = policy().cooldown_until(0, now);
        assert_eq!(until - now, chrono::Duration::seconds(30));
    }

    #[test]
    fn test_max_never_below_base() {
        let p = CooldownPolicy::new(Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(p.max(), Duration::from_secs(60));
        assert_eq!(p.next_cooldown(3), Duration::from_secs(60));
    }
}
