//! Per-(proxy, domain) health tallies
//!
//! Health is tracked per proxy *and* target domain: a proxy can be clean for
//! one site and burned for another.

use std::time::{Duration, Instant};

/// Consecutive failures before a pair enters cooldown
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Cooldown length once a pair is burned
pub const COOLDOWN: Duration = Duration::from_secs(6 * 60 * 60);

/// Running tally for one (proxy, domain) pair
#[derive(Debug, Clone)]
pub struct PairHealth {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub cooldown_until: Option<Instant>,
}

impl Default for PairHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            cooldown_until: None,
        }
    }
}

impl PairHealth {
    /// Record a failure; entering cooldown after the failure ceiling
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.total_failures += 1;
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            self.cooldown_until = Some(Instant::now() + COOLDOWN);
        }
    }

    /// Whether the pair is currently cooling down
    pub fn is_cooling(&self, now: Instant) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }

    /// Clear an expired cooldown so the proxy gets a fresh chance
    pub fn reset_if_expired(&mut self, now: Instant) {
        if let Some(until) = self.cooldown_until {
            if now >= until {
                self.consecutive_failures = 0;
                self.cooldown_until = None;
            }
        }
    }
}

/// Selection weight for a pair: strictly decreasing in consecutive failures,
/// so a proxy with more recent failures is never preferred over an otherwise
/// identical one with fewer.
pub fn selection_weight(consecutive_failures: u32) -> f64 {
    1.0 / (1.0 + consecutive_failures as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_is_monotonically_decreasing_in_failures() {
        let mut previous = f64::INFINITY;
        for failures in 0..20 {
            let weight = selection_weight(failures);
            assert!(weight < previous, "weight must strictly decrease");
            assert!(weight > 0.0 && weight <= 1.0);
            previous = weight;
        }
    }

    #[test]
    fn cooldown_starts_at_failure_ceiling() {
        let mut health = PairHealth::default();
        health.record_failure();
        health.record_failure();
        assert!(!health.is_cooling(Instant::now()));
        health.record_failure();
        assert!(health.is_cooling(Instant::now()));
    }

    #[test]
    fn expired_cooldown_resets_failures() {
        let mut health = PairHealth::default();
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            health.record_failure();
        }
        // Simulate the cooldown having elapsed
        health.cooldown_until = Some(Instant::now() - Duration::from_secs(1));
        let now = Instant::now();
        assert!(!health.is_cooling(now));
        health.reset_if_expired(now);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.cooldown_until.is_none());
    }
}
