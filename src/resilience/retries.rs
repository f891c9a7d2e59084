//! Conflict retry budget.
//!
//! # Design Decisions
//! - Capped at `max_attempts`; exhaustion is reported as a fatal conflict
//! - Every retry re-reads state; nothing from a failed attempt is reused
//! - Delays double per attempt up to a cap, plus up to half again as jitter

use std::time::Duration;

use rand::Rng;

/// Retry configuration for optimistic-concurrency loops.
#[derive(Debug, Clone, Copy)]
pub struct ConflictRetry {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            base_delay_ms: 20,
            max_delay_ms: 1_000,
        }
    }
}

impl ConflictRetry {
    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after failed attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let Some(doublings) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let step = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(doublings).unwrap_or(u64::MAX))
            .min(self.max_delay_ms);
        let jitter = match step / 2 {
            0 => 0,
            half => rand::thread_rng().gen_range(0..=half),
        };
        Duration::from_millis(step + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_bounded() {
        let retry = ConflictRetry {
            max_attempts: 3,
            ..ConflictRetry::default()
        };
        assert!(retry.allows(1));
        assert!(retry.allows(2));
        assert!(!retry.allows(3));
    }

    #[test]
    fn delay_doubles_up_to_cap() {
        let retry = ConflictRetry::default();
        assert_eq!(retry.delay(0), Duration::ZERO);

        let first = retry.delay(1).as_millis();
        assert!((20..=30).contains(&first), "{first}");
        let third = retry.delay(3).as_millis();
        assert!((80..=120).contains(&third), "{third}");

        let capped = retry.delay(40).as_millis();
        assert!((1_000..=1_500).contains(&capped), "{capped}");
    }
}
