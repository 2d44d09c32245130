//! Jittered linear reconnect backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay before reconnect attempt `n` is
/// `min(max, base + n * step) + uniform(0, jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Backoff {
    pub base_ms: u64,
    pub step_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            step_ms: 1_500,
            max_ms: 30_000,
            jitter_ms: 750,
        }
    }
}

impl Backoff {
    /// Delay without jitter.
    pub fn floor(&self, attempt: u32) -> Duration {
        let linear = self
            .base_ms
            .saturating_add(self.step_ms.saturating_mul(u64::from(attempt)));
        Duration::from_millis(linear.min(self.max_ms))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        self.floor(attempt) + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_linearly_then_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.floor(0), Duration::from_millis(1_000));
        assert_eq!(backoff.floor(1), Duration::from_millis(2_500));
        assert_eq!(backoff.floor(4), Duration::from_millis(7_000));
        assert_eq!(backoff.floor(19), Duration::from_millis(29_500));
        assert_eq!(backoff.floor(20), Duration::from_millis(30_000));
        assert_eq!(backoff.floor(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let backoff = Backoff::default();
        for attempt in [0, 3, 50] {
            let floor = backoff.floor(attempt);
            for _ in 0..200 {
                let delay = backoff.delay(attempt);
                assert!(delay >= floor);
                assert!(delay <= floor + Duration::from_millis(backoff.jitter_ms));
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let backoff = Backoff {
            jitter_ms: 0,
            ..Backoff::default()
        };
        assert_eq!(backoff.delay(2), backoff.floor(2));
    }
}
