//! Exponential backoff policy shared by session reconnect and dispatch retry.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

/// Backoff parameters: `base * multiplier^(attempt-1)`, capped, with ±jitter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fractional jitter, e.g. `0.2` for ±20%.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Attempts beyond the first call (retry) or reconnect attempts (session).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_ms() -> u64 {
    1_000
}
fn default_cap_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.2
}
fn default_max_attempts() -> u32 {
    5
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}

impl BackoffPolicy {
    /// Session reconnect: 1s base, 30s cap, ±20%, five attempts.
    pub fn reconnect() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
        }
    }

    /// Dispatcher retry: one extra attempt after ~100ms.
    pub fn retry() -> Self {
        Self {
            base_ms: 100,
            cap_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 1,
        }
    }

    /// Delay before the given 1-based attempt, using clock-derived jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, jitter_unit())
    }

    /// Delay before the given 1-based attempt with an explicit jitter sample
    /// in `[-1.0, 1.0]`. Never exceeds the cap.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.cap_ms as f64);
        let jittered = capped * (1.0 + self.jitter * unit.clamp(-1.0, 1.0));
        let ms = jittered.clamp(0.0, self.cap_ms as f64);
        Duration::from_millis(ms.round() as u64)
    }
}

/// Pseudo-random sample in `[-1.0, 1.0]` from the low bits of the clock.
fn jitter_unit() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 2_001) as f64 / 1_000.0 - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_without_jitter() {
        let policy = BackoffPolicy::reconnect();
        assert_eq!(policy.delay_with_jitter(1, 0.0), Duration::from_secs(1));
        assert_eq!(policy.delay_with_jitter(2, 0.0), Duration::from_secs(2));
        assert_eq!(policy.delay_with_jitter(3, 0.0), Duration::from_secs(4));
    }

    #[test]
    fn test_cap_applies() {
        let policy = BackoffPolicy::reconnect();
        assert_eq!(policy.delay_with_jitter(10, 0.0), Duration::from_secs(30));
        assert_eq!(policy.delay_with_jitter(10, 1.0), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy::reconnect();
        assert_eq!(policy.delay_with_jitter(1, -1.0), Duration::from_millis(800));
        assert_eq!(policy.delay_with_jitter(1, 1.0), Duration::from_millis(1200));
        for _ in 0..50 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_millis(1600) && d <= Duration::from_millis(2400));
        }
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let policy: BackoffPolicy = serde_yaml::from_str("max_attempts: 2").unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_ms, 1_000);
        assert_eq!(policy.cap_ms, 30_000);
    }
}
