//! Interval policy: next polling delay from recent sync outcomes.
//!
//! Error backoff strictly dominates idle backoff. Both grow exponentially
//! from `base_interval` and are capped at `max_interval`; the first error
//! (or the first empty sync at the threshold) already applies one
//! multiplication.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use driftsync_common::{Error, Result};

use crate::config::duration_ms;

/// Backoff configuration, immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Interval used when no backoff applies.
    #[serde(with = "duration_ms")]
    pub base_interval: Duration,
    /// Upper bound for any computed interval.
    #[serde(with = "duration_ms")]
    pub max_interval: Duration,
    /// Consecutive empty syncs before idle backoff starts.
    pub empty_threshold: u32,
    /// Growth factor per empty sync past the threshold.
    pub idle_backoff_multiplier: f64,
    /// Growth factor per consecutive error.
    pub error_backoff_multiplier: f64,
}

impl BackoffConfig {
    /// Create a configuration with the given base and max intervals.
    pub fn new(base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            base_interval,
            max_interval,
            ..Self::default()
        }
    }

    /// Set the empty-sync threshold.
    pub fn with_empty_threshold(mut self, threshold: u32) -> Self {
        self.empty_threshold = threshold;
        self
    }

    /// Set the idle backoff multiplier.
    pub fn with_idle_multiplier(mut self, multiplier: f64) -> Self {
        self.idle_backoff_multiplier = multiplier;
        self
    }

    /// Set the error backoff multiplier.
    pub fn with_error_multiplier(mut self, multiplier: f64) -> Self {
        self.error_backoff_multiplier = multiplier;
        self
    }

    /// Check the configuration invariants.
    ///
    /// # Errors
    /// - `base_interval` is zero or greater than `max_interval`
    /// - A multiplier is below 1 or not finite
    pub fn validate(&self) -> Result<()> {
        if self.base_interval.is_zero() {
            return Err(Error::InvalidInput(
                "base_interval must be greater than zero".to_string(),
            ));
        }
        if self.base_interval > self.max_interval {
            return Err(Error::InvalidInput(format!(
                "base_interval ({:?}) exceeds max_interval ({:?})",
                self.base_interval, self.max_interval
            )));
        }
        for (name, value) in [
            ("idle_backoff_multiplier", self.idle_backoff_multiplier),
            ("error_backoff_multiplier", self.error_backoff_multiplier),
        ] {
            if !value.is_finite() || value < 1.0 {
                return Err(Error::InvalidInput(format!(
                    "{} must be a finite value >= 1, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(5_000),
            max_interval: Duration::from_millis(300_000),
            empty_threshold: 5,
            idle_backoff_multiplier: 1.5,
            error_backoff_multiplier: 2.0,
        }
    }
}

/// Adaptive counters feeding the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    pub consecutive_empty_syncs: u32,
    pub consecutive_sync_errors: u32,
}

impl SyncCounters {
    /// Fold a successful attempt into the counters.
    pub fn record_success(&mut self, changes: u64) {
        self.consecutive_sync_errors = 0;
        if changes > 0 {
            self.consecutive_empty_syncs = 0;
        } else {
            self.consecutive_empty_syncs = self.consecutive_empty_syncs.saturating_add(1);
        }
    }

    /// Fold a failed attempt into the counters.
    pub fn record_error(&mut self) {
        self.consecutive_empty_syncs = 0;
        self.consecutive_sync_errors = self.consecutive_sync_errors.saturating_add(1);
    }
}

/// Compute the next polling interval.
pub fn next_interval(counters: &SyncCounters, config: &BackoffConfig) -> Duration {
    if counters.consecutive_sync_errors > 0 {
        return scaled(
            config,
            config.error_backoff_multiplier,
            counters.consecutive_sync_errors,
        );
    }

    if counters.consecutive_empty_syncs >= config.empty_threshold {
        let exponent = counters.consecutive_empty_syncs - config.empty_threshold + 1;
        return scaled(config, config.idle_backoff_multiplier, exponent);
    }

    config.base_interval
}

/// `min(base * multiplier^exponent, max)`, computed in milliseconds.
fn scaled(config: &BackoffConfig, multiplier: f64, exponent: u32) -> Duration {
    let base_ms = config.base_interval.as_millis() as f64;
    let max_ms = config.max_interval.as_millis() as f64;
    let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);

    // powi overflows to infinity, which the min below absorbs.
    let candidate = base_ms * multiplier.powi(exponent);
    Duration::from_millis(candidate.min(max_ms).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn counters(empty: u32, errors: u32) -> SyncCounters {
        SyncCounters {
            consecutive_empty_syncs: empty,
            consecutive_sync_errors: errors,
        }
    }

    #[test]
    fn test_default_interval() {
        let config = BackoffConfig::default();
        assert_eq!(next_interval(&counters(0, 0), &config), config.base_interval);
        assert_eq!(next_interval(&counters(4, 0), &config), config.base_interval);
    }

    #[test]
    fn test_idle_backoff_after_seven_empty_syncs() {
        let config = BackoffConfig::new(Duration::from_millis(5_000), Duration::from_millis(300_000))
            .with_empty_threshold(5)
            .with_idle_multiplier(1.5);

        // 5000 * 1.5^3
        assert_eq!(
            next_interval(&counters(7, 0), &config),
            Duration::from_millis(16_875)
        );
    }

    #[test]
    fn test_first_overflow_applies_one_multiplication() {
        let config = BackoffConfig::default();
        assert_eq!(
            next_interval(&counters(5, 0), &config),
            Duration::from_millis(7_500)
        );
    }

    #[test]
    fn test_error_backoff_after_three_errors() {
        let config = BackoffConfig::default().with_error_multiplier(2.0);
        assert_eq!(
            next_interval(&counters(0, 3), &config),
            Duration::from_millis(40_000)
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = BackoffConfig::default();
        assert_eq!(next_interval(&counters(0, 64), &config), config.max_interval);
        assert_eq!(next_interval(&counters(0, u32::MAX), &config), config.max_interval);
        assert_eq!(next_interval(&counters(u32::MAX, 0), &config), config.max_interval);
    }

    #[test]
    fn test_error_backoff_dominates_idle_backoff() {
        let config = BackoffConfig::default();
        assert_eq!(
            next_interval(&counters(50, 1), &config),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn test_counter_updates() {
        let mut c = counters(3, 0);
        c.record_error();
        assert_eq!(c, counters(0, 1));

        c.record_success(0);
        assert_eq!(c, counters(1, 0));

        c.record_success(12);
        assert_eq!(c, counters(0, 0));
    }

    #[test]
    fn test_validate() {
        assert!(BackoffConfig::default().validate().is_ok());
        assert!(BackoffConfig::new(Duration::ZERO, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(BackoffConfig::new(Duration::from_secs(10), Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(BackoffConfig::default()
            .with_idle_multiplier(0.5)
            .validate()
            .is_err());
        assert!(BackoffConfig::default()
            .with_error_multiplier(f64::NAN)
            .validate()
            .is_err());
    }

    fn arb_config() -> impl Strategy<Value = BackoffConfig> {
        (1u64..20_000, 1u64..50, 0u32..10, 1.0f64..4.0, 1.0f64..4.0).prop_map(
            |(base, factor, threshold, idle, err)| {
                BackoffConfig::new(
                    Duration::from_millis(base),
                    Duration::from_millis(base * factor),
                )
                .with_empty_threshold(threshold)
                .with_idle_multiplier(idle)
                .with_error_multiplier(err)
            },
        )
    }

    proptest! {
        #[test]
        fn prop_error_backoff_ignores_empty_counter(
            config in arb_config(),
            errors in 1u32..40,
            empty in 0u32..100,
        ) {
            let expected = scaled(&config, config.error_backoff_multiplier, errors);
            prop_assert_eq!(next_interval(&counters(empty, errors), &config), expected);
            prop_assert_eq!(
                next_interval(&counters(0, errors), &config),
                next_interval(&counters(empty, errors), &config)
            );
        }

        #[test]
        fn prop_idle_backoff_formula(config in arb_config(), extra in 0u32..40) {
            let empty = config.empty_threshold + extra;
            let expected = scaled(&config, config.idle_backoff_multiplier, extra + 1);
            prop_assert_eq!(next_interval(&counters(empty, 0), &config), expected);
        }

        #[test]
        fn prop_interval_within_bounds(
            config in arb_config(),
            empty in 0u32..200,
            errors in 0u32..200,
        ) {
            let interval = next_interval(&counters(empty, errors), &config);
            prop_assert!(interval >= config.base_interval);
            prop_assert!(interval <= config.max_interval);
        }

        #[test]
        fn prop_non_empty_success_resets_counters(
            empty in 0u32..1000,
            errors in 0u32..1000,
            changes in 1u64..10_000,
        ) {
            let mut c = counters(empty, errors);
            c.record_success(changes);
            prop_assert_eq!(c, SyncCounters::default());
        }
    }
}
