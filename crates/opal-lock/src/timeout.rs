//! Dynamic lock timeout
//!
//! Lock acquires carry a budget that adapts to observed contention: the
//! budget doubles after a failure and halves after a comfortably fast
//! success, clamped to configured bounds. Callers share one adapter per
//! operation class.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use opal_common::config::LockConfig;

/// Adaptive timeout shared by callers of one operation class
pub struct DynamicTimeout {
    current_ms: AtomicU64,
    min_ms: u64,
    max_ms: u64,
}

impl DynamicTimeout {
    #[must_use]
    pub fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        let min_ms = min.as_millis().max(1) as u64;
        let max_ms = (max.as_millis() as u64).max(min_ms);
        let init = (initial.as_millis() as u64).clamp(min_ms, max_ms);
        Self {
            current_ms: AtomicU64::new(init),
            min_ms,
            max_ms,
        }
    }

    #[must_use]
    pub fn from_config(cfg: &LockConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.timeout_ms),
            Duration::from_millis(cfg.min_timeout_ms),
            Duration::from_millis(cfg.max_timeout_ms),
        )
    }

    /// Current budget for one acquire.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.current_ms.load(Ordering::Relaxed))
    }

    /// Record a successful acquire that took `elapsed`. A grant well
    /// inside the budget shrinks it.
    pub fn log_success(&self, elapsed: Duration) {
        let current = self.current_ms.load(Ordering::Relaxed);
        if (elapsed.as_millis() as u64).saturating_mul(2) < current {
            let next = (current / 2).max(self.min_ms);
            self.current_ms.store(next, Ordering::Relaxed);
        }
    }

    /// Record a timed-out acquire; the budget doubles.
    pub fn log_failure(&self) {
        let current = self.current_ms.load(Ordering::Relaxed);
        let next = current.saturating_mul(2).min(self.max_ms);
        self.current_ms.store(next, Ordering::Relaxed);
    }
}

impl Default for DynamicTimeout {
    fn default() -> Self {
        Self::from_config(&LockConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_doubles_up_to_max() {
        let t = DynamicTimeout::new(
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_millis(350),
        );
        t.log_failure();
        assert_eq!(t.timeout(), Duration::from_millis(200));
        t.log_failure();
        assert_eq!(t.timeout(), Duration::from_millis(350));
        t.log_failure();
        assert_eq!(t.timeout(), Duration::from_millis(350));
    }

    #[test]
    fn test_fast_success_halves_down_to_min() {
        let t = DynamicTimeout::new(
            Duration::from_millis(400),
            Duration::from_millis(150),
            Duration::from_millis(800),
        );
        t.log_success(Duration::from_millis(10));
        assert_eq!(t.timeout(), Duration::from_millis(200));
        t.log_success(Duration::from_millis(10));
        assert_eq!(t.timeout(), Duration::from_millis(150));
    }

    #[test]
    fn test_slow_success_keeps_budget() {
        let t = DynamicTimeout::new(
            Duration::from_millis(400),
            Duration::from_millis(100),
            Duration::from_millis(800),
        );
        t.log_success(Duration::from_millis(390));
        assert_eq!(t.timeout(), Duration::from_millis(400));
    }
}
