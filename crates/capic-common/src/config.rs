//! Reconcile timing policy
//!
//! All intervals have defaults in code; the operator binary exposes each one
//! as a flag/environment variable and builds a [`ReconcileConfig`] from them.

use std::time::Duration;

/// Exponential delay curve
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay for the given number of previous consecutive failures
    ///
    /// `delay_for(0)` is the initial delay; the result never exceeds `max`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Timing policy shared by the cluster and machine reconcilers
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileConfig {
    /// Fixed requeue while an asynchronous cloud request is in flight
    pub poll_interval: Duration,
    /// Requeue while waiting on another object (cluster readiness, bootstrap data, credentials)
    pub waiting_interval: Duration,
    /// Periodic resync once a resource is Ready/Running, to catch drift
    pub ready_resync: Duration,
    /// Age after which a still-pending cloud request is reported as stale
    pub staleness_threshold: Duration,
    /// Backoff for transient failures and stale requests
    pub backoff: BackoffConfig,
    /// Attempts for a status write that keeps hitting optimistic-concurrency conflicts
    pub conflict_retries: u32,
    /// Maximum number of concurrent reconciles per controller (0 = unbounded)
    pub concurrency: u16,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            waiting_interval: Duration::from_secs(15),
            ready_resync: Duration::from_secs(300),
            staleness_threshold: Duration::from_secs(600),
            backoff: BackoffConfig::default(),
            conflict_retries: 5,
            concurrency: 8,
        }
    }
}

impl ReconcileConfig {
    /// Config with short intervals for unit tests
    pub fn for_testing() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            waiting_interval: Duration::from_secs(15),
            ready_resync: Duration::from_secs(300),
            staleness_threshold: Duration::from_secs(600),
            backoff: BackoffConfig {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(8),
                multiplier: 2.0,
            },
            conflict_retries: 3,
            concurrency: 1,
        }
    }
}
