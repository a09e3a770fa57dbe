//! High-level recording interface used by the worker loops.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! been called, so library users who never export metrics pay nothing but an
//! atomic load per call.

use std::time::Duration;

use super::prometheus::{
    ABANDONED_TOTAL, ATTEMPTS_TOTAL, ATTEMPT_DURATION, DEAD_LETTERS_TOTAL, EXECUTIONS_IN_FLIGHT,
    QUEUE_DEPTH, RESOLUTIONS_TOTAL,
};
use crate::fetcher::Resolution;

/// Metrics collector for recording fetcher operational metrics.
///
/// # Example
///
/// ```ignore
/// use pqueue_fetcher::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_attempt("success", Duration::from_millis(12));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one finished fetch attempt.
    ///
    /// # Arguments
    ///
    /// * `outcome` - Outcome label (`success`, `interrupted`, `failure`)
    /// * `duration` - Time from dispatch until the outcome was known
    pub fn record_attempt(&self, outcome: &str, duration: Duration) {
        if let Some(attempts) = ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[outcome]).inc();
        }

        if let Some(histogram) = ATTEMPT_DURATION.get() {
            histogram.observe(duration.as_secs_f64());
        }

        tracing::trace!(
            outcome = outcome,
            duration_ms = duration.as_millis() as u64,
            "Recorded attempt metric"
        );
    }

    /// Record what a worker did with an outcome.
    pub fn record_resolution(&self, resolution: &Resolution) {
        let action = match resolution {
            Resolution::Published => "published",
            Resolution::Requeued { .. } => "requeued",
            Resolution::DeadLettered { .. } => "dead_lettered",
        };

        if let Some(resolutions) = RESOLUTIONS_TOTAL.get() {
            resolutions.with_label_values(&[action]).inc();
        }

        if matches!(resolution, Resolution::DeadLettered { .. }) {
            if let Some(dead_letters) = DEAD_LETTERS_TOTAL.get() {
                dead_letters.inc();
            }
        }
    }

    /// Record an execution abandoned after the settle timeout.
    pub fn record_abandoned(&self) {
        if let Some(abandoned) = ABANDONED_TOTAL.get() {
            abandoned.inc();
        }
    }

    /// Update the pending queue depth.
    pub fn set_queue_depth(&self, depth: usize) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.set(depth as i64);
        }
    }

    /// Mark an execution as started.
    pub fn execution_started(&self) {
        if let Some(gauge) = EXECUTIONS_IN_FLIGHT.get() {
            gauge.inc();
        }
    }

    /// Mark an execution as settled or abandoned.
    pub fn execution_finished(&self) {
        if let Some(gauge) = EXECUTIONS_IN_FLIGHT.get() {
            gauge.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::RetryReason;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_collector_noop_before_init_does_not_panic() {
        let collector = MetricsCollector::new();
        collector.record_attempt("success", Duration::from_millis(5));
        collector.record_abandoned();
        collector.set_queue_depth(3);
    }

    #[test]
    fn test_collector_records_after_init() {
        init_metrics().expect("metrics should initialize");
        let collector = MetricsCollector::new();

        collector.record_attempt("interrupted", Duration::from_millis(100));
        collector.record_resolution(&Resolution::Requeued {
            priority: 0.44,
            reason: RetryReason::Interrupted,
        });
        collector.record_resolution(&Resolution::DeadLettered {
            reason: "boom".to_string(),
        });
        collector.execution_started();
        collector.execution_finished();
        collector.set_queue_depth(7);

        let metrics = export_metrics();
        assert!(metrics.contains("pqueue_fetcher_resolutions_total"));
        assert!(metrics.contains("pqueue_fetcher_dead_letters_total"));
        assert!(metrics.contains("pqueue_fetcher_queue_depth"));
    }
}
