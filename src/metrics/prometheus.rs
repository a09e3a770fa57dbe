//! Prometheus metrics registration and export.
//!
//! This module defines the Prometheus metrics recorded by the fetcher pool and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Serializes initialization so every static comes from the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all fetcher metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total fetch attempts, labeled by outcome (success, interrupted, failure).
pub static ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total resolutions, labeled by action (published, requeued, dead_lettered).
pub static RESOLUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Fetch attempt duration in seconds, including settling after cancellation.
pub static ATTEMPT_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Number of tasks waiting in the pending queue.
pub static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();

/// Number of executions currently in flight.
pub static EXECUTIONS_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Total tasks moved to the dead-letter list.
pub static DEAD_LETTERS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Total executions abandoned after the settle timeout.
pub static ABANDONED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
///
/// # Example
///
/// ```ignore
/// use pqueue_fetcher::metrics::init_metrics;
///
/// init_metrics().expect("Failed to initialize metrics");
/// ```
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let attempts_total = CounterVec::new(
        Opts::new("pqueue_fetcher_attempts_total", "Total fetch attempts"),
        &["outcome"],
    )?;

    let resolutions_total = CounterVec::new(
        Opts::new(
            "pqueue_fetcher_resolutions_total",
            "Total attempt resolutions by action",
        ),
        &["action"],
    )?;

    let attempt_duration = Histogram::with_opts(
        HistogramOpts::new(
            "pqueue_fetcher_attempt_duration_seconds",
            "Fetch attempt duration in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0]),
    )?;

    let queue_depth = IntGauge::new(
        "pqueue_fetcher_queue_depth",
        "Number of tasks waiting in the pending queue",
    )?;

    let executions_in_flight = Gauge::new(
        "pqueue_fetcher_executions_in_flight",
        "Number of fetch executions currently running",
    )?;

    let dead_letters_total = Counter::new(
        "pqueue_fetcher_dead_letters_total",
        "Total tasks moved to the dead-letter list",
    )?;

    let abandoned_total = Counter::new(
        "pqueue_fetcher_abandoned_total",
        "Total executions abandoned after the settle timeout",
    )?;

    registry.register(Box::new(attempts_total.clone()))?;
    registry.register(Box::new(resolutions_total.clone()))?;
    registry.register(Box::new(attempt_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(executions_in_flight.clone()))?;
    registry.register(Box::new(dead_letters_total.clone()))?;
    registry.register(Box::new(abandoned_total.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = ATTEMPTS_TOTAL.set(attempts_total);
    let _ = RESOLUTIONS_TOTAL.set(resolutions_total);
    let _ = ATTEMPT_DURATION.set(attempt_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = EXECUTIONS_IN_FLIGHT.set(executions_in_flight);
    let _ = DEAD_LETTERS_TOTAL.set(dead_letters_total);
    let _ = ABANDONED_TOTAL.set(abandoned_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// string is a comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        init_metrics().expect("metrics should initialize");

        if let Some(attempts) = ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&["success"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("pqueue_fetcher_attempts_total"));
    }
}
