//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for the fetcher pool:
//! attempts by outcome, attempt durations, queue depth, in-flight executions,
//! and dead letters.
//!
//! # Example
//!
//! ```ignore
//! use pqueue_fetcher::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run a fetcher ...
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ABANDONED_TOTAL, ATTEMPTS_TOTAL, ATTEMPT_DURATION, DEAD_LETTERS_TOTAL, EXECUTIONS_IN_FLIGHT,
    QUEUE_DEPTH, REGISTRY, RESOLUTIONS_TOTAL,
};
