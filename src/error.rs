//! Error types for pqueue-fetcher operations.
//!
//! Errors that belong to a single subsystem live next to it
//! (`fetcher::ConfigError`, `fetcher::PoolError`). This module holds the
//! ones shared across subsystems:
//! - The interruption marker returned by cooperative fetch functions
//! - Scenario loading for the simulation harness

use thiserror::Error;

/// Marker error a cooperative fetch returns after observing cancellation.
///
/// Any `anyhow::Error` that downcasts to this type is classified as an
/// interrupted attempt rather than a failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Default)]
#[error("fetch interrupted by deadline")]
pub struct FetchInterrupted;

/// Errors that can occur while loading or running a simulation scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Scenario contains no locations")]
    Empty,

    #[error("Invalid priority {priority} for location {index}: must be finite")]
    InvalidPriority { index: usize, priority: f64 },

    #[error("Scenario did not finish within {seconds} seconds")]
    DeadlineExceeded { seconds: u64 },

    #[error("Fetcher error: {0}")]
    Pool(#[from] crate::fetcher::PoolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_interrupted_downcasts_through_anyhow() {
        let err: anyhow::Error = FetchInterrupted.into();
        assert!(err.downcast_ref::<FetchInterrupted>().is_some());
        assert!(err.to_string().contains("interrupted"));
    }

    #[test]
    fn test_scenario_error_display() {
        let err = ScenarioError::InvalidPriority {
            index: 2,
            priority: f64::NAN,
        };
        assert!(err.to_string().contains("location 2"));

        let err = ScenarioError::DeadlineExceeded { seconds: 30 };
        assert!(err.to_string().contains("30"));

        assert!(ScenarioError::Empty.to_string().contains("no locations"));
    }
}
