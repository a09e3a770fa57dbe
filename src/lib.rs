//! pqueue-fetcher: priority-queue fetching with supervised, deadline-bounded
//! attempts.
//!
//! This library provides a worker pool that fetches submitted locations in
//! priority order, cancels attempts that exceed their deadline, and requeues
//! unsuccessful locations with a decayed priority.

pub mod cli;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod simulate;

pub use error::{FetchInterrupted, ScenarioError};
pub use fetcher::{
    CancelSignal, ConfigError, Fetch, Fetcher, FetcherConfig, PoolError, PoolStats, ResultSink,
    TaskId,
};
