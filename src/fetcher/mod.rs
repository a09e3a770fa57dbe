//! Priority-queue fetcher with supervised, deadline-bounded attempts.
//!
//! Callers submit locations with a priority (lower = more urgent). A pool of
//! workers pulls the most urgent location, runs the blocking fetch function
//! on tokio's blocking pool, and enforces a per-attempt deadline. Outcomes
//! are resolved as follows:
//!
//! - **Success**: the value passes the success predicate and is published to
//!   the [`ResultSink`]
//! - **Rejected / Interrupted**: the location is requeued with a decayed
//!   priority
//! - **Failure**: requeued until the failure budget is spent, then moved to
//!   the dead-letter list
//!
//! # Architecture
//!
//! ```text
//!   add(location, priority)
//!            │
//!     ┌──────▼───────┐
//!     │ PendingQueue │◄──────────── requeue(decay(priority))
//!     └──────┬───────┘                        ▲
//!            │ pop                            │
//!   ┌────────┼─────────┐                      │
//!   ▼        ▼         ▼                      │
//! ┌────┐  ┌────┐    ┌────┐  spawn   ┌─────────────┐
//! │ W0 │  │ W1 │ …  │ WN │ ───────► │  Execution  │
//! └────┘  └────┘    └────┘ deadline └─────────────┘
//!   │        │         │
//!   └────────┼─────────┘
//!            ▼ publish
//!     ┌──────────────┐
//!     │  ResultSink  │
//!     └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use pqueue_fetcher::fetcher::{Fetcher, FetcherConfig};
//! use std::time::Duration;
//!
//! let config = FetcherConfig::new(4).with_timeout(Duration::from_millis(250));
//! let mut fetcher = Fetcher::new(|path: &String| Ok(std::fs::read_to_string(path)?), config)?;
//!
//! fetcher.add_with_priority("a.txt".to_string(), 0.1)?;
//! fetcher.add("b.txt".to_string())?;
//!
//! let results = fetcher.start()?;
//! fetcher.join().await?;
//! let contents = results.drain();
//! fetcher.shutdown().await?;
//! ```

pub mod config;
pub mod execution;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod sink;
pub mod task;
pub mod worker;

pub use config::{ConfigError, FetcherConfig};
pub use execution::{CancelSignal, Execution, Fetch, Settled};
pub use policy::{
    Checkpoint, MultiplicativeDecay, NoYield, PriorityDecay, SchedulerYield, SuccessPredicate,
    Truthiness, Truthy, YieldPoint, DEFAULT_DECAY_FACTOR,
};
pub use pool::{Fetcher, PoolError, PoolStats, Submitter};
pub use queue::{PendingQueue, QueueStats, TaskLease};
pub use sink::ResultSink;
pub use task::{
    DeadLetter, FetchOutcome, Resolution, RetryReason, Task, TaskId, DEFAULT_PRIORITY,
};
pub use worker::WorkerState;
