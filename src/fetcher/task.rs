//! Task definitions for the fetcher.
//!
//! This module defines the core types that flow through the pool:
//!
//! - `Task`: a location awaiting a fetch attempt, with its priority
//! - `FetchOutcome`: what a single attempt produced
//! - `Resolution`: what the worker did with that outcome
//! - `DeadLetter`: a task the pool gave up on

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default priority for submitted locations.
pub const DEFAULT_PRIORITY: f64 = 0.5;

/// Identifier of a submitted task, stable across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A location waiting for a fetch attempt.
///
/// Lower priority values are more urgent. The location is shared behind an
/// `Arc` so an attempt can hand it to a blocking thread while the task itself
/// stays with the worker for requeueing.
#[derive(Debug)]
pub struct Task<L> {
    /// Identifier assigned at submission.
    pub id: TaskId,
    /// Current priority (lower = more urgent).
    pub priority: f64,
    /// The location to fetch from.
    pub location: Arc<L>,
    /// Number of attempts already made.
    pub attempts: u32,
    /// Number of attempts that ended in a fetch error.
    pub failures: u32,
    /// When the task was first submitted.
    pub submitted_at: DateTime<Utc>,
}

impl<L> Task<L> {
    /// Creates a fresh task with no attempts.
    pub fn new(location: L, priority: f64) -> Self {
        Self {
            id: TaskId::new(),
            priority,
            location: Arc::new(location),
            attempts: 0,
            failures: 0,
            submitted_at: Utc::now(),
        }
    }

    /// Builds the follow-up task after an attempt that will be retried.
    ///
    /// The location and identity carry over; the attempt counter advances.
    pub fn retry(&self, priority: f64) -> Self {
        Self {
            id: self.id,
            priority,
            location: Arc::clone(&self.location),
            attempts: self.attempts.saturating_add(1),
            failures: self.failures,
            submitted_at: self.submitted_at,
        }
    }

    /// Like [`Task::retry`], also counting the attempt as a failure.
    pub fn retry_after_failure(&self, priority: f64) -> Self {
        let mut next = self.retry(priority);
        next.failures = next.failures.saturating_add(1);
        next
    }
}

impl<L> Clone for Task<L> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            priority: self.priority,
            location: Arc::clone(&self.location),
            attempts: self.attempts,
            failures: self.failures,
            submitted_at: self.submitted_at,
        }
    }
}

/// What a single fetch attempt produced.
///
/// Produced exactly once per execution and consumed by the worker that
/// spawned it.
#[derive(Debug)]
pub enum FetchOutcome<V> {
    /// The fetch returned a value before cancellation was observed.
    Success(V),
    /// The deadline elapsed and cancellation was observed first.
    Interrupted,
    /// The fetch returned an error or panicked.
    Failure(anyhow::Error),
}

impl<V> FetchOutcome<V> {
    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::Interrupted => "interrupted",
            FetchOutcome::Failure(_) => "failure",
        }
    }
}

/// Why a task went back into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryReason {
    /// The attempt exceeded its deadline.
    Interrupted,
    /// The fetched value failed the success predicate.
    Rejected,
    /// The fetch raised an error.
    Failed,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Interrupted => write!(f, "interrupted"),
            RetryReason::Rejected => write!(f, "rejected"),
            RetryReason::Failed => write!(f, "failed"),
        }
    }
}

/// What a worker did with an attempt's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The value was published to the result sink.
    Published,
    /// The task was pushed back with a new priority.
    Requeued { priority: f64, reason: RetryReason },
    /// The task was moved to the dead-letter list.
    DeadLettered { reason: String },
}

impl Resolution {
    /// Returns whether the task went back into the pending queue.
    pub fn is_requeued(&self) -> bool {
        matches!(self, Resolution::Requeued { .. })
    }
}

/// A task the pool stopped retrying, with the reason.
#[derive(Debug)]
pub struct DeadLetter<L> {
    /// The task as it was on its last attempt.
    pub task: Task<L>,
    /// Description of the final error.
    pub error: String,
    /// When the task was moved here.
    pub moved_at: DateTime<Utc>,
}

impl<L> DeadLetter<L> {
    pub(crate) fn new(task: Task<L>, error: impl Into<String>) -> Self {
        Self {
            task,
            error: error.into(),
            moved_at: Utc::now(),
        }
    }
}

impl<L> Clone for DeadLetter<L> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            error: self.error.clone(),
            moved_at: self.moved_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new() {
        let task = Task::new("loc-1", 0.4);

        assert_eq!(*task.location, "loc-1");
        assert!((task.priority - 0.4).abs() < f64::EPSILON);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.failures, 0);
        assert!(!task.id.as_uuid().is_nil());
    }

    #[test]
    fn test_task_retry_keeps_identity() {
        let task = Task::new("loc-1", 0.4);
        let next = task.retry(0.44);

        assert_eq!(next.id, task.id);
        assert!(Arc::ptr_eq(&next.location, &task.location));
        assert_eq!(next.attempts, 1);
        assert_eq!(next.failures, 0);
        assert!((next.priority - 0.44).abs() < f64::EPSILON);
        assert_eq!(next.submitted_at, task.submitted_at);
    }

    #[test]
    fn test_task_retry_after_failure() {
        let task = Task::new(7u32, 1.0);
        let next = task.retry_after_failure(1.1).retry_after_failure(1.21);

        assert_eq!(next.attempts, 2);
        assert_eq!(next.failures, 2);
    }

    #[test]
    fn test_task_counters_saturate() {
        let mut task = Task::new("loc-1", 0.4);
        task.attempts = u32::MAX;
        task.failures = u32::MAX;

        let next = task.retry_after_failure(0.44);
        assert_eq!(next.attempts, u32::MAX);
        assert_eq!(next.failures, u32::MAX);
    }

    #[test]
    fn test_fetch_outcome_label() {
        assert_eq!(FetchOutcome::Success(1).label(), "success");
        assert_eq!(FetchOutcome::<i32>::Interrupted.label(), "interrupted");
        assert_eq!(
            FetchOutcome::<i32>::Failure(anyhow::anyhow!("boom")).label(),
            "failure"
        );
    }

    #[test]
    fn test_retry_reason_display() {
        assert_eq!(format!("{}", RetryReason::Interrupted), "interrupted");
        assert_eq!(format!("{}", RetryReason::Rejected), "rejected");
        assert_eq!(format!("{}", RetryReason::Failed), "failed");
    }

    #[test]
    fn test_resolution_is_requeued() {
        assert!(Resolution::Requeued {
            priority: 0.5,
            reason: RetryReason::Rejected
        }
        .is_requeued());
        assert!(!Resolution::Published.is_requeued());
        assert!(!Resolution::DeadLettered {
            reason: "x".to_string()
        }
        .is_requeued());
    }

    #[test]
    fn test_dead_letter_new() {
        let letter = DeadLetter::new(Task::new("loc", 0.5), "boom");
        assert_eq!(letter.error, "boom");
        assert!(letter.moved_at >= letter.task.submitted_at);
    }
}
