//! Worker loop: pull a task, supervise one attempt, resolve its outcome.
//!
//! Each worker cycles through four states:
//!
//! ```text
//! WaitingForTask -> Dispatching -> Supervising -> Resolving -> WaitingForTask
//! ```
//!
//! A fetch error never ends the loop; it is resolved like any other outcome.
//! Panics in the success predicate or decay policy are resolved as failures.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;

use super::execution::{panic_message, Execution, Fetch, Settled};
use super::policy::{PriorityDecay, SuccessPredicate, YieldPoint};
use super::pool::SharedPoolStats;
use super::queue::{PendingQueue, TaskLease};
use super::sink::ResultSink;
use super::task::{DeadLetter, FetchOutcome, Resolution, RetryReason};

/// Observable state of a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Waiting on the pending queue.
    WaitingForTask = 0,
    /// Starting an execution for the dequeued task.
    Dispatching = 1,
    /// Waiting for the execution or its deadline.
    Supervising = 2,
    /// Publishing, requeueing or dead-lettering the outcome.
    Resolving = 3,
    /// The loop has exited.
    Stopped = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::WaitingForTask,
            1 => WorkerState::Dispatching,
            2 => WorkerState::Supervising,
            3 => WorkerState::Resolving,
            _ => WorkerState::Stopped,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::WaitingForTask => write!(f, "waiting_for_task"),
            WorkerState::Dispatching => write!(f, "dispatching"),
            WorkerState::Supervising => write!(f, "supervising"),
            WorkerState::Resolving => write!(f, "resolving"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shared cell a worker publishes its state through.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(WorkerState::WaitingForTask as u8))
    }

    pub(crate) fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Everything a worker needs, shared by all workers of one pool.
pub(crate) struct WorkerContext<L, V> {
    pub fetch: Arc<dyn Fetch<L, V>>,
    pub predicate: Arc<dyn SuccessPredicate<V>>,
    pub decay: Arc<dyn PriorityDecay>,
    pub yield_point: Arc<dyn YieldPoint>,
    pub queue: Arc<PendingQueue<L>>,
    pub sink: ResultSink<V>,
    pub dead_letters: Arc<Mutex<Vec<DeadLetter<L>>>>,
    pub stats: Arc<SharedPoolStats>,
    pub metrics: MetricsCollector,
    pub timeout: Duration,
    pub settle_timeout: Option<Duration>,
    pub max_failures: u32,
    pub max_attempts: Option<u32>,
}

/// A single worker pulling tasks from the shared queue.
pub(crate) struct Worker<L, V> {
    id: String,
    ctx: Arc<WorkerContext<L, V>>,
    state: Arc<StateCell>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<L, V> Worker<L, V>
where
    L: Send + Sync + 'static,
    V: Send + 'static,
{
    pub(crate) fn new(
        id: String,
        ctx: Arc<WorkerContext<L, V>>,
        state: Arc<StateCell>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            ctx,
            state,
            shutdown_rx,
        }
    }

    /// Main worker loop.
    ///
    /// Runs until the shutdown signal arrives or the pool is dropped. The
    /// signal is only observed between tasks, so an attempt in progress is
    /// always resolved first.
    pub(crate) async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");
        let queue = Arc::clone(&self.ctx.queue);

        loop {
            self.state.set(WorkerState::WaitingForTask);

            let lease = tokio::select! {
                biased;
                signal = self.shutdown_rx.recv() => match signal {
                    Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                        info!(worker_id = %self.id, "Worker received shutdown signal");
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                },
                lease = queue.pop() => lease,
            };

            self.process(lease).await;
        }

        self.state.set(WorkerState::Stopped);
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Runs one attempt for a leased task and resolves its outcome.
    async fn process(&self, lease: TaskLease<'_, L>) -> Resolution {
        let task = lease.task();
        let task_id = task.id;
        let start_time = Instant::now();

        debug!(
            worker_id = %self.id,
            task_id = %task_id,
            priority = task.priority,
            attempt = task.attempts.saturating_add(1),
            "Dispatching fetch"
        );

        self.state.set(WorkerState::Dispatching);
        self.ctx.stats.increment_active();
        self.ctx.metrics.execution_started();

        let mut execution = Execution::spawn(
            Arc::clone(&self.ctx.fetch),
            Arc::clone(&task.location),
            Arc::clone(&self.ctx.yield_point),
        );

        self.state.set(WorkerState::Supervising);
        let waited = tokio::time::timeout(self.ctx.timeout, execution.wait()).await;
        let outcome = match waited {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    timeout_ms = self.ctx.timeout.as_millis() as u64,
                    "Deadline elapsed, cancelling fetch"
                );
                execution.cancel();
                match execution.settle(self.ctx.settle_timeout).await {
                    Settled::Finished(outcome) => outcome,
                    Settled::Abandoned => {
                        self.ctx.stats.record_abandoned();
                        self.ctx.metrics.record_abandoned();
                        FetchOutcome::Interrupted
                    }
                }
            }
        };

        let duration = start_time.elapsed();
        self.ctx.stats.decrement_active();
        self.ctx.stats.record_attempt(duration);
        self.ctx.metrics.execution_finished();
        self.ctx.metrics.record_attempt(outcome.label(), duration);

        self.state.set(WorkerState::Resolving);
        let resolution = self.resolve(lease, outcome).await;

        self.ctx.metrics.record_resolution(&resolution);
        self.ctx.metrics.set_queue_depth(self.ctx.queue.len());
        resolution
    }

    /// Decides what happens to a task after an attempt.
    ///
    /// The lease is released only after the value is published or the
    /// follow-up task is queued.
    async fn resolve(&self, lease: TaskLease<'_, L>, outcome: FetchOutcome<V>) -> Resolution {
        match outcome {
            FetchOutcome::Success(value) => match self.accepts(&value) {
                Ok(true) => {
                    self.ctx.sink.publish(value).await;
                    self.ctx.stats.record_published();
                    info!(
                        worker_id = %self.id,
                        task_id = %lease.task().id,
                        attempts = lease.task().attempts.saturating_add(1),
                        "Published fetched value"
                    );
                    drop(lease);
                    Resolution::Published
                }
                Ok(false) => self.retry(lease, RetryReason::Rejected, None),
                Err(error) => self.retry(lease, RetryReason::Failed, Some(error)),
            },
            FetchOutcome::Interrupted => self.retry(lease, RetryReason::Interrupted, None),
            FetchOutcome::Failure(error) => self.retry(lease, RetryReason::Failed, Some(error)),
        }
    }

    /// Runs the success predicate; a panic becomes an error.
    fn accepts(&self, value: &V) -> anyhow::Result<bool> {
        let evaluate = AssertUnwindSafe(|| self.ctx.predicate.evaluate(value));
        panic::catch_unwind(evaluate).map_err(|payload| {
            anyhow::anyhow!("success predicate panicked: {}", panic_message(payload.as_ref()))
        })
    }

    /// Runs the decay policy; a panic becomes an error.
    fn decayed(&self, priority: f64) -> anyhow::Result<f64> {
        let decay = AssertUnwindSafe(|| self.ctx.decay.decay(priority));
        panic::catch_unwind(decay).map_err(|payload| {
            anyhow::anyhow!("priority decay panicked: {}", panic_message(payload.as_ref()))
        })
    }

    fn retry(
        &self,
        lease: TaskLease<'_, L>,
        mut reason: RetryReason,
        mut error: Option<anyhow::Error>,
    ) -> Resolution {
        let task = lease.task();
        let attempts = task.attempts.saturating_add(1);

        // A broken decay policy keeps the priority and counts as a failure.
        let priority = match self.decayed(task.priority) {
            Ok(priority) => priority,
            Err(decay_error) => {
                reason = RetryReason::Failed;
                error = Some(decay_error);
                task.priority
            }
        };

        if let Some(error) = &error {
            let failures = task.failures.saturating_add(1);
            if failures >= self.ctx.max_failures {
                let message =
                    format!("attempt failed {} times, last error: {:#}", failures, error);
                return self.dead_letter(lease, message, true);
            }
            warn!(
                worker_id = %self.id,
                task_id = %task.id,
                error = %error,
                failures = failures,
                "Attempt failed, requeueing for retry"
            );
        }

        if let Some(max_attempts) = self.ctx.max_attempts {
            if attempts >= max_attempts {
                let message = format!(
                    "gave up after {} attempts, last attempt {}",
                    attempts, reason
                );
                return self.dead_letter(lease, message, error.is_some());
            }
        }

        let next = if error.is_some() {
            task.retry_after_failure(priority)
        } else {
            task.retry(priority)
        };

        debug!(
            worker_id = %self.id,
            task_id = %task.id,
            reason = %reason,
            old_priority = task.priority,
            new_priority = priority,
            "Requeueing task"
        );

        self.ctx.stats.record_requeue(reason);
        lease.requeue(next);
        Resolution::Requeued { priority, reason }
    }

    fn dead_letter(&self, lease: TaskLease<'_, L>, reason: String, failed: bool) -> Resolution {
        let task = lease.task();
        let mut last = task.clone();
        last.attempts = last.attempts.saturating_add(1);
        if failed {
            last.failures = last.failures.saturating_add(1);
        }

        warn!(
            worker_id = %self.id,
            task_id = %task.id,
            attempts = last.attempts,
            reason = %reason,
            "Moving task to dead letter list"
        );

        self.ctx
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeadLetter::new(last, reason.clone()));
        self.ctx.stats.record_dead_letter();
        drop(lease);
        Resolution::DeadLettered { reason }
    }
}
