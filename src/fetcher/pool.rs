//! Fetcher pool: submission, lifecycle and statistics.
//!
//! A [`Fetcher`] owns one pending queue, one result sink, and a fixed number
//! of worker loops running as tokio tasks.
//!
//! # Features
//!
//! - Submission before or while the pool runs, from any task
//! - Graceful shutdown with broadcast channel
//! - Retry with decayed priority, dead-letter list for exhausted tasks
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::metrics::MetricsCollector;

use super::config::{duration_millis, ConfigError, FetcherConfig};
use super::execution::Fetch;
use super::policy::{
    MultiplicativeDecay, PriorityDecay, SchedulerYield, SuccessPredicate, Truthiness, Truthy,
    YieldPoint,
};
use super::queue::{PendingQueue, QueueStats};
use super::sink::ResultSink;
use super::task::{DeadLetter, RetryReason, Task, TaskId};
use super::worker::{StateCell, Worker, WorkerContext, WorkerState};

/// Errors that can occur in the fetcher pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// A location was submitted with a NaN or infinite priority.
    #[error("Priority must be finite, got {0}")]
    InvalidPriority(f64),

    /// The pool configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Statistics about the fetcher pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently supervising an attempt.
    pub active_workers: usize,
    /// Values published to the result sink.
    pub published: u64,
    /// Requeues after a deadline elapsed.
    pub requeued_interrupted: u64,
    /// Requeues after the predicate rejected a value.
    pub requeued_rejected: u64,
    /// Requeues after a fetch error.
    pub requeued_failed: u64,
    /// Tasks moved to the dead-letter list.
    pub dead_lettered: u64,
    /// Executions left running after the settle timeout.
    pub abandoned: u64,
    /// Fetch attempts finished.
    pub total_attempts: u64,
    /// Average attempt duration, including settling.
    #[serde(rename = "average_attempt_duration_ms", with = "duration_millis")]
    pub average_attempt_duration: Duration,
}

impl PoolStats {
    /// Returns the number of tasks resolved for good (published + dead-lettered).
    pub fn total_processed(&self) -> u64 {
        self.published + self.dead_lettered
    }

    /// Returns the total number of requeues.
    pub fn total_requeued(&self) -> u64 {
        self.requeued_interrupted + self.requeued_rejected + self.requeued_failed
    }

    /// Returns the share of attempts that ended in a publish, as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        (self.published as f64 / self.total_attempts as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
pub(crate) struct SharedPoolStats {
    published: AtomicU64,
    requeued_interrupted: AtomicU64,
    requeued_rejected: AtomicU64,
    requeued_failed: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
    attempts: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    pub(crate) fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            requeued_interrupted: AtomicU64::new(0),
            requeued_rejected: AtomicU64::new(0),
            requeued_failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_attempt(&self, duration: Duration) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_requeue(&self, reason: RetryReason) {
        let counter = match reason {
            RetryReason::Interrupted => &self.requeued_interrupted,
            RetryReason::Rejected => &self.requeued_rejected,
            RetryReason::Failed => &self.requeued_failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let attempts = self.attempts.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let average_duration = if attempts > 0 {
            Duration::from_millis(total_duration_ms / attempts)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            published: self.published.load(Ordering::SeqCst),
            requeued_interrupted: self.requeued_interrupted.load(Ordering::SeqCst),
            requeued_rejected: self.requeued_rejected.load(Ordering::SeqCst),
            requeued_failed: self.requeued_failed.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            abandoned: self.abandoned.load(Ordering::SeqCst),
            total_attempts: attempts,
            average_attempt_duration: average_duration,
        }
    }
}

/// Cloneable handle for submitting locations to a fetcher.
pub struct Submitter<L> {
    queue: Arc<PendingQueue<L>>,
    default_priority: f64,
}

impl<L> Clone for Submitter<L> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            default_priority: self.default_priority,
        }
    }
}

impl<L> Submitter<L> {
    /// Enqueues a location with the default priority.
    pub fn add(&self, location: L) -> Result<TaskId, PoolError> {
        self.add_with_priority(location, self.default_priority)
    }

    /// Enqueues a location. Lower priority values are fetched first.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidPriority` for NaN or infinite priorities.
    pub fn add_with_priority(&self, location: L, priority: f64) -> Result<TaskId, PoolError> {
        if !priority.is_finite() {
            return Err(PoolError::InvalidPriority(priority));
        }

        let task = Task::new(location, priority);
        let task_id = task.id;
        self.queue.push(task);
        debug!(task_id = %task_id, priority = priority, "Location submitted");
        Ok(task_id)
    }
}

/// Priority-queue fetcher backed by a pool of supervised workers.
///
/// # Example
///
/// ```rust,ignore
/// use pqueue_fetcher::fetcher::{Fetcher, FetcherConfig};
///
/// let fetch = |url: &String| -> anyhow::Result<String> { download(url) };
/// let mut fetcher = Fetcher::new(fetch, FetcherConfig::new(4))?;
/// fetcher.add_with_priority("https://example.com/a".to_string(), 0.2)?;
///
/// let results = fetcher.start()?;
/// fetcher.join().await?;
/// for body in results.drain() {
///     println!("{}", body);
/// }
/// fetcher.shutdown().await?;
/// ```
pub struct Fetcher<L, V> {
    config: FetcherConfig,
    fetch: Arc<dyn Fetch<L, V>>,
    predicate: Arc<dyn SuccessPredicate<V>>,
    decay: Arc<dyn PriorityDecay>,
    yield_point: Arc<dyn YieldPoint>,
    queue: Arc<PendingQueue<L>>,
    sink: ResultSink<V>,
    dead_letters: Arc<Mutex<Vec<DeadLetter<L>>>>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    worker_states: Vec<Arc<StateCell>>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl<L, V> Fetcher<L, V>
where
    L: Send + Sync + 'static,
    V: Send + 'static,
{
    /// Creates a fetcher that publishes truthy values.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` if the configuration is invalid.
    pub fn new(fetch: impl Fetch<L, V>, config: FetcherConfig) -> Result<Self, PoolError>
    where
        V: Truthiness,
    {
        Self::with_predicate(fetch, config, Truthy)
    }

    /// Creates a fetcher with a custom success predicate.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` if the configuration is invalid.
    pub fn with_predicate(
        fetch: impl Fetch<L, V>,
        config: FetcherConfig,
        predicate: impl SuccessPredicate<V>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let decay = MultiplicativeDecay::new(config.decay_factor)?;

        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            sink: ResultSink::with_capacity(config.result_capacity),
            config,
            fetch: Arc::new(fetch),
            predicate: Arc::new(predicate),
            decay: Arc::new(decay),
            yield_point: Arc::new(SchedulerYield),
            queue: Arc::new(PendingQueue::new()),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
            worker_states: Vec::new(),
            shutdown_tx,
            worker_handles: Vec::new(),
            is_running: AtomicBool::new(false),
        })
    }

    /// Replaces the priority decay policy.
    pub fn with_priority_decay(mut self, decay: impl PriorityDecay) -> Self {
        self.decay = Arc::new(decay);
        self
    }

    /// Replaces the yield point passed between fetch return and commit.
    pub fn with_yield_point(mut self, yield_point: impl YieldPoint) -> Self {
        self.yield_point = Arc::new(yield_point);
        self
    }

    /// Publishes into an existing sink, e.g. one shared by several fetchers.
    pub fn with_result_sink(mut self, sink: ResultSink<V>) -> Self {
        self.sink = sink;
        self
    }

    /// Enqueues a location with the configured default priority.
    pub fn add(&self, location: L) -> Result<TaskId, PoolError> {
        self.submitter().add(location)
    }

    /// Enqueues a location with an explicit priority.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidPriority` for NaN or infinite priorities.
    pub fn add_with_priority(&self, location: L, priority: f64) -> Result<TaskId, PoolError> {
        self.submitter().add_with_priority(location, priority)
    }

    /// Returns a submission handle usable from other tasks.
    pub fn submitter(&self) -> Submitter<L> {
        Submitter {
            queue: Arc::clone(&self.queue),
            default_priority: self.config.default_priority,
        }
    }

    /// Starts all workers and returns the result sink.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<ResultSink<V>, PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let ctx = Arc::new(WorkerContext {
            fetch: Arc::clone(&self.fetch),
            predicate: Arc::clone(&self.predicate),
            decay: Arc::clone(&self.decay),
            yield_point: Arc::clone(&self.yield_point),
            queue: Arc::clone(&self.queue),
            sink: self.sink.clone(),
            dead_letters: Arc::clone(&self.dead_letters),
            stats: Arc::clone(&self.stats),
            metrics: self.metrics.clone(),
            timeout: self.config.timeout,
            settle_timeout: self.config.settle_timeout,
            max_failures: self.config.max_failures,
            max_attempts: self.config.max_attempts,
        });

        self.worker_states.clear();
        for i in 0..self.config.num_workers {
            let state = Arc::new(StateCell::new());
            let worker = Worker::new(
                format!("worker-{}", i),
                Arc::clone(&ctx),
                Arc::clone(&state),
                self.shutdown_tx.subscribe(),
            );

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_states.push(state);
            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.set_queue_depth(self.queue.len());
        info!(
            num_workers = self.config.num_workers,
            pending = self.queue.len(),
            "Fetcher pool started"
        );

        Ok(self.sink.clone())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers stop taking new tasks; an attempt in progress is resolved
    /// first. Tasks still queued stay queued and are picked up by a later
    /// `start`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(pending = self.queue.len(), "Initiating fetcher pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Fetcher pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Waits until every submitted task has been published or dead-lettered.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotRunning` if tasks are outstanding but no
    /// workers are running to process them.
    pub async fn join(&self) -> Result<(), PoolError> {
        if !self.is_running() && self.queue.unfinished() > 0 {
            return Err(PoolError::NotRunning);
        }
        self.queue.wait_idle().await;
        Ok(())
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns the number of tasks waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Returns queued and in-flight task counts.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Returns a snapshot of the dead-letter list.
    pub fn dead_letters(&self) -> Vec<DeadLetter<L>> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the current state of every worker, in start order.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.worker_states.iter().map(|state| state.get()).collect()
    }

    /// Returns a handle to the result sink.
    pub fn results(&self) -> ResultSink<V> {
        self.sink.clone()
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }
}
