//! A single supervised fetch attempt.
//!
//! The fetch collaborator is opaque: it may block indefinitely and offers no
//! timeout of its own. Each attempt therefore runs on the blocking thread
//! pool, where the supervising worker can put a deadline on it and deliver a
//! cancellation signal when the deadline elapses.
//!
//! # Cancellation
//!
//! A blocking call cannot be torn down from outside. The signal is observed
//! at three places:
//!
//! 1. Before the fetch starts: the attempt is skipped.
//! 2. Inside a cooperative fetch, which returns [`FetchInterrupted`].
//! 3. At the [`YieldPoint`] right after the fetch returns and before the
//!    outcome is committed.
//!
//! A signal that lands after the commit is ignored and the value is reported
//! as a success. Which side of the commit a near-simultaneous signal lands on
//! depends on scheduling.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tracing::warn;

use crate::error::FetchInterrupted;

use super::policy::{Checkpoint, YieldPoint};
use super::task::FetchOutcome;

/// The caller-supplied fetch function.
///
/// Any `Fn(&L) -> anyhow::Result<V>` closure implements this trait and
/// ignores the signal. Implement it directly to cooperate with cancellation.
pub trait Fetch<L, V>: Send + Sync + 'static {
    /// Fetches a value from `location`.
    ///
    /// A cooperative implementation polls `cancel` and returns
    /// [`FetchInterrupted`] once it is set.
    fn fetch(&self, location: &L, cancel: &CancelSignal) -> anyhow::Result<V>;
}

impl<L, V, F> Fetch<L, V> for F
where
    F: Fn(&L) -> anyhow::Result<V> + Send + Sync + 'static,
{
    fn fetch(&self, location: &L, _cancel: &CancelSignal) -> anyhow::Result<V> {
        self(location)
    }
}

/// Cancellation signal shared between a supervisor and its execution.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Creates an unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers the signal. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns whether the signal was delivered.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(FetchInterrupted)` once the signal was delivered.
    ///
    /// Lets cooperative fetch code bail out with `?`.
    pub fn check(&self) -> Result<(), FetchInterrupted> {
        if self.is_cancelled() {
            Err(FetchInterrupted)
        } else {
            Ok(())
        }
    }
}

/// How an execution ended from the supervisor's point of view.
#[derive(Debug)]
pub enum Settled<V> {
    /// The execution produced its outcome.
    Finished(FetchOutcome<V>),
    /// The settle wait ran out and the execution was left running.
    Abandoned,
}

/// One in-flight fetch attempt.
pub struct Execution<V> {
    handle: JoinHandle<FetchOutcome<V>>,
    cancel: CancelSignal,
}

impl<V: Send + 'static> Execution<V> {
    /// Starts fetching `location` on the blocking thread pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<L>(
        fetch: Arc<dyn Fetch<L, V>>,
        location: Arc<L>,
        yield_point: Arc<dyn YieldPoint>,
    ) -> Self
    where
        L: Send + Sync + 'static,
    {
        let cancel = CancelSignal::new();
        let signal = cancel.clone();

        let handle = tokio::task::spawn_blocking(move || {
            if signal.is_cancelled() {
                return FetchOutcome::Interrupted;
            }

            match fetch.fetch(&location, &signal) {
                Ok(value) => match yield_point.pass(&signal) {
                    Checkpoint::Continue => FetchOutcome::Success(value),
                    Checkpoint::Cancelled => FetchOutcome::Interrupted,
                },
                Err(e) if e.downcast_ref::<FetchInterrupted>().is_some() => {
                    FetchOutcome::Interrupted
                }
                Err(e) => FetchOutcome::Failure(e),
            }
        });

        Self { handle, cancel }
    }
}

impl<V> Execution<V> {
    /// Delivers the cancellation signal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns whether the signal was delivered.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns whether the execution already produced its outcome.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the outcome.
    ///
    /// Cancel safe: the execution keeps running if this future is dropped,
    /// and a later call still receives the outcome.
    pub async fn wait(&mut self) -> FetchOutcome<V> {
        match (&mut self.handle).await {
            Ok(outcome) => outcome,
            Err(e) => outcome_from_join_error(e),
        }
    }

    /// Waits for the outcome after cancellation, optionally bounded.
    ///
    /// With no bound this waits as long as the fetch takes. With a bound,
    /// an execution still running afterwards is detached and reported as
    /// [`Settled::Abandoned`]; its eventual outcome is discarded.
    pub async fn settle(mut self, within: Option<Duration>) -> Settled<V> {
        match within {
            None => Settled::Finished(self.wait().await),
            Some(limit) => match tokio::time::timeout(limit, self.wait()).await {
                Ok(outcome) => Settled::Finished(outcome),
                Err(_) => {
                    warn!(
                        settle_timeout_ms = limit.as_millis() as u64,
                        "Execution did not settle after cancellation, abandoning it"
                    );
                    Settled::Abandoned
                }
            },
        }
    }
}

/// Extracts the message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

fn outcome_from_join_error<V>(error: JoinError) -> FetchOutcome<V> {
    if error.is_panic() {
        let payload = error.into_panic();
        FetchOutcome::Failure(anyhow::anyhow!(
            "fetch panicked: {}",
            panic_message(payload.as_ref())
        ))
    } else {
        FetchOutcome::Failure(anyhow::anyhow!("fetch task was cancelled: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::policy::{NoYield, SchedulerYield};
    use std::time::Instant;

    fn spawn_with<F>(fetch: F, yield_point: Arc<dyn YieldPoint>) -> Execution<u32>
    where
        F: Fn(&u32) -> anyhow::Result<u32> + Send + Sync + 'static,
    {
        Execution::spawn(Arc::new(fetch), Arc::new(7u32), yield_point)
    }

    #[test]
    fn test_cancel_signal() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.check().is_ok());

        let shared = signal.clone();
        shared.cancel();
        assert!(signal.is_cancelled());
        assert_eq!(signal.check(), Err(FetchInterrupted));
    }

    #[tokio::test]
    async fn test_success_outcome() {
        let mut execution = spawn_with(|loc| Ok(loc * 2), Arc::new(SchedulerYield));
        match execution.wait().await {
            FetchOutcome::Success(value) => assert_eq!(value, 14),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_becomes_failure() {
        let mut execution = spawn_with(
            |_| Err(anyhow::anyhow!("connection refused")),
            Arc::new(SchedulerYield),
        );
        match execution.wait().await {
            FetchOutcome::Failure(e) => assert!(e.to_string().contains("refused")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let mut execution = spawn_with(|_| panic!("kaboom"), Arc::new(SchedulerYield));
        match execution.wait().await {
            FetchOutcome::Failure(e) => assert!(e.to_string().contains("kaboom")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_interrupted_error_becomes_interrupted() {
        let mut execution = spawn_with(|_| Err(FetchInterrupted.into()), Arc::new(SchedulerYield));
        assert!(matches!(execution.wait().await, FetchOutcome::Interrupted));
    }

    #[tokio::test]
    async fn test_cancellation_observed_at_yield_point() {
        let execution = spawn_with(
            |loc| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(*loc)
            },
            Arc::new(SchedulerYield),
        );
        execution.cancel();
        assert!(execution.is_cancelled());

        match execution.settle(None).await {
            Settled::Finished(FetchOutcome::Interrupted) => {}
            other => panic!("expected interrupted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_late_cancellation_without_yield_is_success() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let execution = spawn_with(
            move |loc| {
                flag.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                Ok(*loc)
            },
            Arc::new(NoYield),
        );
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        execution.cancel();

        match execution.settle(None).await {
            Settled::Finished(FetchOutcome::Success(7)) => {}
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cooperative_fetch_stops_early() {
        struct Patient;

        impl Fetch<u32, u32> for Patient {
            fn fetch(&self, location: &u32, cancel: &CancelSignal) -> anyhow::Result<u32> {
                for _ in 0..500 {
                    cancel.check()?;
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(*location)
            }
        }

        let started = Instant::now();
        let execution: Execution<u32> =
            Execution::spawn(Arc::new(Patient), Arc::new(1u32), Arc::new(SchedulerYield));
        tokio::time::sleep(Duration::from_millis(30)).await;
        execution.cancel();

        match execution.settle(None).await {
            Settled::Finished(FetchOutcome::Interrupted) => {}
            other => panic!("expected interrupted, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_bounded_settle_abandons_hung_fetch() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let execution = spawn_with(
            move |loc| {
                flag.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(400));
                Ok(*loc)
            },
            Arc::new(SchedulerYield),
        );
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        execution.cancel();

        let settled = execution.settle(Some(Duration::from_millis(20))).await;
        assert!(matches!(settled, Settled::Abandoned));
    }
}
