//! In-memory priority queue of pending fetch tasks.
//!
//! This module provides the queue every worker pulls from:
//!
//! - Non-blocking push from the submitter and from retrying workers
//! - Suspending pop of the most urgent task (lowest priority value)
//! - Lease-based bookkeeping so each dequeued task is marked processed once
//!
//! # Ordering
//!
//! Tasks are ordered by priority, then by insertion sequence. A requeued
//! task is a new insertion and competes purely by its new priority.
//!
//! # Bookkeeping
//!
//! The queue counts unfinished tasks: pushed but not yet marked processed.
//! A [`TaskLease`] marks its task processed when dropped, so the count stays
//! correct on every path out of a worker, including unwinding.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ordered_float::OrderedFloat;
use tokio::sync::Notify;

use super::task::Task;

/// Heap entry: a task plus its ordering key.
struct QueuedTask<L> {
    priority: OrderedFloat<f64>,
    seq: u64,
    task: Task<L>,
}

impl<L> PartialEq for QueuedTask<L> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<L> Eq for QueuedTask<L> {}

impl<L> Ord for QueuedTask<L> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: invert so the lowest priority value,
        // then the earliest insertion, sits on top.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<L> PartialOrd for QueuedTask<L> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct QueueState<L> {
    heap: BinaryHeap<QueuedTask<L>>,
    next_seq: u64,
    unfinished: usize,
}

/// Thread-safe priority queue of pending tasks.
pub struct PendingQueue<L> {
    state: Mutex<QueueState<L>>,
    /// Signalled once per push.
    available: Notify,
    /// Signalled when the unfinished count drops to zero.
    idle: Notify,
}

impl<L> Default for PendingQueue<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> PendingQueue<L> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                unfinished: 0,
            }),
            available: Notify::new(),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<L>> {
        // Critical sections never run user code, so a poisoned lock still
        // holds consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a task. Never blocks.
    pub fn push(&self, task: Task<L>) {
        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.unfinished += 1;
            state.heap.push(QueuedTask {
                priority: OrderedFloat(task.priority),
                seq,
                task,
            });
        }
        self.available.notify_one();
    }

    /// Removes the most urgent task if one is queued.
    pub fn try_pop(&self) -> Option<TaskLease<'_, L>> {
        let entry = self.lock().heap.pop()?;
        Some(TaskLease {
            queue: self,
            task: entry.task,
        })
    }

    /// Removes the most urgent task, waiting until one is available.
    ///
    /// Cancel safe: dropping the future before it completes loses no task.
    pub async fn pop(&self) -> TaskLease<'_, L> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await still wakes this waiter.
            notified.as_mut().enable();

            if let Some(lease) = self.try_pop() {
                return lease;
            }

            notified.await;
        }
    }

    /// Waits until every pushed task has been marked processed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.unfinished() == 0 {
                return;
            }

            notified.await;
        }
    }

    /// Number of tasks waiting in the queue.
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// Returns whether no task is waiting in the queue.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks pushed but not yet marked processed.
    pub fn unfinished(&self) -> usize {
        self.lock().unfinished
    }

    /// Priority of the most urgent waiting task.
    pub fn peek_priority(&self) -> Option<f64> {
        self.lock().heap.peek().map(|entry| entry.priority.into_inner())
    }

    /// Returns queue statistics.
    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let pending = state.heap.len();
        QueueStats {
            pending_tasks: pending,
            in_flight_tasks: state.unfinished.saturating_sub(pending),
        }
    }

    fn task_done(&self) {
        let now_idle = {
            let mut state = self.lock();
            state.unfinished = state.unfinished.saturating_sub(1);
            state.unfinished == 0
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }
}

/// Exclusive claim on a dequeued task.
///
/// Dropping the lease marks the task processed. A retry is pushed through
/// [`TaskLease::requeue`] so the follow-up task is queued before the
/// leased one is marked done.
pub struct TaskLease<'a, L> {
    queue: &'a PendingQueue<L>,
    task: Task<L>,
}

impl<L> TaskLease<'_, L> {
    /// The leased task.
    pub fn task(&self) -> &Task<L> {
        &self.task
    }

    /// Pushes the follow-up task, then marks this one processed.
    pub fn requeue(self, next: Task<L>) {
        self.queue.push(next);
    }
}

impl<L> Drop for TaskLease<'_, L> {
    fn drop(&mut self) {
        self.queue.task_done();
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of tasks waiting to be dequeued.
    pub pending_tasks: usize,
    /// Number of tasks currently leased by workers.
    pub in_flight_tasks: usize,
}

impl QueueStats {
    /// Returns the total number of unfinished tasks.
    pub fn total_tasks(&self) -> usize {
        self.pending_tasks + self.in_flight_tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn push(queue: &PendingQueue<&'static str>, location: &'static str, priority: f64) {
        queue.push(Task::new(location, priority));
    }

    #[test]
    fn test_pops_lowest_priority_first() {
        let queue = PendingQueue::new();
        push(&queue, "c", 0.9);
        push(&queue, "a", 0.40);
        push(&queue, "b", 0.42);

        let order: Vec<_> = std::iter::from_fn(|| queue.try_pop().map(|l| *l.task().location))
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_equal_priorities_keep_insertion_order() {
        let queue = PendingQueue::new();
        push(&queue, "first", 0.5);
        push(&queue, "second", 0.5);
        push(&queue, "third", 0.5);

        let order: Vec<_> = std::iter::from_fn(|| queue.try_pop().map(|l| *l.task().location))
            .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_requeued_task_competes_by_new_priority() {
        let queue = PendingQueue::new();
        push(&queue, "slow", 0.40);
        push(&queue, "fast", 0.42);

        let lease = queue.try_pop().expect("task queued");
        let next = lease.task().retry(0.44);
        lease.requeue(next);

        assert_eq!(queue.peek_priority(), Some(0.42));
        let lease = queue.try_pop().expect("task queued");
        assert_eq!(*lease.task().location, "fast");
    }

    #[test]
    fn test_lease_drop_marks_processed_once() {
        let queue = PendingQueue::new();
        push(&queue, "a", 0.5);
        push(&queue, "b", 0.5);
        assert_eq!(queue.unfinished(), 2);

        let lease = queue.try_pop().expect("task queued");
        assert_eq!(queue.unfinished(), 2);
        assert_eq!(
            queue.stats(),
            QueueStats {
                pending_tasks: 1,
                in_flight_tasks: 1
            }
        );
        drop(lease);
        assert_eq!(queue.unfinished(), 1);

        let lease = queue.try_pop().expect("task queued");
        let next = lease.task().retry(0.55);
        lease.requeue(next);
        assert_eq!(queue.unfinished(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            pending_tasks: 3,
            in_flight_tasks: 2,
        };
        assert_eq!(stats.total_tasks(), 5);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(PendingQueue::new());

        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let lease = queue.pop().await;
                *lease.task().location
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!popper.is_finished());

        push(&queue, "late", 0.5);
        let location = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .expect("pop should complete")
            .expect("task should not panic");
        assert_eq!(location, "late");
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_all_leases_drop() {
        let queue = Arc::new(PendingQueue::new());
        push(&queue, "a", 0.5);

        let lease_holder = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let lease = queue.pop().await;
                tokio::time::sleep(Duration::from_millis(30)).await;
                drop(lease);
            })
        };

        tokio::time::timeout(Duration::from_secs(1), queue.wait_idle())
            .await
            .expect("queue should become idle");
        assert_eq!(queue.unfinished(), 0);
        lease_holder.await.expect("task should not panic");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_poppers_never_duplicate() {
        let queue: Arc<PendingQueue<usize>> = Arc::new(PendingQueue::new());
        let total = 200;

        let mut poppers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            poppers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    let lease = tokio::select! {
                        lease = queue.pop() => lease,
                        _ = tokio::time::sleep(Duration::from_millis(200)) => break,
                    };
                    seen.push(*lease.task().location);
                }
                seen
            }));
        }

        for i in 0..total {
            queue.push(Task::new(i, (i % 7) as f64 + 0.1));
        }

        let mut all = Vec::new();
        for popper in poppers {
            all.extend(popper.await.expect("popper should not panic"));
        }

        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), total);
        assert_eq!(unique.len(), total);
        assert_eq!(queue.unfinished(), 0);
    }
}
