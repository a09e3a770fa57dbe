//! Result sink shared between the pool and its consumers.
//!
//! Workers publish accepted values; callers drain them in completion order.
//! The sink is a cheap cloneable handle, so several fetchers can publish
//! into one sink and several consumers can drain it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{self, Stream};
use tokio::sync::Semaphore;

struct SinkInner<V> {
    values: Mutex<VecDeque<V>>,
    /// One permit per value currently stored.
    ready: Semaphore,
    /// Free slots when the sink is bounded.
    space: Option<Semaphore>,
    capacity: Option<usize>,
}

/// Multi-producer, multi-consumer collection of published values.
pub struct ResultSink<V> {
    inner: Arc<SinkInner<V>>,
}

impl<V> Clone for ResultSink<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for ResultSink<V> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<V> std::fmt::Debug for ResultSink<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink")
            .field("len", &self.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl<V> ResultSink<V> {
    /// Creates a sink whose `publish` never waits.
    pub fn unbounded() -> Self {
        Self::build(None)
    }

    /// Creates a sink holding at most `capacity` undrained values.
    ///
    /// A zero capacity is raised to one.
    pub fn bounded(capacity: usize) -> Self {
        Self::build(Some(capacity.max(1)))
    }

    /// Creates a sink from an optional capacity.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        match capacity {
            Some(capacity) => Self::bounded(capacity),
            None => Self::unbounded(),
        }
    }

    fn build(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                values: Mutex::new(VecDeque::new()),
                ready: Semaphore::new(0),
                space: capacity.map(Semaphore::new),
                capacity,
            }),
        }
    }

    fn values(&self) -> MutexGuard<'_, VecDeque<V>> {
        self.inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes a value visible to consumers.
    ///
    /// Waits only while a bounded sink is full.
    pub async fn publish(&self, value: V) {
        if let Some(space) = &self.inner.space {
            // The semaphore is never closed, so acquire cannot fail.
            if let Ok(permit) = space.acquire().await {
                permit.forget();
            }
        }
        self.values().push_back(value);
        self.inner.ready.add_permits(1);
    }

    /// Takes the oldest published value, waiting until one exists.
    ///
    /// Cancel safe: a value is only removed once the future completes.
    pub async fn recv(&self) -> V {
        loop {
            if let Ok(permit) = self.inner.ready.acquire().await {
                permit.forget();
            }
            if let Some(value) = self.take_one() {
                return value;
            }
        }
    }

    /// Takes the oldest published value if one is available.
    pub fn try_recv(&self) -> Option<V> {
        let permit = self.inner.ready.try_acquire().ok()?;
        permit.forget();
        self.take_one()
    }

    /// Takes every value currently available, oldest first.
    pub fn drain(&self) -> Vec<V> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Streams values as they are published. The stream never ends.
    pub fn stream(&self) -> impl Stream<Item = V> {
        stream::unfold(self.clone(), |sink| async move {
            let value = sink.recv().await;
            Some((value, sink))
        })
    }

    fn take_one(&self) -> Option<V> {
        let value = self.values().pop_front();
        if value.is_some() {
            if let Some(space) = &self.inner.space {
                space.add_permits(1);
            }
        }
        value
    }

    /// Number of undrained values.
    pub fn len(&self) -> usize {
        self.values().len()
    }

    /// Returns whether no value is waiting to be drained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The capacity bound, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_then_recv_in_completion_order() {
        let sink = ResultSink::unbounded();
        sink.publish(3).await;
        sink.publish(1).await;
        sink.publish(2).await;

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.recv().await, 3);
        assert_eq!(sink.drain(), vec![1, 2]);
        assert!(sink.is_empty());
        assert_eq!(sink.try_recv(), None);
    }

    #[tokio::test]
    async fn test_recv_waits_for_publish() {
        let sink = ResultSink::unbounded();
        let publisher = sink.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("late").await;
        });

        let value = tokio::time::timeout(Duration::from_secs(1), sink.recv())
            .await
            .expect("value should arrive");
        assert_eq!(value, "late");
    }

    #[tokio::test]
    async fn test_bounded_publish_waits_for_space() {
        let sink = ResultSink::bounded(1);
        assert_eq!(sink.capacity(), Some(1));
        sink.publish(1).await;

        let blocked = tokio::time::timeout(Duration::from_millis(30), sink.publish(2)).await;
        assert!(blocked.is_err(), "publish should wait while the sink is full");

        assert_eq!(sink.try_recv(), Some(1));
        tokio::time::timeout(Duration::from_secs(1), sink.publish(2))
            .await
            .expect("publish should proceed once drained");
        assert_eq!(sink.drain(), vec![2]);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let sink: ResultSink<u8> = ResultSink::bounded(0);
        assert_eq!(sink.capacity(), Some(1));
        assert_eq!(ResultSink::<u8>::with_capacity(None).capacity(), None);
    }

    #[tokio::test]
    async fn test_stream_yields_published_values() {
        let sink = ResultSink::unbounded();
        for value in [10, 20, 30] {
            sink.publish(value).await;
        }

        let values: Vec<i32> = sink.stream().take(3).collect().await;
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let sink = ResultSink::unbounded();
        let other = sink.clone();
        other.publish(5u8).await;
        assert_eq!(sink.try_recv(), Some(5));
    }
}
