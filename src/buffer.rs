//! Bounded holding area between the poller and the workers.
//!
//! The buffer never blocks: [`TaskBuffer::try_add_new_task`] hands the token
//! back when the buffer is full and [`TaskBuffer::try_get_next_task`] returns
//! `None` when it is empty. Waiting is done by subscribing to the buffer's
//! signals, which carry no data. They only say "something was added" or
//! "something was retrieved".

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use tokio::sync::watch;

use crate::{
    metrics::{AppMetric, AppMetricId, AppMetricsCollection, AppMetricsProvider},
    task::QueuedTaskToken,
};

/// A signal observed through [`watch::Receiver::changed`].
pub type Signal = watch::Receiver<u64>;

/// A fixed-capacity, thread-safe buffer of dequeued task tokens.
#[derive(Debug)]
pub struct TaskBuffer {
    capacity: usize,
    tokens: Mutex<VecDeque<QueuedTaskToken>>,
    adding_completed: AtomicBool,
    added: watch::Sender<u64>,
    retrieved: watch::Sender<u64>,
    metrics: AppMetricsCollection,
}

impl TaskBuffer {
    /// Creates a buffer holding at most `capacity` tokens (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (added, _) = watch::channel(0);
        let (retrieved, _) = watch::channel(0);

        Self {
            capacity,
            tokens: Mutex::new(VecDeque::with_capacity(capacity)),
            adding_completed: AtomicBool::new(false),
            added,
            retrieved,
            metrics: AppMetricsCollection::with_initial(&[
                (AppMetricId::BUFFER_MAX_COUNT, 0),
                (AppMetricId::BUFFER_MIN_COUNT, capacity as i64),
                (AppMetricId::BUFFER_TIMES_FILLED, 0),
                (AppMetricId::BUFFER_TIMES_EMPTIED, 0),
            ]),
        }
    }

    fn tokens(&self) -> MutexGuard<'_, VecDeque<QueuedTaskToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a token unless the buffer is full or adding has been completed.
    ///
    /// A refused token is handed back so that the caller can repost it.
    pub fn try_add_new_task(&self, token: QueuedTaskToken) -> Result<(), QueuedTaskToken> {
        let count = {
            let mut tokens = self.tokens();
            if self.is_adding_completed() || tokens.len() >= self.capacity {
                return Err(token);
            }
            tokens.push_back(token);
            tokens.len()
        };

        self.metrics.update(AppMetricId::BUFFER_MAX_COUNT, |m| {
            m.max(count as i64);
        });
        if count == self.capacity {
            self.metrics.update(AppMetricId::BUFFER_TIMES_FILLED, |m| {
                m.increment();
            });
        }

        self.added.send_modify(|n| *n = n.wrapping_add(1));

        Ok(())
    }

    /// Takes the oldest token, if any.
    pub fn try_get_next_task(&self) -> Option<QueuedTaskToken> {
        let (token, count) = {
            let mut tokens = self.tokens();
            let token = tokens.pop_front()?;
            (token, tokens.len())
        };

        self.metrics.update(AppMetricId::BUFFER_MIN_COUNT, |m| {
            m.min(count as i64);
        });
        if count == 0 {
            self.metrics.update(AppMetricId::BUFFER_TIMES_EMPTIED, |m| {
                m.increment();
            });
        }

        self.retrieved.send_modify(|n| *n = n.wrapping_add(1));

        Some(token)
    }

    /// Marks that no more tokens will be added.
    ///
    /// Subscribers to the "added" signal are woken so they can observe
    /// completion.
    pub fn complete_adding(&self) {
        // Taking the lock orders completion against in-flight adds.
        let _tokens = self.tokens();
        if !self.adding_completed.swap(true, Ordering::AcqRel) {
            self.added.send_modify(|n| *n = n.wrapping_add(1));
        }
    }

    /// Returns `true` once [`complete_adding`](Self::complete_adding) was
    /// called.
    pub fn is_adding_completed(&self) -> bool {
        self.adding_completed.load(Ordering::Acquire)
    }

    /// Returns `true` when adding is complete and the buffer is drained.
    pub fn is_completed(&self) -> bool {
        let tokens = self.tokens();
        self.is_adding_completed() && tokens.is_empty()
    }

    /// Number of buffered tokens.
    pub fn count(&self) -> usize {
        self.tokens().len()
    }

    /// Maximum number of buffered tokens.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` when no more tokens fit.
    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    /// Subscribes to the "task added" signal.
    ///
    /// The signal also fires once when adding is completed.
    pub fn subscribe_added(&self) -> Signal {
        self.added.subscribe()
    }

    /// Subscribes to the "task retrieved" signal.
    pub fn subscribe_retrieved(&self) -> Signal {
        self.retrieved.subscribe()
    }
}

impl AppMetricsProvider for TaskBuffer {
    fn collect_metrics(&self) -> Vec<AppMetric> {
        self.metrics.collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use uuid::Uuid;

    use super::*;
    use crate::task::tests::token_with_id;

    fn token() -> QueuedTaskToken {
        token_with_id(Uuid::new_v4())
    }

    #[test]
    fn count_never_exceeds_capacity() {
        let buffer = TaskBuffer::new(3);

        // A fixed interleaving of adds and gets, weighted towards adds.
        let ops = [1, 1, 1, 1, 0, 1, 1, 0, 0, 0, 0, 1, 1, 1, 1, 1];
        for op in ops {
            let before = buffer.count();
            if op == 1 {
                let added = buffer.try_add_new_task(token()).is_ok();
                if before == buffer.capacity() {
                    assert!(!added);
                    assert_eq!(buffer.count(), before);
                } else {
                    assert!(added);
                }
            } else {
                let _ = buffer.try_get_next_task();
            }
            assert!(buffer.count() <= buffer.capacity());
        }

        assert!(buffer.is_full());
        assert_eq!(buffer.collect_metrics().len(), 4);
    }

    #[test]
    fn refused_token_is_handed_back() {
        let buffer = TaskBuffer::new(1);
        let id = Uuid::new_v4();

        assert!(buffer.try_add_new_task(token()).is_ok());
        let refused = buffer
            .try_add_new_task(token_with_id(id))
            .expect_err("buffer is full");

        assert_eq!(refused.dequeued_task().id, id);
        assert_eq!(buffer.count(), 1);
    }

    #[test]
    fn completion_invariant() {
        let buffer = TaskBuffer::new(2);
        assert!(buffer.try_get_next_task().is_none());

        buffer.try_add_new_task(token()).expect("space available");
        buffer.complete_adding();

        assert!(buffer.try_add_new_task(token()).is_err());
        assert!(buffer.is_adding_completed());
        assert!(!buffer.is_completed());

        assert!(buffer.try_get_next_task().is_some());
        assert!(buffer.is_completed());
        assert_eq!(buffer.count(), 0);
    }

    #[test]
    fn occupancy_metrics() {
        let buffer = TaskBuffer::new(2);
        buffer.try_add_new_task(token()).expect("space available");
        buffer.try_add_new_task(token()).expect("space available");
        buffer.try_get_next_task();
        buffer.try_get_next_task();

        let value = |id| buffer.query_metric(id).map(|m| m.value());
        assert_eq!(value(AppMetricId::BUFFER_MAX_COUNT), Some(2));
        assert_eq!(value(AppMetricId::BUFFER_MIN_COUNT), Some(0));
        assert_eq!(value(AppMetricId::BUFFER_TIMES_FILLED), Some(1));
        assert_eq!(value(AppMetricId::BUFFER_TIMES_EMPTIED), Some(1));
    }

    #[tokio::test]
    async fn signals_fire_on_add_retrieve_and_completion() {
        let buffer = TaskBuffer::new(2);
        let mut added = buffer.subscribe_added();
        let mut retrieved = buffer.subscribe_retrieved();

        buffer.try_add_new_task(token()).expect("space available");
        added.changed().await.expect("sender alive");

        buffer.try_get_next_task();
        retrieved.changed().await.expect("sender alive");

        buffer.complete_adding();
        added.changed().await.expect("sender alive");
        assert!(buffer.is_completed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_and_consumers() {
        let buffer = Arc::new(TaskBuffer::new(4));
        let per_producer = 50;

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = buffer.clone();
                tokio::spawn(async move {
                    let mut pending = per_producer;
                    let mut retrieved = buffer.subscribe_retrieved();
                    while pending > 0 {
                        retrieved.borrow_and_update();
                        match buffer.try_add_new_task(token()) {
                            Ok(()) => pending -= 1,
                            Err(_) => {
                                let _ = tokio::time::timeout(
                                    Duration::from_millis(10),
                                    retrieved.changed(),
                                )
                                .await;
                            }
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let buffer = buffer.clone();
                tokio::spawn(async move {
                    let mut added = buffer.subscribe_added();
                    let mut taken = 0usize;
                    loop {
                        added.borrow_and_update();
                        if buffer.try_get_next_task().is_some() {
                            taken += 1;
                            continue;
                        }
                        if buffer.is_completed() {
                            return taken;
                        }
                        if added.changed().await.is_err() {
                            return taken;
                        }
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.await.expect("producer should not panic");
        }
        buffer.complete_adding();

        let mut total = 0;
        for consumer in consumers {
            total += consumer.await.expect("consumer should not panic");
        }

        assert_eq!(total, 4 * per_producer);
        assert!(buffer.is_completed());
    }
}
