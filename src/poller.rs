//! Moves tasks from the store into the buffer.
//!
//! The poller runs one background loop. Each iteration:
//!
//! 1. waits until the buffer has space,
//! 2. leases one task through the consumer,
//! 3. adds the task to the buffer or, if nothing was eligible, waits until
//!    the consumer signals that a dequeue may be worthwhile.
//!
//! A task the buffer refuses is reposted through the producer right away, so
//! a lease never ends up in limbo. Between signals the loop sleeps; an empty
//! queue costs one dequeue per listener wait cycle and nothing more.

use std::sync::Arc;

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::TaskBuffer,
    consumer::QueueConsumer,
    metrics::{AppMetric, AppMetricId, AppMetricsCollection, AppMetricsProvider},
    producer::TaskQueueProducer,
    task::QueuedTaskToken,
};

pub use self::sync_policy::PollerSynchronizationPolicy;

pub mod sync_policy;

struct Shared {
    consumer: Arc<QueueConsumer>,
    producer: TaskQueueProducer,
    buffer: Arc<TaskBuffer>,
    policy: PollerSynchronizationPolicy,
    metrics: AppMetricsCollection,
}

struct Running {
    shutdown_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background loop feeding the buffer.
pub struct TaskPoller {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl TaskPoller {
    /// Creates a stopped poller.
    pub fn new(
        consumer: Arc<QueueConsumer>,
        producer: TaskQueueProducer,
        buffer: Arc<TaskBuffer>,
    ) -> Self {
        let policy =
            PollerSynchronizationPolicy::new(buffer.clone(), consumer.subscribe_clear_for_dequeue());

        Self {
            shared: Arc::new(Shared {
                consumer,
                producer,
                buffer,
                policy,
                metrics: AppMetricsCollection::new(&[
                    AppMetricId::POLLER_DEQUEUE_COUNT,
                    AppMetricId::POLLER_BUFFER_REFUSED_COUNT,
                    AppMetricId::POLLER_REPOST_COUNT,
                ]),
            }),
            running: Mutex::new(None),
        }
    }

    /// Starts receiving notifications and polling for `task_types`.
    ///
    /// An empty `task_types` polls for every type.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, task_types: Vec<String>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Poller already started");
            return;
        }

        self.shared.policy.notify_poller_started();
        self.shared.consumer.start_receiving_new_task_updates().await;

        let shutdown_token = CancellationToken::new();
        let handle = tokio::spawn(poll(
            self.shared.clone(),
            task_types,
            shutdown_token.clone(),
        ));

        *running = Some(Running {
            shutdown_token,
            handle,
        });
        tracing::info!("Poller started");
    }

    /// Stops polling and completes the buffer.
    ///
    /// Waits for the loop to exit. Tokens already buffered stay in the buffer
    /// for the workers to drain.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        let Some(Running {
            shutdown_token,
            handle,
        }) = self.running.lock().await.take()
        else {
            tracing::debug!("Poller already stopped");
            return;
        };

        self.shared.policy.notify_poller_stop_requested();
        shutdown_token.cancel();
        self.shared.consumer.stop_receiving_new_task_updates().await;

        if let Err(err) = handle.await {
            tracing::error!(%err, "Poller loop did not exit cleanly");
        }

        self.shared.buffer.complete_adding();
        tracing::info!("Poller stopped");
    }

    /// Returns `true` while the loop runs.
    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

impl AppMetricsProvider for TaskPoller {
    fn collect_metrics(&self) -> Vec<AppMetric> {
        let mut metrics = self.shared.metrics.collect();
        metrics.extend(self.shared.policy.collect_metrics());
        metrics
    }
}

async fn poll(shared: Arc<Shared>, task_types: Vec<String>, shutdown_token: CancellationToken) {
    loop {
        if shutdown_token.is_cancelled() {
            break;
        }

        if shared
            .policy
            .wait_for_clear_to_add_to_buffer(&shutdown_token)
            .await
            .is_err()
        {
            break;
        }
        if shutdown_token.is_cancelled() {
            break;
        }

        shared.policy.prepare_to_dequeue();
        let dequeued = shared.consumer.dequeue(&task_types).await;
        shared.metrics.update(AppMetricId::POLLER_DEQUEUE_COUNT, |m| {
            m.increment();
        });

        match dequeued {
            Ok(Some(token)) => shared.buffer_or_repost(token).await,

            Ok(None) => {
                if shared
                    .policy
                    .wait_for_clear_to_dequeue(&shutdown_token)
                    .await
                    .is_err()
                {
                    break;
                }
            }

            Err(err) => {
                // The next listener cycle will prompt another attempt.
                tracing::error!(%err, "Failed to dequeue task");
                if shared
                    .policy
                    .wait_for_clear_to_dequeue(&shutdown_token)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    tracing::debug!("Poller loop exited");
}

impl Shared {
    async fn buffer_or_repost(&self, token: QueuedTaskToken) {
        let Err(token) = self.buffer.try_add_new_task(token) else {
            return;
        };

        self.metrics.update(AppMetricId::POLLER_BUFFER_REFUSED_COUNT, |m| {
            m.increment();
        });

        let task_id = token.dequeued_task().id;
        tracing::debug!(task.id = %task_id, "Buffer refused task, reposting");

        match self.producer.enqueue(token.to_repost()).await {
            Ok(_) => {
                self.metrics.update(AppMetricId::POLLER_REPOST_COUNT, |m| {
                    m.increment();
                });
            }
            Err(err) => {
                // The lease still expires, after which the task is eligible again.
                tracing::error!(%err, task.id = %task_id, "Failed to repost refused task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sqlx::PgPool;
    use uuid::Uuid;

    use super::*;
    use crate::{
        consumer::{tests::options, ConsumerOptions},
        task::{tests::token_with_id, QueuedTaskProduceInfo, Status},
    };

    fn parts(
        pool: &PgPool,
        options: ConsumerOptions,
        capacity: usize,
    ) -> (Arc<QueueConsumer>, TaskQueueProducer, Arc<TaskBuffer>) {
        let producer = TaskQueueProducer::new(pool.clone(), options.channel.clone());
        (
            Arc::new(QueueConsumer::new(pool, options)),
            producer,
            Arc::new(TaskBuffer::new(capacity)),
        )
    }

    async fn drain(buffer: &TaskBuffer, expected: usize) -> Vec<QueuedTaskToken> {
        let mut added = buffer.subscribe_added();
        let mut tokens = Vec::new();
        while tokens.len() < expected {
            added.borrow_and_update();
            while let Some(token) = buffer.try_get_next_task() {
                tokens.push(token);
            }
            if tokens.len() < expected
                && tokio::time::timeout(Duration::from_secs(5), added.changed())
                    .await
                    .is_err()
            {
                break;
            }
        }
        tokens
    }

    #[sqlx::test]
    async fn moves_tasks_into_buffer(pool: PgPool) -> sqlx::Result<(), crate::producer::Error> {
        let (consumer, producer, buffer) = parts(&pool, options(), 2);
        for _ in 0..5 {
            producer
                .enqueue(QueuedTaskProduceInfo::new("a", "tests", None, 0))
                .await?;
        }

        let poller = TaskPoller::new(consumer, producer, buffer.clone());
        poller.start(vec!["a".to_string()]).await;

        let tokens = drain(&buffer, 5).await;
        assert_eq!(tokens.len(), 5);
        assert!(tokens
            .iter()
            .all(|token| token.last_result().status == Status::Processing));

        poller.stop().await;
        assert!(buffer.is_adding_completed());
        assert!(buffer.is_completed());

        Ok(())
    }

    #[sqlx::test]
    async fn idle_queue_does_not_spin(pool: PgPool) -> sqlx::Result<(), crate::producer::Error> {
        let options = ConsumerOptions {
            wait_notification_timeout: Duration::from_millis(50),
            ..options()
        };
        let (consumer, producer, buffer) = parts(&pool, options, 1);

        let poller = TaskPoller::new(consumer, producer, buffer);
        poller.start(Vec::new()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        poller.stop().await;

        let dequeues = poller
            .query_metric(AppMetricId::POLLER_DEQUEUE_COUNT)
            .map(|m| m.value())
            .unwrap_or_default();
        // Roughly one attempt per listener wait cycle.
        assert!(dequeues >= 1);
        assert!(dequeues < 50, "{dequeues} dequeues while idle");

        Ok(())
    }

    #[sqlx::test]
    async fn refused_tasks_are_reposted(pool: PgPool) -> sqlx::Result<(), crate::producer::Error> {
        let (consumer, producer, buffer) = parts(&pool, options(), 1);
        let posted = producer
            .enqueue(QueuedTaskProduceInfo::new("a", "tests", None, 0))
            .await?;

        buffer
            .try_add_new_task(token_with_id(Uuid::new_v4()))
            .expect("space available");

        let poller = TaskPoller::new(consumer.clone(), producer, buffer.clone());
        let token = consumer
            .dequeue(&[])
            .await
            .map_err(|crate::consumer::Error::Database(err)| err)?
            .expect("task is eligible");
        poller.shared.buffer_or_repost(token).await;

        let value = |id| poller.query_metric(id).map(|m| m.value());
        assert_eq!(value(AppMetricId::POLLER_BUFFER_REFUSED_COUNT), Some(1));
        assert_eq!(value(AppMetricId::POLLER_REPOST_COUNT), Some(1));

        // The task is back, eligible and as it was before the dequeue.
        let token = consumer
            .dequeue(&[])
            .await
            .map_err(|crate::consumer::Error::Database(err)| err)?
            .expect("reposted task is eligible");
        assert_eq!(token.dequeued_task().id, posted.id);
        assert_eq!(token.to_repost().status, Status::Unprocessed);

        Ok(())
    }

    #[sqlx::test]
    async fn start_and_stop_are_idempotent(pool: PgPool) -> sqlx::Result<(), crate::producer::Error> {
        let (consumer, producer, buffer) = parts(&pool, options(), 1);
        let poller = TaskPoller::new(consumer, producer, buffer.clone());

        poller.stop().await;
        assert!(!buffer.is_adding_completed());

        poller.start(Vec::new()).await;
        poller.start(Vec::new()).await;
        assert!(poller.is_started().await);

        poller.stop().await;
        poller.stop().await;
        assert!(!poller.is_started().await);
        assert!(buffer.is_adding_completed());

        Ok(())
    }
}
