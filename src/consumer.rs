//! Dequeuing tasks.
//!
//! [`QueueConsumer::dequeue`] leases the next eligible task in a single
//! transaction. Eligible tasks:
//!
//! - have one of the requested types, or any type if none are requested,
//! - are not leased, i.e. their `locked_until` lies in the past,
//! - have no terminal result.
//!
//! Among those the one with the lowest priority value wins, then the one whose
//! lease expired first, then the lowest lock handle. The winner is locked with
//! `for update skip locked`, so concurrent consumers never receive the same
//! lease. It gets a fresh lock handle and a lease of the configured duration.
//! Its result moves to [`Status::Processing`].
//!
//! The consumer also owns the [`NotificationListener`]. Any listener activity
//! is republished as a [`ClearForDequeueReason`]: a hint that a dequeue may
//! now find something.

use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::watch;
use tracing::instrument;

use crate::{
    listener::{ListenerEvent, NotificationHandler, NotificationListener},
    metrics::{AppMetric, AppMetricId, AppMetricsCollection, AppMetricsProvider},
    task::{QueuedTask, QueuedTaskResult, QueuedTaskToken, Status},
    timestamp::Timestamp,
};

/// A type alias for consumer results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Consumer errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Why a dequeue attempt may now be worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearForDequeueReason {
    /// A new task was announced.
    NewTaskNotified,

    /// A wait cycle ended without a notification.
    ListenerTimedOut,

    /// The listener recovered from a lost connection.
    ListenerReconnected,
}

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Channel on which new tasks are announced.
    pub channel: String,

    /// Upper bound of one wait for a notification.
    pub wait_notification_timeout: Duration,

    /// How long a dequeued task stays leased.
    pub lock_duration: Duration,

    /// Connections kept by the consumer.
    pub connection_pool_size: u32,
}

struct ClearForDequeue {
    sender: watch::Sender<Option<ClearForDequeueReason>>,
}

impl NotificationHandler for ClearForDequeue {
    fn handle(&self, event: ListenerEvent) {
        let reason = match event {
            ListenerEvent::Connected => return,
            ListenerEvent::NewTaskPosted => ClearForDequeueReason::NewTaskNotified,
            ListenerEvent::TimedOut => ClearForDequeueReason::ListenerTimedOut,
            ListenerEvent::ConnectionRestored => ClearForDequeueReason::ListenerReconnected,
        };
        self.sender.send_replace(Some(reason));
    }
}

#[derive(sqlx::FromRow)]
struct ProcessingResult {
    #[sqlx(flatten)]
    result: QueuedTaskResult,
    previous_status: Status,
}

/// Leases tasks and reports when it may be worth trying.
pub struct QueueConsumer {
    pool: PgPool,
    lock_duration: Duration,
    listener: NotificationListener,
    clear_for_dequeue: watch::Sender<Option<ClearForDequeueReason>>,
    metrics: AppMetricsCollection,
}

impl QueueConsumer {
    /// Creates a consumer with its own pool, connecting lazily with the
    /// settings of `pool`.
    pub fn new(pool: &PgPool, options: ConsumerOptions) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(options.connection_pool_size.max(1))
            .connect_lazy_with(pool.connect_options().as_ref().clone());

        let (clear_for_dequeue, _) = watch::channel(None);
        let listener = NotificationListener::new(
            pool.clone(),
            options.channel,
            options.wait_notification_timeout,
            Arc::new(ClearForDequeue {
                sender: clear_for_dequeue.clone(),
            }),
        );

        Self {
            pool,
            lock_duration: options.lock_duration,
            listener,
            clear_for_dequeue,
            metrics: AppMetricsCollection::with_initial(&[
                (AppMetricId::QUEUE_CONSUMER_DEQUEUE_COUNT, 0),
                (AppMetricId::QUEUE_CONSUMER_TOTAL_DEQUEUE_DURATION, 0),
                (AppMetricId::QUEUE_CONSUMER_MINIMUM_DEQUEUE_DURATION, i64::MAX),
                (AppMetricId::QUEUE_CONSUMER_MAXIMUM_DEQUEUE_DURATION, 0),
            ]),
        }
    }

    /// Watches "clear for dequeue" signals.
    ///
    /// The value is the reason of the latest signal.
    pub fn subscribe_clear_for_dequeue(&self) -> watch::Receiver<Option<ClearForDequeueReason>> {
        self.clear_for_dequeue.subscribe()
    }

    /// Starts the inner listener.
    pub async fn start_receiving_new_task_updates(&self) {
        self.listener.start().await;
    }

    /// Stops the inner listener.
    pub async fn stop_receiving_new_task_updates(&self) {
        self.listener.stop().await;
    }

    /// Leases the next eligible task of one of `task_types`.
    ///
    /// An empty `task_types` accepts any type. Returns `None` when nothing is
    /// eligible.
    #[instrument(
        skip(self, task_types),
        fields(task.id = tracing::field::Empty, task.types = ?task_types),
        err
    )]
    pub async fn dequeue(&self, task_types: &[String]) -> Result<Option<QueuedTaskToken>> {
        let started = tokio::time::Instant::now();
        let dequeued = self.lease(task_types).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        self.metrics.update(AppMetricId::QUEUE_CONSUMER_DEQUEUE_COUNT, |m| {
            m.increment();
        });
        self.metrics.update(AppMetricId::QUEUE_CONSUMER_TOTAL_DEQUEUE_DURATION, |m| {
            m.add(elapsed_ms);
        });
        self.metrics.update(AppMetricId::QUEUE_CONSUMER_MINIMUM_DEQUEUE_DURATION, |m| {
            m.min(elapsed_ms);
        });
        self.metrics.update(AppMetricId::QUEUE_CONSUMER_MAXIMUM_DEQUEUE_DURATION, |m| {
            m.max(elapsed_ms);
        });

        let token = dequeued?;
        match &token {
            Some(token) => {
                let id = token.dequeued_task().id;
                tracing::Span::current().record("task.id", id.as_hyphenated().to_string());
            }
            None => tracing::debug!("No eligible task"),
        }

        Ok(token)
    }

    async fn lease(&self, task_types: &[String]) -> Result<Option<QueuedTaskToken>> {
        // Transaction scoped to leasing the task and marking its result as
        // processing.
        let mut tx = self.pool.begin().await?;

        let task: Option<QueuedTask> = sqlx::query_as(
            r#"
            with next_task as (
                select q.task_id
                from stakhanov.task_queue q
                where (q.task_type = any($1::text[]) or cardinality($1::text[]) = 0)
                  and q.task_locked_until_ts < now()
                  and not exists (
                      select 1
                      from stakhanov.task_result r
                      where r.task_id = q.task_id
                        and r.task_status = any($2)
                  )
                order by
                  q.task_priority asc,
                  q.task_locked_until_ts asc,
                  q.task_lock_handle_id asc
                limit 1
                for update skip locked
            )
            update stakhanov.task_queue t
            set task_lock_handle_id = nextval('stakhanov.task_lock_handle_id_seq'),
                task_locked_until_ts = now() + $3
            from next_task
            where t.task_id = next_task.task_id
            returning t.*
            "#,
        )
        .bind(task_types)
        .bind(terminal_codes())
        .bind(self.lock_duration)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(task) = task else {
            tx.commit().await?;
            return Ok(None);
        };

        let processing: Option<ProcessingResult> = sqlx::query_as(
            r#"
            with previous as (
                select task_id, task_status
                from stakhanov.task_result
                where task_id = $1
                for update
            )
            update stakhanov.task_result r
            set task_status = $2
            from previous
            where r.task_id = previous.task_id
            returning r.*, previous.task_status as previous_status
            "#,
        )
        .bind(task.id)
        .bind(Status::Processing)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        let (result, previous_status) = match processing {
            Some(ProcessingResult {
                result,
                previous_status,
            }) => (result, previous_status),
            None => {
                tracing::warn!(task.id = %task.id, "Leased task has no result row");
                let mut result = QueuedTaskResult::from_task(&task);
                result.status = Status::Processing;
                (result, Status::Unprocessed)
            }
        };

        Ok(Some(QueuedTaskToken::new(
            task,
            result,
            previous_status,
            Timestamp::now(),
        )))
    }
}

pub(crate) fn terminal_codes() -> Vec<i32> {
    Status::TERMINAL.iter().map(|status| status.code()).collect()
}

impl AppMetricsProvider for QueueConsumer {
    fn collect_metrics(&self) -> Vec<AppMetric> {
        let mut metrics = self.metrics.collect();
        // No dequeue yet means no minimum.
        for metric in &metrics {
            if metric.id() == AppMetricId::QUEUE_CONSUMER_MINIMUM_DEQUEUE_DURATION
                && metric.value() == i64::MAX
            {
                metric.update(0);
            }
        }
        metrics.extend(self.listener.collect_metrics());
        metrics
    }
}
