//! Read-only views of the queue.
//!
//! Nothing here takes a lease or mutates a row; these queries are meant for
//! dashboards and operators.

use sqlx::PgPool;
use tracing::instrument;

use crate::{
    consumer::terminal_codes,
    task::{QueuedTask, Status},
};

/// A type alias for queue inspection results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Queue inspection errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Number of task results in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskQueueMetrics {
    /// Posted and never attempted.
    pub total_unprocessed: i64,
    /// Currently leased.
    pub total_processing: i64,
    /// Failed and waiting for another attempt.
    pub total_errored: i64,
    /// Past the fault threshold, waiting for the last attempt.
    pub total_faulted: i64,
    /// Failed for good.
    pub total_fataled: i64,
    /// Executed successfully.
    pub total_processed: i64,
    /// Cancelled.
    pub total_cancelled: i64,
}

impl TaskQueueMetrics {
    /// The count for one status.
    pub fn count(&self, status: Status) -> i64 {
        match status {
            Status::Unprocessed => self.total_unprocessed,
            Status::Processing => self.total_processing,
            Status::Error => self.total_errored,
            Status::Faulted => self.total_faulted,
            Status::Fatal => self.total_fataled,
            Status::Processed => self.total_processed,
            Status::Cancelled => self.total_cancelled,
        }
    }

    /// Tasks that may still be dequeued.
    pub fn total_pending(&self) -> i64 {
        Status::RESUMABLE.iter().map(|&status| self.count(status)).sum()
    }

    fn count_mut(&mut self, status: Status) -> &mut i64 {
        match status {
            Status::Unprocessed => &mut self.total_unprocessed,
            Status::Processing => &mut self.total_processing,
            Status::Error => &mut self.total_errored,
            Status::Faulted => &mut self.total_faulted,
            Status::Fatal => &mut self.total_fataled,
            Status::Processed => &mut self.total_processed,
            Status::Cancelled => &mut self.total_cancelled,
        }
    }
}

impl FromIterator<(Status, i64)> for TaskQueueMetrics {
    fn from_iter<I: IntoIterator<Item = (Status, i64)>>(iter: I) -> Self {
        let mut metrics = Self::default();
        for (status, count) in iter {
            *metrics.count_mut(status) += count;
        }
        metrics
    }
}

/// Inspects the queue tables.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pool: PgPool,
}

impl QueueInfo {
    /// Creates an inspector over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Counts task results by status.
    #[instrument(skip(self), err)]
    pub async fn compute_metrics(&self) -> Result<TaskQueueMetrics> {
        let rows: Vec<(Status, i64)> = sqlx::query_as(
            r#"
            select task_status, count(*)
            from stakhanov.task_result
            group by task_status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Returns the task the next dequeue for `task_types` would lease.
    ///
    /// The task is not locked, so a concurrent dequeue may take it first.
    #[instrument(skip(self), err)]
    pub async fn peek(&self, task_types: &[String]) -> Result<Option<QueuedTask>> {
        let task = sqlx::query_as(
            r#"
            select q.*
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
            "#,
        )
        .bind(task_types)
        .bind(terminal_codes())
        .fetch_optional(&self.pool)
        .await?;

        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::{tests::options, QueueConsumer},
        producer::TaskQueueProducer,
        task::QueuedTaskProduceInfo,
    };

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn metrics_sum_pending_statuses() {
        let metrics: TaskQueueMetrics = [
            (Status::Unprocessed, 3),
            (Status::Processing, 1),
            (Status::Error, 2),
            (Status::Processed, 10),
            (Status::Fatal, 4),
        ]
        .into_iter()
        .collect();

        assert_eq!(metrics.total_pending(), 6);
        assert_eq!(metrics.count(Status::Processed), 10);
        assert_eq!(metrics.count(Status::Cancelled), 0);
    }

    #[sqlx::test]
    async fn counts_results_by_status(pool: PgPool) -> TestResult {
        let options = options();
        let producer = TaskQueueProducer::new(pool.clone(), options.channel.clone());
        let consumer = QueueConsumer::new(&pool, options);
        let info = QueueInfo::new(pool);

        assert_eq!(info.compute_metrics().await?, TaskQueueMetrics::default());

        for _ in 0..3 {
            producer
                .enqueue(QueuedTaskProduceInfo::new("a", "tests", None, 0))
                .await?;
        }
        consumer.dequeue(&[]).await?.expect("task is eligible");

        let metrics = info.compute_metrics().await?;
        assert_eq!(metrics.total_unprocessed, 2);
        assert_eq!(metrics.total_processing, 1);
        assert_eq!(metrics.total_pending(), 3);

        Ok(())
    }

    #[sqlx::test]
    async fn peek_does_not_lease(pool: PgPool) -> TestResult {
        let options = options();
        let producer = TaskQueueProducer::new(pool.clone(), options.channel.clone());
        let consumer = QueueConsumer::new(&pool, options);
        let info = QueueInfo::new(pool);

        assert!(info.peek(&[]).await?.is_none());

        producer
            .enqueue(QueuedTaskProduceInfo::new("a", "tests", None, 5))
            .await?;
        let urgent = producer
            .enqueue(QueuedTaskProduceInfo::new("b", "tests", None, 1))
            .await?;

        let peeked = info.peek(&[]).await?.expect("task is eligible");
        assert_eq!(peeked.id, urgent.id);
        assert_eq!(info.peek(&[]).await?.map(|task| task.id), Some(urgent.id));

        let only_a = info.peek(&["a".to_string()]).await?.expect("task is eligible");
        assert_eq!(only_a.task_type, "a");

        let token = consumer.dequeue(&[]).await?.expect("task is eligible");
        assert_eq!(token.dequeued_task().id, urgent.id);

        Ok(())
    }
}
