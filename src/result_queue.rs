//! Batched persistence of task results.
//!
//! Workers post the result held by their token; the queue writes results in
//! batches. Each result is written in its own transaction, so one bad result
//! never fails the others of its batch.
//!
//! A result is only written while the queue row still carries the lock handle
//! it was produced under; a terminal result also removes that row. A worker
//! whose lease was taken over in the meantime can therefore neither overwrite
//! the result nor delete the new lease's row. Its request ends as
//! [`batch::Error::Rejected`].

use sqlx::PgPool;

use crate::{
    batch::{
        self, AsyncProcessingRequestBatchProcessor, BatchFlush, BatchMetricIds, FlushError,
        RequestBatch, RequestHandle, RequestStatus,
    },
    metrics::{AppMetric, AppMetricId, AppMetricsProvider},
    options::BatchOptions,
    task::{LockHandleId, QueuedTaskResult, QueuedTaskToken},
};

/// One result to persist.
#[derive(Debug, Clone)]
pub struct ResultWrite {
    /// The result as it should be stored.
    pub result: QueuedTaskResult,

    /// Lease the result was produced under.
    pub lock_handle_id: LockHandleId,
}

/// Flushes result batches.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    pool: PgPool,
}

impl ResultWriter {
    // Returns `false` when the task was leased again since the result was
    // produced; nothing is written in that case.
    async fn write(&self, write: &ResultWrite) -> sqlx::Result<bool> {
        let ResultWrite {
            result,
            lock_handle_id,
        } = write;

        let mut tx = self.pool.begin().await?;

        let leased: Option<LockHandleId> = sqlx::query_scalar(
            r#"
            select task_lock_handle_id
            from stakhanov.task_queue
            where task_id = $1
              and task_lock_handle_id = $2
            for update
            "#,
        )
        .bind(result.id)
        .bind(lock_handle_id)
        .fetch_optional(&mut *tx)
        .await?;

        if leased.is_none() {
            return Ok(false);
        }

        sqlx::query(
            r#"
            update stakhanov.task_result
            set task_status = $2,
                task_last_error = $3,
                task_error_count = $4,
                task_last_error_is_recoverable = $5,
                task_processing_time_milliseconds = $6,
                task_first_processing_attempted_at_ts = $7,
                task_last_processing_attempted_at_ts = $8,
                task_processing_finalized_at_ts = $9
            where task_id = $1
            "#,
        )
        .bind(result.id)
        .bind(result.status)
        .bind(&result.last_error)
        .bind(result.error_count)
        .bind(result.last_error_is_recoverable)
        .bind(result.processing_time_ms)
        .bind(result.first_processing_attempted_at)
        .bind(result.last_processing_attempted_at)
        .bind(result.processing_finalized_at)
        .execute(&mut *tx)
        .await?;

        if result.status.is_terminal() {
            sqlx::query("delete from stakhanov.task_queue where task_id = $1")
                .bind(result.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(true)
    }
}

impl BatchFlush<ResultWrite> for ResultWriter {
    async fn flush(
        &self,
        batch: &RequestBatch<ResultWrite>,
    ) -> Result<Vec<RequestStatus>, FlushError> {
        let mut statuses = Vec::with_capacity(batch.len());

        for write in batch.payloads() {
            let status = match self.write(write).await {
                Ok(true) => RequestStatus::Flushed,
                Ok(false) => {
                    tracing::debug!(
                        task.id = %write.result.id,
                        lock_handle_id = write.lock_handle_id,
                        "Task was leased again, discarding result"
                    );
                    RequestStatus::Rejected(format!(
                        "Lease {} of task {} is no longer held",
                        write.lock_handle_id, write.result.id
                    ))
                }
                Err(err) => {
                    tracing::warn!(%err, task.id = %write.result.id, "Failed to write task result");
                    RequestStatus::Failed(err.into())
                }
            };
            statuses.push(status);
        }

        Ok(statuses)
    }
}

/// Result persistence backed by a batch processor.
pub struct TaskResultQueue {
    processor: AsyncProcessingRequestBatchProcessor<ResultWrite, ResultWriter>,
}

impl TaskResultQueue {
    /// Creates a queue that is not flushing yet.
    pub fn new(pool: PgPool, options: BatchOptions) -> Self {
        Self {
            processor: AsyncProcessingRequestBatchProcessor::new(
                ResultWriter { pool },
                options,
                BatchMetricIds {
                    post_count: Some(AppMetricId::RESULT_QUEUE_RESULT_POST_COUNT),
                    write_count: Some(AppMetricId::RESULT_QUEUE_RESULT_WRITE_COUNT),
                    min_write_duration: Some(
                        AppMetricId::RESULT_QUEUE_MINIMUM_RESULT_WRITE_DURATION,
                    ),
                    max_write_duration: Some(
                        AppMetricId::RESULT_QUEUE_MAXIMUM_RESULT_WRITE_DURATION,
                    ),
                    total_write_duration: Some(
                        AppMetricId::RESULT_QUEUE_TOTAL_RESULT_WRITE_DURATION,
                    ),
                    request_timeout_count: Some(
                        AppMetricId::RESULT_QUEUE_RESULT_WRITE_REQUEST_TIMEOUT_COUNT,
                    ),
                },
            ),
        }
    }

    /// Starts writing results.
    pub fn start_flushing(&self) {
        self.processor.start();
        tracing::info!("Result queue started");
    }

    /// Writes what was posted so far and stops.
    pub async fn stop_flushing(&self) {
        self.processor.stop().await;
        tracing::info!("Result queue stopped");
    }

    /// Returns `true` while results are accepted.
    pub fn is_flushing(&self) -> bool {
        self.processor.is_running()
    }

    /// Posts the token's current result for writing.
    ///
    /// Await the returned handle to learn whether the write went through.
    ///
    /// # Errors
    ///
    /// Returns [`batch::Error::NotRunning`] unless flushing.
    pub fn post_result(&self, token: &QueuedTaskToken) -> batch::Result<RequestHandle> {
        self.processor.post(ResultWrite {
            result: token.last_result().clone(),
            lock_handle_id: token.dequeued_task().lock_handle_id,
        })
    }
}

impl AppMetricsProvider for TaskResultQueue {
    fn collect_metrics(&self) -> Vec<AppMetric> {
        self.processor.collect_metrics()
    }
}
