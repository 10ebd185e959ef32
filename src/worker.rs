//! Workers drain the buffer and execute tasks.
//!
//! A [`WorkerPool`] runs a fixed number of [`Worker`]s. Each worker takes one
//! token at a time from the [`TaskBuffer`], resolves the executor for the
//! task's type, and runs it under the executor's timeout. The outcome is
//! turned into a [`TaskExecutionResult`] and handed to the
//! [`ResultProcessor`], which applies the result state machine, writes the
//! result and reposts the task when it deserves another attempt.
//!
//! Workers never spin: when the buffer is empty they wait for its "task
//! added" signal. Once the buffer is completed and drained, they exit.
//!
//! # Shutdown
//!
//! Stopping the pool cancels the execution token shared by every
//! [`TaskExecutionContext`]. Executors that honour cancellation return
//! [`ExecutionError::cancelled`]; those tasks, and any still sitting in the
//! buffer, are reposted unchanged rather than marked cancelled, so a restart
//! picks them up again.

use std::{sync::Arc, time::Duration as StdDuration};

use tokio::{sync::Mutex, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    batch,
    buffer::TaskBuffer,
    executor::{ErrorKind, ExecutionError, ExecutorRegistry, TaskExecutionContext},
    metrics::{AppMetric, AppMetricId, AppMetricsCollection, AppMetricsProvider},
    perf_monitor::ExecutionPerformanceMonitor,
    producer::{self, TaskQueueProducer},
    result_queue::TaskResultQueue,
    task::{result, QueuedTaskToken, Recoverability, RetryCalculator, TaskExecutionResult},
    timestamp::Timestamp,
};

/// A type alias for worker results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Worker errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The result could not take the transition.
    #[error(transparent)]
    Transition(#[from] result::Error),

    /// Error returned by the result queue or perf monitor.
    #[error(transparent)]
    Batch(#[from] batch::Error),

    /// Error returned when reposting a task.
    #[error(transparent)]
    Producer(#[from] producer::Error),
}

/// How one attempt ended, from the worker's point of view.
#[derive(Debug)]
pub enum Attempt {
    /// The attempt produced a result for the state machine.
    Finished(TaskExecutionResult),

    /// The engine is stopping and the task was not, or not fully, executed.
    Interrupted {
        /// Time spent before the interruption.
        processing_time_ms: i64,
    },
}

/// Applies execution results and persists them.
pub struct ResultProcessor {
    result_queue: Arc<TaskResultQueue>,
    perf_monitor: Arc<ExecutionPerformanceMonitor>,
    producer: TaskQueueProducer,
    report_timeout_ms: u64,
}

impl ResultProcessor {
    /// Creates a processor writing through the given components.
    ///
    /// Execution time reports must be written within `report_timeout_ms`.
    pub fn new(
        result_queue: Arc<TaskResultQueue>,
        perf_monitor: Arc<ExecutionPerformanceMonitor>,
        producer: TaskQueueProducer,
        report_timeout_ms: u64,
    ) -> Self {
        Self {
            result_queue,
            perf_monitor,
            producer,
            report_timeout_ms,
        }
    }

    /// Handles the outcome of one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transition`] when the token's result is already
    /// terminal. Write and repost failures are logged, not returned.
    #[instrument(
        skip_all,
        fields(task.id = %token.dequeued_task().id, task.type = %token.dequeued_task().task_type),
        err
    )]
    pub async fn process(&self, token: QueuedTaskToken, attempt: Attempt) -> Result {
        match attempt {
            Attempt::Interrupted { processing_time_ms } => {
                tracing::debug!("Execution interrupted by shutdown, reposting task");
                self.repost(&token, token.to_repost()).await;
                self.report_execution_time(&token, processing_time_ms);
                Ok(())
            }

            Attempt::Finished(result) => self.process_result(token, &result).await,
        }
    }

    async fn process_result(
        &self,
        mut token: QueuedTaskToken,
        result: &TaskExecutionResult,
    ) -> Result {
        let repost = token.apply(result)?;

        match self.result_queue.post_result(&token) {
            Ok(handle) => match handle.wait().await {
                Ok(_) => {}
                Err(batch::Error::Rejected { reason, .. }) => {
                    // Another lease owns the task now; leave it alone.
                    tracing::warn!(%reason, "Task result discarded");
                    self.report_execution_time(&token, result.processing_time_ms());
                    return Ok(());
                }
                Err(err) => tracing::error!(%err, "Failed to write task result"),
            },
            Err(err) => tracing::error!(%err, "Failed to post task result"),
        }

        if let Some(info) = repost {
            self.repost(&token, info).await;
        }

        self.report_execution_time(&token, result.processing_time_ms());

        Ok(())
    }

    async fn repost(&self, token: &QueuedTaskToken, info: result::QueuedTaskProduceInfo) {
        match self.producer.enqueue(info).await {
            Ok(_) => {}
            Err(err @ producer::Error::LeaseLost { .. }) => {
                tracing::warn!(%err, "Task was leased again, skipping repost");
            }
            Err(err) => {
                // The lease expires eventually and the task becomes eligible again.
                tracing::error!(
                    %err,
                    lock_handle_id = token.dequeued_task().lock_handle_id,
                    "Failed to repost task"
                );
            }
        }
    }

    fn report_execution_time(&self, token: &QueuedTaskToken, processing_time_ms: i64) {
        // The report completes on its own; nobody waits for it.
        if let Err(err) = self.perf_monitor.report_execution_time(
            token.dequeued_task().task_type.clone(),
            processing_time_ms,
            self.report_timeout_ms,
        ) {
            tracing::warn!(%err, "Failed to report execution time");
        }
    }
}

/// State shared by every worker of a pool.
struct Shared {
    registry: ExecutorRegistry,
    buffer: Arc<TaskBuffer>,
    results: ResultProcessor,
    recoverability: Recoverability,
    retry: RetryCalculator,
    fault_error_threshold_count: i32,
    metrics: AppMetricsCollection,
}

/// Configuration of a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    /// Number of workers.
    pub worker_count: usize,

    /// Recoverable failures tolerated before a task is faulted.
    pub fault_error_threshold_count: i32,

    /// Which failures may be retried.
    pub recoverability: Recoverability,

    /// When failed tasks are retried.
    pub retry: RetryCalculator,
}

/// One worker. Runs until the buffer is completed and empty.
pub struct Worker {
    index: usize,
    shared: Arc<Shared>,
    execution_token: CancellationToken,
}

impl Worker {
    /// Takes tokens from the buffer and executes them until the buffer is
    /// completed.
    pub async fn run(self) {
        let mut added = self.shared.buffer.subscribe_added();
        tracing::debug!(worker = self.index, "Worker started");

        loop {
            added.borrow_and_update();

            if let Some(token) = self.shared.buffer.try_get_next_task() {
                self.process_token(token).await;
                continue;
            }

            if self.shared.buffer.is_completed() {
                break;
            }

            self.shared
                .metrics
                .update(AppMetricId::WORKER_BUFFER_WAIT_COUNT, |m| {
                    m.increment();
                });

            if added.changed().await.is_err() {
                // The buffer is gone; nothing more can arrive.
                break;
            }
        }

        tracing::debug!(worker = self.index, "Worker exited");
    }

    async fn process_token(&self, token: QueuedTaskToken) {
        let attempt = self.execute(&token).await;
        self.record(&attempt);

        if let Err(err) = self.shared.results.process(token, attempt).await {
            tracing::error!(%err, "Discarding task token");
        }
    }

    /// Executes the token's task once.
    #[instrument(
        skip_all,
        fields(task.id = %token.dequeued_task().id, task.type = %token.dequeued_task().task_type)
    )]
    async fn execute(&self, token: &QueuedTaskToken) -> Attempt {
        if self.execution_token.is_cancelled() {
            return Attempt::Interrupted {
                processing_time_ms: 0,
            };
        }

        let task = token.dequeued_task();
        let started = Instant::now();

        let Some(executor) = self.shared.registry.resolve(&task.task_type) else {
            let err = ExecutionError::unsupported(format!(
                "No executor is registered for `{}`",
                task.task_type
            ));
            return Attempt::Finished(self.failed(token, err, 0));
        };

        let cx = TaskExecutionContext::new(task.clone(), self.execution_token.child_token());
        let execution = executor.execute(task.payload.clone(), &cx);

        let outcome = match StdDuration::try_from(executor.timeout()) {
            Ok(timeout) => match tokio::time::timeout(timeout, execution).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!("Task execution timed out");
                    Err(ExecutionError::timeout(format!(
                        "Execution exceeded {:#}",
                        executor.timeout()
                    )))
                }
            },
            Err(err) => {
                tracing::warn!(%err, "Executor timeout is not a fixed duration, running without one");
                execution.await
            }
        };

        let processing_time_ms = elapsed_ms(started);

        match outcome {
            Ok(()) => Attempt::Finished(TaskExecutionResult::successful(
                processing_time_ms,
                self.shared.fault_error_threshold_count,
            )),

            Err(err) if err.kind() == ErrorKind::Cancelled && cx.is_cancellation_requested() => {
                Attempt::Interrupted { processing_time_ms }
            }

            Err(err) if err.kind() == ErrorKind::Cancelled => {
                tracing::info!(%err, "Task execution cancelled");
                Attempt::Finished(TaskExecutionResult::cancelled(
                    processing_time_ms,
                    self.shared.fault_error_threshold_count,
                ))
            }

            Err(err) => {
                tracing::error!(%err, "Task execution encountered an error");
                Attempt::Finished(self.failed(token, err, processing_time_ms))
            }
        }
    }

    fn failed(
        &self,
        token: &QueuedTaskToken,
        err: ExecutionError,
        processing_time_ms: i64,
    ) -> TaskExecutionResult {
        let is_recoverable = self
            .shared
            .recoverability
            .is_recoverable(token.dequeued_task(), &err);
        let retry_at = self
            .shared
            .retry
            .compute_retry_at(token.last_result().error_count, Timestamp::now());

        TaskExecutionResult::failed(
            err.into(),
            is_recoverable,
            processing_time_ms,
            retry_at,
            self.shared.fault_error_threshold_count,
        )
    }

    fn record(&self, attempt: &Attempt) {
        let metrics = &self.shared.metrics;
        metrics.update(AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT, |m| {
            m.increment();
        });

        let (outcome, processing_time_ms) = match attempt {
            Attempt::Interrupted { processing_time_ms } => (
                AppMetricId::WORKER_PROCESSING_CANCELLED_PAYLOAD_COUNT,
                *processing_time_ms,
            ),
            Attempt::Finished(result) if result.executed_successfully() => (
                AppMetricId::WORKER_SUCCESSFUL_PROCESSED_PAYLOAD_COUNT,
                result.processing_time_ms(),
            ),
            Attempt::Finished(result) if result.execution_cancelled() => (
                AppMetricId::WORKER_PROCESSING_CANCELLED_PAYLOAD_COUNT,
                result.processing_time_ms(),
            ),
            Attempt::Finished(result) => (
                AppMetricId::WORKER_FAILED_PROCESSED_PAYLOAD_COUNT,
                result.processing_time_ms(),
            ),
        };

        metrics.update(outcome, |m| {
            m.increment();
        });
        metrics.update(AppMetricId::WORKER_TOTAL_PROCESSING_TIME, |m| {
            m.add(processing_time_ms);
        });
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

struct Running {
    execution_token: CancellationToken,
    workers: JoinSet<()>,
}

/// A fixed number of workers draining one buffer.
pub struct WorkerPool {
    shared: Arc<Shared>,
    worker_count: usize,
    running: Mutex<Option<Running>>,
}

impl WorkerPool {
    /// Creates a stopped pool.
    pub fn new(
        registry: ExecutorRegistry,
        buffer: Arc<TaskBuffer>,
        results: ResultProcessor,
        options: WorkerPoolOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                buffer,
                results,
                recoverability: options.recoverability,
                retry: options.retry,
                fault_error_threshold_count: options.fault_error_threshold_count,
                metrics: AppMetricsCollection::new(&[
                    AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT,
                    AppMetricId::WORKER_BUFFER_WAIT_COUNT,
                    AppMetricId::WORKER_TOTAL_PROCESSING_TIME,
                    AppMetricId::WORKER_SUCCESSFUL_PROCESSED_PAYLOAD_COUNT,
                    AppMetricId::WORKER_FAILED_PROCESSED_PAYLOAD_COUNT,
                    AppMetricId::WORKER_PROCESSING_CANCELLED_PAYLOAD_COUNT,
                ]),
            }),
            worker_count: options.worker_count.max(1),
            running: Mutex::new(None),
        }
    }

    /// Spawns the workers.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Worker pool already started");
            return;
        }

        let execution_token = CancellationToken::new();
        let mut workers = JoinSet::new();
        for index in 0..self.worker_count {
            let worker = Worker {
                index,
                shared: self.shared.clone(),
                execution_token: execution_token.clone(),
            };
            workers.spawn(worker.run());
        }

        *running = Some(Running {
            execution_token,
            workers,
        });
        tracing::info!(workers = self.worker_count, "Worker pool started");
    }

    /// Cancels running executions without waiting for the workers.
    pub async fn cancel_executions(&self) {
        if let Some(running) = self.running.lock().await.as_ref() {
            running.execution_token.cancel();
        }
    }

    /// Cancels executions and waits for every worker to exit.
    ///
    /// Workers only exit once the buffer is completed, so the poller must be
    /// stopped first.
    pub async fn stop(&self) {
        let Some(Running {
            execution_token,
            mut workers,
        }) = self.running.lock().await.take()
        else {
            tracing::debug!("Worker pool already stopped");
            return;
        };

        execution_token.cancel();
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(%err, "Worker did not exit cleanly");
            }
        }

        tracing::info!("Worker pool stopped");
    }

    /// Returns `true` while workers run.
    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

impl AppMetricsProvider for WorkerPool {
    fn collect_metrics(&self) -> Vec<AppMetric> {
        self.shared.metrics.collect()
    }
}
