//! The engine wires every component together.
//!
//! [`TaskEngine`] is the entrypoint for processing tasks. It owns:
//!
//! - the [`QueueConsumer`], on its own connection pool,
//! - the [`TaskBuffer`], holding one token per worker,
//! - the [`TaskPoller`] feeding the buffer,
//! - the [`WorkerPool`] draining it,
//! - the [`TaskResultQueue`] and [`ExecutionPerformanceMonitor`] writing
//!   results and execution times in batches,
//! - and, when enabled, the [`AppMetricsMonitor`].
//!
//! # Example
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use sqlx::PgPool;
//! use stakhanov::{
//!     ExecutionError, ExecutorRegistry, TaskEngine, TaskExecutionContext, TaskExecutor,
//!     TaskPayload,
//! };
//!
//! #[derive(Deserialize, Serialize)]
//! struct ResizeImage {
//!     path: String,
//! }
//!
//! impl TaskPayload for ResizeImage {
//!     const TYPE: &'static str = "resize-image";
//! }
//!
//! struct Resizer;
//!
//! impl TaskExecutor for Resizer {
//!     type Payload = ResizeImage;
//!
//!     async fn execute(
//!         &self,
//!         payload: Self::Payload,
//!         _cx: &TaskExecutionContext,
//!     ) -> Result<(), ExecutionError> {
//!         println!("Resizing {}", payload.path);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::connect(&std::env::var("DATABASE_URL")?).await?;
//!     stakhanov::MIGRATOR.run(&pool).await?;
//!
//!     let mut registry = ExecutorRegistry::new();
//!     registry.register(Resizer);
//!
//!     let engine = TaskEngine::builder().pool(pool).registry(registry).build()?;
//!
//!     engine
//!         .producer()
//!         .enqueue_payload(&ResizeImage { path: "cat.png".into() }, "docs", 0)
//!         .await?;
//!
//!     engine.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//!     Ok(())
//! }
//! ```

use std::{collections::HashMap, future::Future, sync::Arc};

use builder_states::{Initial, PoolSet, RegistrySet};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::{
    buffer::TaskBuffer,
    consumer::{ConsumerOptions, QueueConsumer},
    executor::ExecutorRegistry,
    metrics::{monitor::AppMetricsMonitor, AppMetric, AppMetricsCollection, AppMetricsProvider},
    options::EngineOptions,
    perf_monitor::{ExecutionPerformanceMonitor, TaskExecutionStats},
    poller::TaskPoller,
    producer::TaskQueueProducer,
    queue_info::QueueInfo,
    result_queue::TaskResultQueue,
    task::RetryCalculator,
    worker::{ResultProcessor, WorkerPool, WorkerPoolOptions},
};

/// A type alias for engine results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The registry has no executors, so no task could ever succeed.
    #[error("No executors are registered")]
    NoExecutors,

    /// The engine was stopped and cannot be started again.
    #[error("The engine was stopped; build a new one to start again")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Stopped,
}

/// Processes tasks with the registered executors.
pub struct TaskEngine {
    options: EngineOptions,
    payload_types: Vec<String>,
    pool: PgPool,
    producer: TaskQueueProducer,
    consumer: Arc<QueueConsumer>,
    buffer: Arc<TaskBuffer>,
    poller: Arc<TaskPoller>,
    result_queue: Arc<TaskResultQueue>,
    perf_monitor: Arc<ExecutionPerformanceMonitor>,
    workers: Arc<WorkerPool>,
    metrics_monitor: Option<AppMetricsMonitor>,
    state: Mutex<State>,
}

impl TaskEngine {
    /// Creates a builder for a new engine.
    pub fn builder() -> Builder<Initial> {
        Builder::new()
    }

    fn new(pool: PgPool, registry: ExecutorRegistry, options: EngineOptions) -> Self {
        let payload_types = registry.payload_types();

        let producer =
            TaskQueueProducer::new(pool.clone(), options.new_task_notification_channel.clone());
        let consumer = Arc::new(QueueConsumer::new(
            &pool,
            ConsumerOptions {
                channel: options.new_task_notification_channel.clone(),
                wait_notification_timeout: options.wait_notification_timeout(),
                lock_duration: options.task_lock_duration(),
                connection_pool_size: options.queue_consumer_connection_pool_size,
            },
        ));
        let buffer = Arc::new(TaskBuffer::new(options.worker_count));
        let poller = Arc::new(TaskPoller::new(
            consumer.clone(),
            producer.clone(),
            buffer.clone(),
        ));

        let result_queue = Arc::new(TaskResultQueue::new(pool.clone(), options.batch));
        let perf_monitor = Arc::new(ExecutionPerformanceMonitor::new(
            pool.clone(),
            options.process_id.clone(),
            options.batch,
        ));

        let workers = Arc::new(WorkerPool::new(
            registry,
            buffer.clone(),
            ResultProcessor::new(
                result_queue.clone(),
                perf_monitor.clone(),
                producer.clone(),
                options.batch.request_timeout_ms,
            ),
            WorkerPoolOptions {
                worker_count: options.worker_count,
                fault_error_threshold_count: options.fault_error_threshold_count,
                recoverability: options.recoverability.clone(),
                retry: RetryCalculator::new(options.backoff),
            },
        ));

        let metrics_monitor = options.app_metrics.enabled.then(|| {
            AppMetricsMonitor::new(
                pool.clone(),
                options.process_id.clone(),
                options.app_metrics.collection_interval(),
                vec![
                    buffer.clone() as Arc<dyn AppMetricsProvider>,
                    consumer.clone() as Arc<dyn AppMetricsProvider>,
                    poller.clone() as Arc<dyn AppMetricsProvider>,
                    workers.clone() as Arc<dyn AppMetricsProvider>,
                    result_queue.clone() as Arc<dyn AppMetricsProvider>,
                    perf_monitor.clone() as Arc<dyn AppMetricsProvider>,
                ],
            )
        });

        Self {
            options,
            payload_types,
            pool,
            producer,
            consumer,
            buffer,
            poller,
            result_queue,
            perf_monitor,
            workers,
            metrics_monitor,
            state: Mutex::new(State::Created),
        }
    }

    /// The options the engine was built with.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// The producer for posting tasks.
    pub fn producer(&self) -> &TaskQueueProducer {
        &self.producer
    }

    /// Read-only views of the queue.
    pub fn queue_info(&self) -> QueueInfo {
        QueueInfo::new(self.pool.clone())
    }

    /// The buffer between the poller and the workers.
    pub fn buffer(&self) -> &TaskBuffer {
        &self.buffer
    }

    /// Statistics of every execution time written by this process.
    pub fn execution_stats(&self) -> HashMap<String, TaskExecutionStats> {
        self.perf_monitor.stats()
    }

    /// Starts processing.
    ///
    /// Starting a started engine does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] once the engine was stopped.
    #[tracing::instrument(skip(self), fields(process_id = %self.options.process_id), err)]
    pub async fn start(&self) -> Result {
        let mut state = self.state.lock().await;
        match *state {
            State::Started => {
                tracing::debug!("Engine already started");
                return Ok(());
            }
            State::Stopped => return Err(Error::Stopped),
            State::Created => {}
        }

        self.result_queue.start_flushing();
        self.perf_monitor.start_flushing();
        self.poller.start(self.payload_types.clone()).await;
        self.workers.start().await;
        if let Some(monitor) = &self.metrics_monitor {
            monitor.start().await;
        }

        *state = State::Started;
        tracing::info!(
            payload_types = ?self.payload_types,
            workers = self.options.worker_count,
            "Engine started"
        );

        Ok(())
    }

    /// Stops processing.
    ///
    /// Tasks being executed are cancelled and reposted, as are tasks still
    /// in the buffer. Results posted before the stop are written before this
    /// returns. Stopping an engine that is not running does nothing.
    #[tracing::instrument(skip(self), fields(process_id = %self.options.process_id))]
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if *state != State::Started {
            tracing::debug!("Engine already stopped");
            return;
        }

        self.poller.stop().await;
        self.workers.cancel_executions().await;
        self.workers.stop().await;
        if let Some(monitor) = &self.metrics_monitor {
            monitor.stop().await;
        }
        self.perf_monitor.stop_flushing().await;
        self.result_queue.stop_flushing().await;

        *state = State::Stopped;
        tracing::info!("Engine stopped");
    }

    /// Returns `true` while the engine runs.
    pub async fn is_started(&self) -> bool {
        *self.state.lock().await == State::Started
    }

    /// Starts the engine, waits for `shutdown` and stops it.
    pub async fn run_until<F>(&self, shutdown: F) -> Result
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await;
        Ok(())
    }

    /// A joined snapshot of every component's metrics.
    pub fn metrics(&self) -> Vec<AppMetric> {
        let providers: [&dyn AppMetricsProvider; 6] = [
            self.buffer.as_ref(),
            self.consumer.as_ref(),
            self.poller.as_ref(),
            self.workers.as_ref(),
            self.result_queue.as_ref(),
            self.perf_monitor.as_ref(),
        ];
        AppMetricsCollection::join_collect(&providers)
    }
}

impl AppMetricsProvider for TaskEngine {
    fn collect_metrics(&self) -> Vec<AppMetric> {
        self.metrics()
    }
}

mod builder_states {
    use sqlx::PgPool;

    use crate::executor::ExecutorRegistry;

    #[derive(Debug)]
    pub struct Initial;

    #[derive(Debug)]
    pub struct PoolSet {
        pub pool: PgPool,
    }

    #[derive(Debug)]
    pub struct RegistrySet {
        pub pool: PgPool,
        pub registry: ExecutorRegistry,
    }
}

/// Builds a [`TaskEngine`].
#[derive(Debug)]
pub struct Builder<S> {
    state: S,
    options: EngineOptions,
}

impl Default for Builder<Initial> {
    fn default() -> Self {
        Builder::new()
    }
}

impl<S> Builder<S> {
    /// Sets the engine options. Defaults to [`EngineOptions::default`].
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }
}

impl Builder<Initial> {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self {
            state: Initial,
            options: EngineOptions::default(),
        }
    }

    /// Sets the database connection pool.
    pub fn pool(self, pool: PgPool) -> Builder<PoolSet> {
        Builder {
            state: PoolSet { pool },
            options: self.options,
        }
    }
}

impl Builder<PoolSet> {
    /// Sets the executors tasks are dispatched to.
    pub fn registry(self, registry: ExecutorRegistry) -> Builder<RegistrySet> {
        Builder {
            state: RegistrySet {
                pool: self.state.pool,
                registry,
            },
            options: self.options,
        }
    }
}

impl Builder<RegistrySet> {
    /// Builds the engine. Nothing runs until [`TaskEngine::start`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoExecutors`] when the registry is empty.
    pub fn build(self) -> Result<TaskEngine> {
        let RegistrySet { pool, registry } = self.state;
        if registry.is_empty() {
            return Err(Error::NoExecutors);
        }

        Ok(TaskEngine::new(pool, registry, self.options))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        executor::{ExecutionError, TaskExecutionContext, TaskExecutor, TaskPayload},
        metrics::AppMetricId,
        options::AppMetricsOptions,
        task::{BackoffStrategy, Status},
    };

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    #[derive(Deserialize, Serialize)]
    struct Tally {
        amount: usize,
    }

    impl TaskPayload for Tally {
        const TYPE: &'static str = "tally";
    }

    #[derive(Clone, Default)]
    struct Tallier {
        total: Arc<AtomicUsize>,
    }

    impl TaskExecutor for Tallier {
        type Payload = Tally;

        async fn execute(
            &self,
            payload: Self::Payload,
            _cx: &TaskExecutionContext,
        ) -> std::result::Result<(), ExecutionError> {
            if payload.amount == 0 {
                return Err(ExecutionError::invalid_input("Nothing to tally"));
            }
            self.total.fetch_add(payload.amount, Ordering::SeqCst);
            Ok(())
        }
    }

    fn options() -> EngineOptions {
        EngineOptions::builder()
            .worker_count(2)
            .wait_notification_timeout_ms(50)
            .new_task_notification_channel("stakhanov_engine_test")
            .backoff(BackoffStrategy::Fixed { delay_ms: 0 })
            .app_metrics(AppMetricsOptions {
                enabled: true,
                collection_interval_ms: 100,
            })
            .build()
    }

    #[sqlx::test]
    async fn requires_executors(pool: PgPool) {
        let built = TaskEngine::builder()
            .pool(pool)
            .registry(ExecutorRegistry::new())
            .build();
        assert!(matches!(built, Err(Error::NoExecutors)));
    }

    #[sqlx::test]
    async fn processes_posted_tasks(pool: PgPool) -> TestResult {
        let tallier = Tallier::default();
        let mut registry = ExecutorRegistry::new();
        registry.register(tallier.clone());

        let engine = TaskEngine::builder()
            .pool(pool.clone())
            .registry(registry)
            .options(options())
            .build()?;

        engine.start().await?;
        engine.start().await?;

        for amount in 1..=5 {
            engine
                .producer()
                .enqueue_payload(&Tally { amount }, "tests", 0)
                .await?;
        }
        let rejected = engine
            .producer()
            .enqueue_payload(&Tally { amount: 0 }, "tests", 0)
            .await?;

        let info = engine.queue_info();
        let mut metrics = info.compute_metrics().await?;
        for _ in 0..100 {
            if metrics.total_processed == 5 && metrics.total_fataled == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            metrics = info.compute_metrics().await?;
        }

        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_started().await);

        assert_eq!(tallier.total.load(Ordering::SeqCst), 15);
        assert_eq!(metrics.total_processed, 5);
        assert_eq!(metrics.count(Status::Fatal), 1);
        assert!(info.peek(&[]).await?.is_none());

        let status: Status =
            sqlx::query_scalar("select task_status from stakhanov.task_result where task_id = $1")
                .bind(rejected.id)
                .fetch_one(&pool)
                .await?;
        assert_eq!(status, Status::Fatal);

        let processed = engine
            .query_metric(AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT)
            .map(|m| m.value());
        assert_eq!(processed, Some(6));
        assert_eq!(
            engine.execution_stats().get("tally").map(|s| s.execution_cycles),
            Some(6)
        );

        // The final collection on stop wrote the same value.
        let stored: i64 = sqlx::query_scalar(
            r#"
            select metric_value
            from stakhanov.app_metrics
            where metric_id = $1
              and metric_owner_process_id = $2
            "#,
        )
        .bind(AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT.value_id())
        .bind(&engine.options().process_id)
        .fetch_one(&pool)
        .await?;
        assert_eq!(stored, 6);

        Ok(())
    }

    #[sqlx::test]
    async fn stopped_engine_cannot_restart(pool: PgPool) -> TestResult {
        let mut registry = ExecutorRegistry::new();
        registry.register(Tallier::default());

        let engine = TaskEngine::builder()
            .pool(pool)
            .registry(registry)
            .options(options())
            .build()?;

        engine.stop().await;
        engine.start().await?;
        assert!(engine.is_started().await);
        engine.stop().await;

        assert!(matches!(engine.start().await, Err(Error::Stopped)));
        assert!(engine.buffer().is_completed());

        Ok(())
    }
}
