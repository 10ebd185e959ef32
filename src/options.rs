//! Engine configuration.
//!
//! [`EngineOptions`] is a plain serde struct; every field has a default, so a
//! partial document is enough:
//!
//! ```rust
//! use stakhanov::options::EngineOptions;
//!
//! let options: EngineOptions = serde_json::from_str(
//!     r#"{ "worker_count": 4, "backoff": { "strategy": "fixed", "delay_ms": 1000 } }"#,
//! )?;
//! assert_eq!(options.worker_count, 4);
//! assert_eq!(options.fault_error_threshold_count, 5);
//! # Ok::<(), serde_json::Error>(())
//! ```
//!
//! The same can be built in code:
//!
//! ```rust
//! use stakhanov::{options::EngineOptions, task::BackoffStrategy};
//!
//! let options = EngineOptions::builder()
//!     .worker_count(4)
//!     .backoff(BackoffStrategy::exponential(500, 2.0, 60_000))
//!     .build();
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::task::{BackoffStrategy, Recoverability};

const DEFAULT_CHANNEL: &str = "stakhanov_new_task_posted";

/// Settings shared by the batch-writing components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Requests flushed together.
    pub batch_size: usize,

    /// Total flush attempts per request before it is faulted.
    pub max_fail_count: u32,

    /// How long a poster waits for its request to be flushed.
    pub request_timeout_ms: u64,
}

impl BatchOptions {
    /// How long a poster waits for its request to be flushed.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_fail_count: 3,
            request_timeout_ms: 5_000,
        }
    }
}

/// Settings of the app metrics monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppMetricsOptions {
    /// Whether metrics are written to the store at all.
    pub enabled: bool,

    /// Time between two collections.
    pub collection_interval_ms: u64,
}

impl AppMetricsOptions {
    /// Time between two collections.
    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.collection_interval_ms)
    }
}

impl Default for AppMetricsOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            collection_interval_ms: 10_000,
        }
    }
}

/// Configuration of a [`TaskEngine`](crate::engine::TaskEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Workers draining the buffer. Also the buffer's capacity.
    pub worker_count: usize,

    /// Recoverable failures tolerated before a task is faulted.
    pub fault_error_threshold_count: i32,

    /// Connections kept by the queue consumer.
    pub queue_consumer_connection_pool_size: u32,

    /// Upper bound of one wait for a notification.
    pub wait_notification_timeout_ms: u64,

    /// How long a dequeued task stays leased.
    pub task_lock_duration_ms: i64,

    /// Channel on which new tasks are announced.
    pub new_task_notification_channel: String,

    /// Identifies this process in execution stats and app metrics.
    pub process_id: String,

    /// Delay before a failed task is retried.
    pub backoff: BackoffStrategy,

    /// Which failures may be retried.
    pub recoverability: Recoverability,

    /// Result queue and perf monitor batching.
    pub batch: BatchOptions,

    /// App metrics collection.
    pub app_metrics: AppMetricsOptions,
}

impl EngineOptions {
    /// Create a new builder.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Upper bound of one wait for a notification.
    pub fn wait_notification_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_notification_timeout_ms)
    }

    /// How long a dequeued task stays leased. Negative values mean zero.
    pub fn task_lock_duration(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.task_lock_duration_ms).unwrap_or(0))
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().saturating_sub(1).max(1),
            fault_error_threshold_count: 5,
            queue_consumer_connection_pool_size: 10,
            wait_notification_timeout_ms: 250,
            task_lock_duration_ms: 30 * 60 * 1_000,
            new_task_notification_channel: DEFAULT_CHANNEL.to_string(),
            process_id: Ulid::new().to_string(),
            backoff: BackoffStrategy::default(),
            recoverability: Recoverability::default(),
            batch: BatchOptions::default(),
            app_metrics: AppMetricsOptions::default(),
        }
    }
}

/// Builds [`EngineOptions`], starting from the defaults.
#[derive(Debug, Default)]
pub struct Builder {
    options: EngineOptions,
}

impl Builder {
    /// Sets the number of workers.
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.options.worker_count = worker_count.max(1);
        self
    }

    /// Sets the fault threshold.
    pub fn fault_error_threshold_count(mut self, count: i32) -> Self {
        self.options.fault_error_threshold_count = count;
        self
    }

    /// Sets the consumer's connection pool size.
    pub fn queue_consumer_connection_pool_size(mut self, size: u32) -> Self {
        self.options.queue_consumer_connection_pool_size = size.max(1);
        self
    }

    /// Sets the notification wait timeout.
    pub fn wait_notification_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.wait_notification_timeout_ms = timeout_ms;
        self
    }

    /// Sets the lease duration.
    pub fn task_lock_duration_ms(mut self, duration_ms: i64) -> Self {
        self.options.task_lock_duration_ms = duration_ms;
        self
    }

    /// Sets the notification channel.
    pub fn new_task_notification_channel(mut self, channel: impl Into<String>) -> Self {
        self.options.new_task_notification_channel = channel.into();
        self
    }

    /// Sets the process id.
    pub fn process_id(mut self, process_id: impl Into<String>) -> Self {
        self.options.process_id = process_id.into();
        self
    }

    /// Sets the retry backoff.
    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.options.backoff = backoff;
        self
    }

    /// Sets the recoverability table.
    pub fn recoverability(mut self, recoverability: Recoverability) -> Self {
        self.options.recoverability = recoverability;
        self
    }

    /// Sets batching.
    pub fn batch(mut self, batch: BatchOptions) -> Self {
        self.options.batch = batch;
        self
    }

    /// Sets app metrics collection.
    pub fn app_metrics(mut self, app_metrics: AppMetricsOptions) -> Self {
        self.options.app_metrics = app_metrics;
        self
    }

    /// Returns the configured options.
    pub fn build(self) -> EngineOptions {
        self.options
    }
}
