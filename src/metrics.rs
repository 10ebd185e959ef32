//! Named counters and gauges exposed by the processing components.
//!
//! Metrics are for observability only and never feed back into control flow.
//! Every component that keeps metrics implements [`AppMetricsProvider`], and
//! [`monitor::AppMetricsMonitor`] periodically persists a joined snapshot of
//! all providers.

use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicI64, Ordering},
};

pub mod monitor;

/// Errors raised when combining metrics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two metrics with different ids were joined.
    #[error("Cannot join metric {0} with metric {1}.")]
    MismatchedIds(AppMetricId, AppMetricId),
}

/// Identifies a metric and the category it is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppMetricId {
    value_id: &'static str,
    value_category: &'static str,
}

macro_rules! built_in_metric_ids {
    ($($(#[$doc:meta])* $name:ident => ($id:literal, $category:literal),)+) => {
        impl AppMetricId {
            $(
                $(#[$doc])*
                pub const $name: AppMetricId = AppMetricId::new($id, $category);
            )+

            /// All built-in metric ids.
            pub const BUILT_IN: &'static [AppMetricId] = &[$(AppMetricId::$name),+];
        }
    };
}

built_in_metric_ids! {
    /// Notifications received by the listener.
    LISTENER_TASK_NOTIFICATION_COUNT => ("listener@task-notification-count", "task-queue-notification-listener"),
    /// Times the listener lost and re-established its connection.
    LISTENER_RECONNECT_COUNT => ("listener@reconnect-count", "task-queue-notification-listener"),
    /// Wait cycles that ended without a notification.
    LISTENER_NOTIFICATION_WAIT_TIMEOUT_COUNT => ("listener@notification-wait-timeout-count", "task-queue-notification-listener"),
    /// Tasks dequeued by the poller.
    POLLER_DEQUEUE_COUNT => ("poller@dequeue-count", "task-poller"),
    /// Times the poller waited for a clear-for-dequeue signal.
    POLLER_WAIT_FOR_DEQUEUE_COUNT => ("poller@wait-dequeue-count", "task-poller"),
    /// Times the poller waited for buffer space.
    POLLER_WAIT_FOR_BUFFER_SPACE_COUNT => ("poller@wait-buffer-space-count", "task-poller"),
    /// Dequeued tasks the buffer refused.
    POLLER_BUFFER_REFUSED_COUNT => ("poller@buffer-refused-count", "task-poller"),
    /// Refused or abandoned tasks handed back to the producer.
    POLLER_REPOST_COUNT => ("poller@repost-count", "task-poller"),
    /// Payloads processed by workers.
    WORKER_PROCESSED_PAYLOAD_COUNT => ("worker@processed-payload-count", "task-worker"),
    /// Times a worker waited for the buffer.
    WORKER_BUFFER_WAIT_COUNT => ("worker@buffer-wait-count", "task-worker"),
    /// Milliseconds spent executing payloads.
    WORKER_TOTAL_PROCESSING_TIME => ("worker@total-processing-time", "task-worker"),
    /// Payloads whose execution succeeded.
    WORKER_SUCCESSFUL_PROCESSED_PAYLOAD_COUNT => ("worker@successful-processed-payload-count", "task-worker"),
    /// Payloads whose execution failed.
    WORKER_FAILED_PROCESSED_PAYLOAD_COUNT => ("worker@failed-processed-payload-count", "task-worker"),
    /// Payloads whose execution was cancelled.
    WORKER_PROCESSING_CANCELLED_PAYLOAD_COUNT => ("worker@processing-cancelled-payload-count", "task-worker"),
    /// Dequeue calls that returned a task.
    QUEUE_CONSUMER_DEQUEUE_COUNT => ("queue-consumer@dequeue-count", "task-queue-consumer"),
    /// Milliseconds spent in dequeue calls.
    QUEUE_CONSUMER_TOTAL_DEQUEUE_DURATION => ("queue-consumer@total-dequeue-duration", "task-queue-consumer"),
    /// Fastest dequeue call, in milliseconds.
    QUEUE_CONSUMER_MINIMUM_DEQUEUE_DURATION => ("queue-consumer@minimum-dequeue-duration", "task-queue-consumer"),
    /// Slowest dequeue call, in milliseconds.
    QUEUE_CONSUMER_MAXIMUM_DEQUEUE_DURATION => ("queue-consumer@maximum-dequeue-duration", "task-queue-consumer"),
    /// Results posted for writing.
    RESULT_QUEUE_RESULT_POST_COUNT => ("result-queue@result-post-count", "task-result-queue"),
    /// Results written to the store.
    RESULT_QUEUE_RESULT_WRITE_COUNT => ("result-queue@result-writes-count", "task-result-queue"),
    /// Slowest result batch write, in milliseconds.
    RESULT_QUEUE_MAXIMUM_RESULT_WRITE_DURATION => ("result-queue@maximum-result-write-duration", "task-result-queue"),
    /// Fastest result batch write, in milliseconds.
    RESULT_QUEUE_MINIMUM_RESULT_WRITE_DURATION => ("result-queue@minimum-result-write-duration", "task-result-queue"),
    /// Milliseconds spent writing result batches.
    RESULT_QUEUE_TOTAL_RESULT_WRITE_DURATION => ("result-queue@total-result-write-duration", "task-result-queue"),
    /// Result write requests that timed out.
    RESULT_QUEUE_RESULT_WRITE_REQUEST_TIMEOUT_COUNT => ("result-queue@result-write-rq-timeout-count", "task-result-queue"),
    /// Highest observed buffer depth.
    BUFFER_MAX_COUNT => ("task-buffer@max-count", "task-buffer"),
    /// Lowest observed buffer depth.
    BUFFER_MIN_COUNT => ("task-buffer@min-count", "task-buffer"),
    /// Times the buffer became full.
    BUFFER_TIMES_FILLED => ("task-buffer@times-filled", "task-buffer"),
    /// Times the buffer became empty.
    BUFFER_TIMES_EMPTIED => ("task-buffer@times-emptied", "task-buffer"),
    /// Execution time samples posted.
    PERF_MON_REPORT_POST_COUNT => ("perf-mon@report-post-count", "execution-perf-mon"),
    /// Execution time samples written.
    PERF_MON_REPORT_WRITE_COUNT => ("perf-mon@report-write-count", "execution-perf-mon"),
    /// Fastest stats batch write, in milliseconds.
    PERF_MON_MINIMUM_REPORT_WRITE_DURATION => ("perf-mon@minimum-report-write-duration", "execution-perf-mon"),
    /// Slowest stats batch write, in milliseconds.
    PERF_MON_MAXIMUM_REPORT_WRITE_DURATION => ("perf-mon@maximum-report-write-duration", "execution-perf-mon"),
    /// Execution time samples that timed out.
    PERF_MON_REPORT_WRITE_REQUESTS_TIMEOUT_COUNT => ("perf-mon@report-requests-timeout-count", "execution-perf-mon"),
}

impl AppMetricId {
    /// Creates a metric id.
    pub const fn new(value_id: &'static str, value_category: &'static str) -> Self {
        Self {
            value_id,
            value_category,
        }
    }

    /// The unique name of the metric.
    pub const fn value_id(&self) -> &'static str {
        self.value_id
    }

    /// The category the metric is grouped under.
    pub const fn value_category(&self) -> &'static str {
        self.value_category
    }

    /// Looks up a built-in metric id by name.
    pub fn try_parse(value_id: &str) -> Option<AppMetricId> {
        Self::BUILT_IN
            .iter()
            .find(|id| id.value_id == value_id)
            .copied()
    }

    /// Returns `true` when `value_id` names a built-in metric.
    pub fn is_supported(value_id: &str) -> bool {
        Self::try_parse(value_id).is_some()
    }

    /// Every built-in metric id.
    pub fn built_in() -> impl Iterator<Item = AppMetricId> {
        Self::BUILT_IN.iter().copied()
    }
}

impl fmt::Display for AppMetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}@{}]", self.value_id, self.value_category)
    }
}

/// A single metric value that may be updated concurrently.
#[derive(Debug)]
pub struct AppMetric {
    id: AppMetricId,
    value: AtomicI64,
}

impl AppMetric {
    /// Creates a metric with a value of zero.
    pub const fn new(id: AppMetricId) -> Self {
        Self::with_value(id, 0)
    }

    /// Creates a metric with the given value.
    pub const fn with_value(id: AppMetricId, value: i64) -> Self {
        Self {
            id,
            value: AtomicI64::new(value),
        }
    }

    /// The id of this metric.
    pub const fn id(&self) -> AppMetricId {
        self.id
    }

    /// The current value.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Replaces the value, returning the previous one.
    pub fn update(&self, value: i64) -> i64 {
        self.value.swap(value, Ordering::AcqRel)
    }

    /// Adds `amount`, returning the new value.
    pub fn add(&self, amount: i64) -> i64 {
        self.value.fetch_add(amount, Ordering::AcqRel) + amount
    }

    /// Adds one, returning the new value.
    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    /// Subtracts one, returning the new value.
    pub fn decrement(&self) -> i64 {
        self.add(-1)
    }

    /// Raises the value to `candidate` if it is larger.
    pub fn max(&self, candidate: i64) -> i64 {
        self.value.fetch_max(candidate, Ordering::AcqRel).max(candidate)
    }

    /// Lowers the value to `candidate` if it is smaller.
    pub fn min(&self, candidate: i64) -> i64 {
        self.value.fetch_min(candidate, Ordering::AcqRel).min(candidate)
    }

    /// Takes a point-in-time copy.
    pub fn copy(&self) -> AppMetric {
        AppMetric::with_value(self.id, self.value())
    }

    /// Sums this metric with another metric of the same id.
    pub fn join_with(&self, other: &AppMetric) -> Result<AppMetric, Error> {
        if self.id != other.id {
            return Err(Error::MismatchedIds(self.id, other.id));
        }

        Ok(AppMetric::with_value(self.id, self.value() + other.value()))
    }
}

impl Clone for AppMetric {
    fn clone(&self) -> Self {
        self.copy()
    }
}

impl PartialEq for AppMetric {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.value() == other.value()
    }
}

/// A fixed set of metrics owned by one component.
#[derive(Debug, Default)]
pub struct AppMetricsCollection {
    metrics: HashMap<AppMetricId, AppMetric>,
}

impl AppMetricsCollection {
    /// Creates a collection holding a zeroed metric for each id.
    pub fn new(ids: &[AppMetricId]) -> Self {
        Self {
            metrics: ids.iter().map(|id| (*id, AppMetric::new(*id))).collect(),
        }
    }

    /// Creates a collection where each metric starts at the given value.
    pub fn with_initial(ids: &[(AppMetricId, i64)]) -> Self {
        Self {
            metrics: ids
                .iter()
                .map(|(id, value)| (*id, AppMetric::with_value(*id, *value)))
                .collect(),
        }
    }

    /// Applies `f` to the metric with `id`, if it is part of the collection.
    pub fn update(&self, id: AppMetricId, f: impl FnOnce(&AppMetric)) {
        if let Some(metric) = self.metrics.get(&id) {
            f(metric);
        }
    }

    /// Returns a copy of the metric with `id`.
    pub fn get(&self, id: AppMetricId) -> Option<AppMetric> {
        self.metrics.get(&id).map(AppMetric::copy)
    }

    /// Returns the current value of the metric with `id`, or zero.
    pub fn value(&self, id: AppMetricId) -> i64 {
        self.metrics.get(&id).map(AppMetric::value).unwrap_or_default()
    }

    /// Ids of every metric in the collection.
    pub fn ids(&self) -> Vec<AppMetricId> {
        self.metrics.keys().copied().collect()
    }

    /// Copies every metric in the collection.
    pub fn collect(&self) -> Vec<AppMetric> {
        self.metrics.values().map(AppMetric::copy).collect()
    }

    /// Collects from all providers, summing metrics that share an id.
    pub fn join_collect(providers: &[&dyn AppMetricsProvider]) -> Vec<AppMetric> {
        let mut joined: HashMap<AppMetricId, i64> = HashMap::new();

        for metric in providers.iter().flat_map(|provider| provider.collect_metrics()) {
            *joined.entry(metric.id()).or_default() += metric.value();
        }

        joined
            .into_iter()
            .map(|(id, value)| AppMetric::with_value(id, value))
            .collect()
    }
}

/// Implemented by components that expose metrics.
pub trait AppMetricsProvider: Send + Sync {
    /// Copies all metrics the provider currently holds.
    fn collect_metrics(&self) -> Vec<AppMetric>;

    /// Returns a copy of the metric with `id`, if the provider exports it.
    fn query_metric(&self, id: AppMetricId) -> Option<AppMetric> {
        self.collect_metrics().into_iter().find(|metric| metric.id() == id)
    }

    /// Ids of the metrics the provider exports.
    fn exported_metrics(&self) -> Vec<AppMetricId> {
        self.collect_metrics().iter().map(AppMetric::id).collect()
    }
}

impl AppMetricsProvider for AppMetricsCollection {
    fn collect_metrics(&self) -> Vec<AppMetric> {
        self.collect()
    }

    fn query_metric(&self, id: AppMetricId) -> Option<AppMetric> {
        self.get(id)
    }

    fn exported_metrics(&self) -> Vec<AppMetricId> {
        self.ids()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn built_in_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for id in AppMetricId::built_in() {
            assert!(seen.insert(id.value_id()), "duplicate id {id}");
        }
    }

    #[test]
    fn parse_built_in_id() {
        let id = AppMetricId::try_parse("listener@reconnect-count");
        assert_eq!(id, Some(AppMetricId::LISTENER_RECONNECT_COUNT));
        assert!(AppMetricId::try_parse("listener@nope").is_none());
        assert_eq!(
            AppMetricId::BUFFER_MAX_COUNT.to_string(),
            "[task-buffer@max-count@task-buffer]"
        );
    }

    #[test]
    fn min_and_max_only_move_one_way() {
        let metric = AppMetric::with_value(AppMetricId::BUFFER_MAX_COUNT, 3);
        assert_eq!(metric.max(2), 3);
        assert_eq!(metric.max(7), 7);
        assert_eq!(metric.value(), 7);

        let metric = AppMetric::with_value(AppMetricId::BUFFER_MIN_COUNT, 3);
        assert_eq!(metric.min(5), 3);
        assert_eq!(metric.min(1), 1);
        assert_eq!(metric.value(), 1);
    }

    #[test]
    fn join_requires_matching_ids() {
        let a = AppMetric::with_value(AppMetricId::POLLER_DEQUEUE_COUNT, 2);
        let b = AppMetric::with_value(AppMetricId::POLLER_DEQUEUE_COUNT, 5);
        assert_eq!(a.join_with(&b).expect("same id").value(), 7);

        let c = AppMetric::new(AppMetricId::POLLER_REPOST_COUNT);
        assert!(matches!(a.join_with(&c), Err(Error::MismatchedIds(..))));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metric = Arc::new(AppMetric::new(AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metric = metric.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        metric.increment();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread should not panic");
        }

        assert_eq!(metric.value(), 8_000);
    }

    #[test]
    fn join_collect_sums_across_providers() {
        let first = AppMetricsCollection::new(&[
            AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT,
            AppMetricId::WORKER_BUFFER_WAIT_COUNT,
        ]);
        let second = AppMetricsCollection::new(&[AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT]);

        first.update(AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT, |m| {
            m.add(3);
        });
        second.update(AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT, |m| {
            m.add(4);
        });
        // Ids outside the collection are ignored.
        second.update(AppMetricId::BUFFER_MAX_COUNT, |m| {
            m.add(100);
        });

        let joined = AppMetricsCollection::join_collect(&[&first, &second]);
        let processed = joined
            .iter()
            .find(|m| m.id() == AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT)
            .expect("joined metric");

        assert_eq!(processed.value(), 7);
        assert_eq!(joined.len(), 2);
    }
}
