//! Execution time statistics per payload type.
//!
//! Workers report how long each execution took. Reports are batched; each
//! batch is folded into one [`TaskExecutionStats`] per payload type and merged
//! into the `task_execution_stats` table, keyed by payload type and process
//! id. The monitor also keeps the merged figures of everything it wrote, see
//! [`ExecutionPerformanceMonitor::stats`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use sqlx::PgPool;

use crate::{
    batch::{
        self, AsyncProcessingRequestBatchProcessor, BatchFlush, BatchMetricIds, FlushError,
        RequestBatch, RequestHandle, RequestStatus,
    },
    metrics::{AppMetric, AppMetricId, AppMetricsProvider},
    options::BatchOptions,
};

/// Aggregated execution times, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct TaskExecutionStats {
    /// Executions counted.
    #[sqlx(rename = "et_n_execution_cycles")]
    pub execution_cycles: i64,

    /// The most recent execution time.
    #[sqlx(rename = "et_last_execution_time")]
    pub last_execution_time: i64,

    /// Average execution time, rounded up.
    #[sqlx(rename = "et_avg_execution_time")]
    pub average_execution_time: i64,

    /// Shortest execution time.
    #[sqlx(rename = "et_fastest_execution_time")]
    pub fastest_execution_time: i64,

    /// Longest execution time.
    #[sqlx(rename = "et_longest_execution_time")]
    pub longest_execution_time: i64,

    /// Sum of all execution times.
    #[sqlx(rename = "et_total_execution_time")]
    pub total_execution_time: i64,
}

impl TaskExecutionStats {
    /// Statistics of a single execution.
    pub const fn initial(execution_time: i64) -> Self {
        Self {
            execution_cycles: 1,
            last_execution_time: execution_time,
            average_execution_time: execution_time,
            fastest_execution_time: execution_time,
            longest_execution_time: execution_time,
            total_execution_time: execution_time,
        }
    }

    /// Statistics after one more execution.
    pub fn update_with_new_cycle_execution_time(&self, execution_time: i64) -> Self {
        self.merge(&Self::initial(execution_time))
    }

    /// Statistics of `self` followed by `later`.
    pub fn merge(&self, later: &Self) -> Self {
        let execution_cycles = self.execution_cycles + later.execution_cycles;
        let total_execution_time = self.total_execution_time + later.total_execution_time;

        Self {
            execution_cycles,
            last_execution_time: later.last_execution_time,
            average_execution_time: ceiling_div(total_execution_time, execution_cycles),
            fastest_execution_time: self.fastest_execution_time.min(later.fastest_execution_time),
            longest_execution_time: self.longest_execution_time.max(later.longest_execution_time),
            total_execution_time,
        }
    }
}

fn ceiling_div(total: i64, count: i64) -> i64 {
    if count <= 0 {
        return 0;
    }
    let quotient = total / count;
    if total % count > 0 {
        quotient + 1
    } else {
        quotient
    }
}

/// One execution time report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionTimeSample {
    /// The payload type executed.
    pub payload_type: String,

    /// How long the execution took.
    pub duration_ms: i64,
}

type Snapshot = Arc<Mutex<HashMap<String, TaskExecutionStats>>>;

/// Flushes execution time batches.
#[derive(Debug, Clone)]
pub struct StatsWriter {
    pool: PgPool,
    process_id: String,
    snapshot: Snapshot,
}

impl StatsWriter {
    fn aggregate(batch: &RequestBatch<ExecutionTimeSample>) -> HashMap<String, TaskExecutionStats> {
        let mut aggregated: HashMap<String, TaskExecutionStats> = HashMap::new();
        for sample in batch.payloads() {
            aggregated
                .entry(sample.payload_type.clone())
                .and_modify(|stats| {
                    *stats = stats.update_with_new_cycle_execution_time(sample.duration_ms)
                })
                .or_insert_with(|| TaskExecutionStats::initial(sample.duration_ms));
        }
        aggregated
    }
}

impl BatchFlush<ExecutionTimeSample> for StatsWriter {
    async fn flush(
        &self,
        batch: &RequestBatch<ExecutionTimeSample>,
    ) -> Result<Vec<RequestStatus>, FlushError> {
        // Samples are folded together, so the batch is written as a whole.
        let aggregated = Self::aggregate(batch);

        let mut tx = self.pool.begin().await?;
        for (payload_type, stats) in &aggregated {
            sqlx::query(
                r#"
                insert into stakhanov.task_execution_stats as s (
                    et_payload_type,
                    et_owner_process_id,
                    et_n_execution_cycles,
                    et_last_execution_time,
                    et_avg_execution_time,
                    et_fastest_execution_time,
                    et_longest_execution_time,
                    et_total_execution_time
                )
                values ($1, $2, $3, $4, $5, $6, $7, $8)
                on conflict (et_payload_type, et_owner_process_id) do update
                set et_n_execution_cycles = s.et_n_execution_cycles + excluded.et_n_execution_cycles,
                    et_last_execution_time = excluded.et_last_execution_time,
                    et_avg_execution_time = ceiling(
                        (s.et_total_execution_time + excluded.et_total_execution_time)::numeric
                        / (s.et_n_execution_cycles + excluded.et_n_execution_cycles)
                    )::bigint,
                    et_fastest_execution_time = least(s.et_fastest_execution_time, excluded.et_fastest_execution_time),
                    et_longest_execution_time = greatest(s.et_longest_execution_time, excluded.et_longest_execution_time),
                    et_total_execution_time = s.et_total_execution_time + excluded.et_total_execution_time
                "#,
            )
            .bind(payload_type)
            .bind(&self.process_id)
            .bind(stats.execution_cycles)
            .bind(stats.last_execution_time)
            .bind(stats.average_execution_time)
            .bind(stats.fastest_execution_time)
            .bind(stats.longest_execution_time)
            .bind(stats.total_execution_time)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        for (payload_type, stats) in aggregated {
            snapshot
                .entry(payload_type)
                .and_modify(|merged| *merged = merged.merge(&stats))
                .or_insert(stats);
        }

        Ok(batch.all_flushed())
    }
}

/// Execution time reporting backed by a batch processor.
pub struct ExecutionPerformanceMonitor {
    processor: AsyncProcessingRequestBatchProcessor<ExecutionTimeSample, StatsWriter>,
    snapshot: Snapshot,
}

impl ExecutionPerformanceMonitor {
    /// Creates a monitor that is not flushing yet.
    pub fn new(pool: PgPool, process_id: impl Into<String>, options: BatchOptions) -> Self {
        let snapshot = Snapshot::default();
        let writer = StatsWriter {
            pool,
            process_id: process_id.into(),
            snapshot: snapshot.clone(),
        };

        Self {
            processor: AsyncProcessingRequestBatchProcessor::new(
                writer,
                options,
                BatchMetricIds {
                    post_count: Some(AppMetricId::PERF_MON_REPORT_POST_COUNT),
                    write_count: Some(AppMetricId::PERF_MON_REPORT_WRITE_COUNT),
                    min_write_duration: Some(AppMetricId::PERF_MON_MINIMUM_REPORT_WRITE_DURATION),
                    max_write_duration: Some(AppMetricId::PERF_MON_MAXIMUM_REPORT_WRITE_DURATION),
                    total_write_duration: None,
                    request_timeout_count: Some(
                        AppMetricId::PERF_MON_REPORT_WRITE_REQUESTS_TIMEOUT_COUNT,
                    ),
                },
            ),
            snapshot,
        }
    }

    /// Starts writing reports.
    pub fn start_flushing(&self) {
        self.processor.start();
        tracing::info!("Execution performance monitor started");
    }

    /// Writes what was reported so far and stops.
    pub async fn stop_flushing(&self) {
        self.processor.stop().await;
        tracing::info!("Execution performance monitor stopped");
    }

    /// Returns `true` while reports are accepted.
    pub fn is_flushing(&self) -> bool {
        self.processor.is_running()
    }

    /// Reports one execution of `payload_type`.
    ///
    /// The report must be written within `timeout_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`batch::Error::NotRunning`] unless flushing.
    pub fn report_execution_time(
        &self,
        payload_type: impl Into<String>,
        duration_ms: i64,
        timeout_ms: u64,
    ) -> batch::Result<RequestHandle> {
        self.processor.post_with_timeout(
            ExecutionTimeSample {
                payload_type: payload_type.into(),
                duration_ms,
            },
            Duration::from_millis(timeout_ms),
        )
    }

    /// Statistics of every report written by this monitor.
    pub fn stats(&self) -> HashMap<String, TaskExecutionStats> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AppMetricsProvider for ExecutionPerformanceMonitor {
    fn collect_metrics(&self) -> Vec<AppMetric> {
        self.processor.collect_metrics()
    }
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use super::*;

    #[test]
    fn stats_accumulate_with_ceiling_average() {
        let stats = TaskExecutionStats::initial(10)
            .update_with_new_cycle_execution_time(3)
            .update_with_new_cycle_execution_time(4);

        assert_eq!(stats.execution_cycles, 3);
        assert_eq!(stats.total_execution_time, 17);
        // 17 / 3 = 5.67
        assert_eq!(stats.average_execution_time, 6);
        assert_eq!(stats.fastest_execution_time, 3);
        assert_eq!(stats.longest_execution_time, 10);
        assert_eq!(stats.last_execution_time, 4);
    }

    #[test]
    fn merge_combines_two_aggregates() {
        let first = TaskExecutionStats::initial(100).update_with_new_cycle_execution_time(2);
        let second = TaskExecutionStats::initial(7);

        let merged = first.merge(&second);
        assert_eq!(merged.execution_cycles, 3);
        assert_eq!(merged.total_execution_time, 109);
        // 109 / 3 = 36.33
        assert_eq!(merged.average_execution_time, 37);
        assert_eq!(merged.fastest_execution_time, 2);
        assert_eq!(merged.longest_execution_time, 100);
        assert_eq!(merged.last_execution_time, 7);
    }

    #[sqlx::test]
    async fn flush_merges_into_stored_stats(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
        let monitor = ExecutionPerformanceMonitor::new(pool.clone(), "proc-a", BatchOptions::default());
        monitor.start_flushing();

        for duration_ms in [10, 20, 30] {
            monitor
                .report_execution_time("resize", duration_ms, 5_000)?
                .wait()
                .await?;
        }
        monitor.report_execution_time("email", 7, 5_000)?.wait().await?;

        let stored: TaskExecutionStats = sqlx::query_as(
            r#"
            select *
            from stakhanov.task_execution_stats
            where et_payload_type = $1
              and et_owner_process_id = $2
            "#,
        )
        .bind("resize")
        .bind("proc-a")
        .fetch_one(&pool)
        .await?;

        assert_eq!(stored.execution_cycles, 3);
        assert_eq!(stored.total_execution_time, 60);
        assert_eq!(stored.average_execution_time, 20);
        assert_eq!(stored.fastest_execution_time, 10);
        assert_eq!(stored.longest_execution_time, 30);
        assert_eq!(stored.last_execution_time, 30);

        let snapshot = monitor.stats();
        assert_eq!(snapshot.get("resize"), Some(&stored));
        assert_eq!(snapshot.get("email").map(|s| s.execution_cycles), Some(1));

        monitor.stop_flushing().await;
        assert!(matches!(
            monitor.report_execution_time("resize", 1, 5_000),
            Err(batch::Error::NotRunning)
        ));

        Ok(())
    }
}
