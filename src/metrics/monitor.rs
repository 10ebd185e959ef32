//! Periodic persistence of app metrics.

use std::{sync::Arc, time::Duration};

use sqlx::PgPool;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{AppMetric, AppMetricsCollection, AppMetricsProvider};

/// A type alias for monitor results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Monitor errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

struct Shared {
    pool: PgPool,
    process_id: String,
    providers: Vec<Arc<dyn AppMetricsProvider>>,
}

struct Running {
    shutdown_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Collects every provider's metrics on an interval and writes them to the
/// `app_metrics` table, keyed by process id.
pub struct AppMetricsMonitor {
    shared: Arc<Shared>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl AppMetricsMonitor {
    /// Creates a stopped monitor.
    pub fn new(
        pool: PgPool,
        process_id: impl Into<String>,
        interval: Duration,
        providers: Vec<Arc<dyn AppMetricsProvider>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                process_id: process_id.into(),
                providers,
            }),
            interval,
            running: Mutex::new(None),
        }
    }

    /// Starts collecting in the background.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Metrics monitor already started");
            return;
        }

        let shutdown_token = CancellationToken::new();
        let handle = tokio::spawn(monitor(
            self.shared.clone(),
            self.interval,
            shutdown_token.clone(),
        ));

        *running = Some(Running {
            shutdown_token,
            handle,
        });
        tracing::info!("Metrics monitor started");
    }

    /// Stops collecting, then collects one last time.
    pub async fn stop(&self) {
        let Some(Running {
            shutdown_token,
            handle,
        }) = self.running.lock().await.take()
        else {
            tracing::debug!("Metrics monitor already stopped");
            return;
        };

        shutdown_token.cancel();
        if let Err(err) = handle.await {
            tracing::error!(%err, "Metrics monitor loop did not exit cleanly");
        }

        if let Err(err) = self.shared.collect_and_write().await {
            tracing::error!(%err, "Failed to write final metrics");
        }
        tracing::info!("Metrics monitor stopped");
    }

    /// Collects and writes all metrics once.
    pub async fn collect_and_write(&self) -> Result<Vec<AppMetric>> {
        self.shared.collect_and_write().await
    }
}

async fn monitor(shared: Arc<Shared>, period: Duration, shutdown_token: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => break,
            _ = interval.tick() => {
                if let Err(err) = shared.collect_and_write().await {
                    tracing::error!(%err, "Failed to write metrics");
                }
            }
        }
    }
}

impl Shared {
    #[instrument(skip(self), fields(process_id = %self.process_id), err)]
    async fn collect_and_write(&self) -> Result<Vec<AppMetric>> {
        let providers: Vec<&dyn AppMetricsProvider> =
            self.providers.iter().map(|provider| provider.as_ref()).collect();
        let metrics = AppMetricsCollection::join_collect(&providers);

        let mut tx = self.pool.begin().await?;
        for metric in &metrics {
            sqlx::query(
                r#"
                insert into stakhanov.app_metrics (
                    metric_id,
                    metric_owner_process_id,
                    metric_category,
                    metric_value,
                    metric_last_updated
                )
                values ($1, $2, $3, $4, now())
                on conflict (metric_id, metric_owner_process_id) do update
                set metric_category = excluded.metric_category,
                    metric_value = excluded.metric_value,
                    metric_last_updated = excluded.metric_last_updated
                "#,
            )
            .bind(metric.id().value_id())
            .bind(&self.process_id)
            .bind(metric.id().value_category())
            .bind(metric.value())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(metrics = metrics.len(), "Wrote metrics");

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AppMetricId;

    async fn stored_value(pool: &PgPool, id: AppMetricId) -> sqlx::Result<Option<i64>> {
        sqlx::query_scalar(
            r#"
            select metric_value
            from stakhanov.app_metrics
            where metric_id = $1
              and metric_owner_process_id = 'proc-a'
            "#,
        )
        .bind(id.value_id())
        .fetch_optional(pool)
        .await
    }

    #[sqlx::test]
    async fn writes_joined_metrics(pool: PgPool) -> sqlx::Result<(), Error> {
        let first = Arc::new(AppMetricsCollection::with_initial(&[
            (AppMetricId::POLLER_DEQUEUE_COUNT, 2),
            (AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT, 5),
        ]));
        let second = Arc::new(AppMetricsCollection::with_initial(&[(
            AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT,
            3,
        )]));

        let monitor = AppMetricsMonitor::new(
            pool.clone(),
            "proc-a",
            Duration::from_secs(60),
            vec![first.clone(), second],
        );

        let written = monitor.collect_and_write().await?;
        assert_eq!(written.len(), 2);
        assert_eq!(
            stored_value(&pool, AppMetricId::WORKER_PROCESSED_PAYLOAD_COUNT).await?,
            Some(8)
        );

        first.update(AppMetricId::POLLER_DEQUEUE_COUNT, |m| {
            m.add(10);
        });
        monitor.collect_and_write().await?;
        assert_eq!(
            stored_value(&pool, AppMetricId::POLLER_DEQUEUE_COUNT).await?,
            Some(12)
        );

        Ok(())
    }

    #[sqlx::test]
    async fn stop_collects_once_more(pool: PgPool) -> sqlx::Result<(), Error> {
        let metrics = Arc::new(AppMetricsCollection::new(&[AppMetricId::BUFFER_TIMES_FILLED]));
        let monitor = AppMetricsMonitor::new(
            pool.clone(),
            "proc-a",
            Duration::from_secs(3_600),
            vec![metrics.clone()],
        );

        monitor.start().await;
        metrics.update(AppMetricId::BUFFER_TIMES_FILLED, |m| {
            m.increment();
        });
        monitor.stop().await;

        assert_eq!(
            stored_value(&pool, AppMetricId::BUFFER_TIMES_FILLED).await?,
            Some(1)
        );

        Ok(())
    }
}
