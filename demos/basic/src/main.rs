use std::{env, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use stakhanov::{
    EngineOptions, ExecutionError, ExecutorRegistry, TaskEngine, TaskExecutionContext,
    TaskExecutor, TaskPayload,
};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Deserialize, Serialize)]
struct GenerateReport {
    report_id: i32,
}

impl TaskPayload for GenerateReport {
    const TYPE: &'static str = "generate-report";
}

struct ReportGenerator;

impl TaskExecutor for ReportGenerator {
    type Payload = GenerateReport;

    async fn execute(
        &self,
        GenerateReport { report_id }: Self::Payload,
        cx: &TaskExecutionContext,
    ) -> Result<(), ExecutionError> {
        // Every seventh report hits a flaky upstream on its first attempt.
        if report_id % 7 == 0 && cx.task().lock_handle_id % 2 == 1 {
            return Err(ExecutionError::transient("Upstream unavailable"));
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            _ = cx.cancelled() => return Err(ExecutionError::cancelled("Shutting down")),
        }

        tracing::info!(report_id, "Generated report");

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.unwrap();
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .unwrap()
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the tracing subscriber.
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "info,stakhanov=debug,sqlx=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    // Set up the database connection pool.
    let database_url = &env::var("DATABASE_URL").expect("DATABASE_URL should be set");
    let pool = PgPool::connect(database_url).await?;

    // Run migrations.
    stakhanov::MIGRATOR.run(&pool).await?;

    let mut registry = ExecutorRegistry::new();
    registry.register(ReportGenerator);

    let options = EngineOptions::builder()
        .worker_count(4)
        .fault_error_threshold_count(3)
        .build();

    let engine = TaskEngine::builder()
        .pool(pool)
        .registry(registry)
        .options(options)
        .build()?;

    // Lower priorities are picked up first.
    for report_id in 1..=20 {
        let priority = if report_id % 5 == 0 { 0 } else { 10 };
        engine
            .producer()
            .enqueue_payload(&GenerateReport { report_id }, "demo-basic", priority)
            .await?;
    }

    engine.run_until(shutdown_signal()).await?;

    let metrics = engine.queue_info().compute_metrics().await?;
    tracing::info!(?metrics, "Queue after shutdown");

    Ok(())
}
