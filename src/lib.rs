//! # Stakhanov
//!
//! A durable, priority-ordered task queue on Postgres.
//!
//! # Overview
//!
//! **Stakhanov** processes background tasks stored in PostgreSQL. Tasks are
//! posted in a transaction that also emits a `NOTIFY`, so idle consumers wake
//! up as soon as work arrives instead of polling on a fixed interval. Dequeued
//! tasks pass through a small in-memory buffer to a pool of workers, and their
//! results are written back in batches.
//!
//! Key Features:
//!
//! - **Push-style wake-up**: a reconnecting `LISTEN` subscription signals when
//!   a dequeue is worth trying; a bounded wait cycle covers missed
//!   notifications.
//! - **Leases, not locks**: each dequeue takes a lease under a fresh lock
//!   handle with `FOR UPDATE SKIP LOCKED`. Expired leases make a task eligible
//!   again, and a stale worker can never finalize a task that was leased
//!   since.
//! - **Backpressure without spinning**: the poller waits on two level-triggered
//!   gates, one for buffer space and one for available work.
//! - **Retry state machine**: recoverable failures are retried with a
//!   configurable backoff until the fault threshold is passed; unrecoverable
//!   ones fail the task at once.
//! - **Batched writes**: results and execution-time statistics are written by a
//!   generic batch processor that retries failed flushes per request.
//!
//! # Example
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use sqlx::PgPool;
//! use stakhanov::{
//!     EngineOptions, ExecutionError, ExecutorRegistry, TaskEngine, TaskExecutionContext,
//!     TaskExecutor, TaskPayload,
//! };
//!
//! #[derive(Deserialize, Serialize)]
//! struct WelcomeEmail {
//!     user_id: i32,
//!     email: String,
//! }
//!
//! impl TaskPayload for WelcomeEmail {
//!     const TYPE: &'static str = "welcome-email";
//! }
//!
//! struct SendWelcomeEmail;
//!
//! impl TaskExecutor for SendWelcomeEmail {
//!     type Payload = WelcomeEmail;
//!
//!     async fn execute(
//!         &self,
//!         WelcomeEmail { user_id, email }: Self::Payload,
//!         _cx: &TaskExecutionContext,
//!     ) -> Result<(), ExecutionError> {
//!         // Pretend we're sending an email here.
//!         println!("Sending welcome email to {email} (user {user_id})");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::connect(&std::env::var("DATABASE_URL")?).await?;
//!
//!     // Run migrations.
//!     stakhanov::MIGRATOR.run(&pool).await?;
//!
//!     let mut registry = ExecutorRegistry::new();
//!     registry.register(SendWelcomeEmail);
//!
//!     let engine = TaskEngine::builder()
//!         .pool(pool)
//!         .registry(registry)
//!         .options(EngineOptions::builder().worker_count(4).build())
//!         .build()?;
//!
//!     // Post a task.
//!     let payload = WelcomeEmail {
//!         user_id: 42,
//!         email: "ferris@example.com".to_string(),
//!     };
//!     engine.producer().enqueue_payload(&payload, "signup", 0).await?;
//!
//!     engine.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     engine.stop().await;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Concepts
//!
//! ## Tasks
//!
//! A [`QueuedTask`](task::QueuedTask) carries a type tag, a JSON payload and a
//! priority; lower priorities are dequeued first. Every task has exactly one
//! [`QueuedTaskResult`](task::QueuedTaskResult), advanced by the result state
//! machine as attempts succeed or fail.
//!
//! ## Executors
//!
//! An [`TaskExecutor`] handles one [`TaskPayload`] type. Executors are
//! registered explicitly in an [`ExecutorRegistry`], keyed by the payload's
//! type tag.
//!
//! ## Engine
//!
//! The [`TaskEngine`] composes the consumer, poller, buffer, workers and the
//! batch writers, and starts and stops them in order.

#![warn(clippy::all, nonstandard_style, future_incompatible, missing_docs)]

use sqlx::migrate::Migrator;

pub use crate::{
    engine::TaskEngine,
    executor::{
        ErrorKind, ExecutionError, ExecutorRegistry, TaskExecutionContext, TaskExecutor,
        TaskPayload,
    },
    options::EngineOptions,
    producer::TaskQueueProducer,
    task::{QueuedTaskToken, Status},
};

pub mod batch;
pub mod buffer;
pub mod consumer;
pub mod engine;
pub mod executor;
pub mod listener;
pub mod metrics;
pub mod options;
pub mod perf_monitor;
pub mod poller;
pub mod producer;
pub mod queue_info;
pub mod result_queue;
pub mod task;
pub mod timestamp;
pub mod worker;

/// A SQLx [`Migrator`] which provides Stakhanov's schema migrations.
///
/// These migrations must be applied before tasks can be posted or processed.
///
/// **Note**: Changes are managed within a dedicated schema, called
/// "stakhanov".
///
/// # Example
///
///```rust,no_run
/// # use tokio::runtime::Runtime;
/// use std::env;
///
/// use sqlx::PgPool;
///
/// # fn main() {
/// # let rt = Runtime::new().unwrap();
/// # rt.block_on(async {
/// // Set up the database connection pool.
/// let database_url = &env::var("DATABASE_URL")?;
/// let pool = PgPool::connect(database_url).await?;
///
/// // Run migrations.
/// stakhanov::MIGRATOR.run(&pool).await?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # });
/// # }
pub static MIGRATOR: Migrator = sqlx::migrate!();
