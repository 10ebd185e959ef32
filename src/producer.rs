//! Posting tasks.
//!
//! Posting writes the task row, upserts its result row and notifies listeners
//! in one transaction, so either all three happen or none does. Reposts go
//! through the same path and reuse the task's id.
//!
//! A repost made under a lease, see [`QueuedTaskProduceInfo::lease`], only
//! goes through while the task's queue row still carries that lock handle. A
//! worker whose lease was taken over can therefore not reset the task.
//!
//! ```rust,no_run
//! # use sqlx::PgPool;
//! # use serde::{Deserialize, Serialize};
//! use stakhanov::{executor::TaskPayload, producer::TaskQueueProducer};
//!
//! #[derive(Deserialize, Serialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! impl TaskPayload for SendEmail {
//!     const TYPE: &'static str = "send-email";
//! }
//!
//! # use tokio::runtime::Runtime;
//! # fn main() {
//! # let rt = Runtime::new().unwrap();
//! # rt.block_on(async {
//! # let pool = PgPool::connect(&std::env::var("DATABASE_URL")?).await?;
//! let producer = TaskQueueProducer::new(pool, "stakhanov_new_task_posted");
//! let posted = producer
//!     .enqueue_payload(&SendEmail { to: "ferris@example.com".into() }, "signup", 0)
//!     .await?;
//! println!("Posted task {}", posted.id);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! # }
//! ```

use sqlx::{PgConnection, PgPool};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    executor::TaskPayload,
    task::{Id, LockHandleId, QueuedTaskProduceInfo},
};

/// A type alias for producer results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Producer errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `serde_json` crate when serializing payloads.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Priorities must not be negative.
    #[error("Priority must be zero or greater, got {0}.")]
    InvalidPriority(i32),

    /// Every task must say who posted it.
    #[error("Task source must not be empty.")]
    EmptySource,

    /// Every task must carry a type.
    #[error("Task type must not be empty.")]
    EmptyType,

    /// The lease a repost was made under is no longer held.
    #[error("Task {id} is no longer leased under lock handle {lock_handle_id}.")]
    LeaseLost {
        /// The task.
        id: Id,
        /// The lease the repost was made under.
        lock_handle_id: LockHandleId,
    },
}

/// Identity of a posted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueuedTask {
    /// The task's id.
    pub id: Id,

    /// The lock handle the task row now carries.
    pub lock_handle_id: LockHandleId,
}

/// Writes tasks to the queue.
#[derive(Debug, Clone)]
pub struct TaskQueueProducer {
    pool: PgPool,
    channel: String,
}

impl TaskQueueProducer {
    /// Creates a producer announcing new tasks on `channel`.
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    /// Serializes `payload` and posts it as a new task.
    pub async fn enqueue_payload<P: TaskPayload>(
        &self,
        payload: &P,
        source: impl Into<String>,
        priority: i32,
    ) -> Result<EnqueuedTask> {
        let payload = serde_json::to_value(payload)?;
        self.enqueue(QueuedTaskProduceInfo::new(
            P::TYPE,
            source,
            Some(payload),
            priority,
        ))
        .await
    }

    /// Posts or reposts a task in its own transaction.
    pub async fn enqueue(&self, info: QueuedTaskProduceInfo) -> Result<EnqueuedTask> {
        let mut tx = self.pool.begin().await?;
        let enqueued = self.enqueue_in(&mut tx, info).await?;
        tx.commit().await?;

        Ok(enqueued)
    }

    /// Posts or reposts a task on the given connection.
    ///
    /// Callers are expected to run this inside a transaction so that the task
    /// row, result row and notification are written together.
    #[instrument(
        skip(self, conn, info),
        fields(
            task.id = tracing::field::Empty,
            task.type = %info.task_type,
            task.status = ?info.status,
            repost = info.id.is_some(),
            lease = ?info.lease,
        ),
        err
    )]
    pub async fn enqueue_in(
        &self,
        conn: &mut PgConnection,
        info: QueuedTaskProduceInfo,
    ) -> Result<EnqueuedTask> {
        validate(&info)?;

        let id = info.id.unwrap_or_else(Uuid::new_v4);
        tracing::Span::current().record("task.id", id.as_hyphenated().to_string());

        let lock_handle_id = match info.lease {
            Some(lease) => {
                let renewed: Option<LockHandleId> = sqlx::query_scalar(
                    r#"
                    update stakhanov.task_queue
                    set task_lock_handle_id = nextval('stakhanov.task_lock_handle_id_seq'),
                        task_type = $2,
                        task_source = $3,
                        task_payload = $4,
                        task_priority = $5,
                        task_posted_at_ts = now(),
                        task_locked_until_ts = coalesce($6, now())
                    where task_id = $1
                      and task_lock_handle_id = $7
                    returning task_lock_handle_id
                    "#,
                )
                .bind(id)
                .bind(&info.task_type)
                .bind(&info.source)
                .bind(&info.payload)
                .bind(info.priority)
                .bind(info.locked_until)
                .bind(lease)
                .fetch_optional(&mut *conn)
                .await?;

                renewed.ok_or(Error::LeaseLost {
                    id,
                    lock_handle_id: lease,
                })?
            }

            None => {
                sqlx::query_scalar(
                    r#"
                    insert into stakhanov.task_queue (
                        task_id,
                        task_type,
                        task_source,
                        task_payload,
                        task_priority,
                        task_posted_at_ts,
                        task_locked_until_ts
                    )
                    values ($1, $2, $3, $4, $5, now(), coalesce($6, now()))
                    on conflict (task_id) do update
                    set task_lock_handle_id = nextval('stakhanov.task_lock_handle_id_seq'),
                        task_type = excluded.task_type,
                        task_source = excluded.task_source,
                        task_payload = excluded.task_payload,
                        task_priority = excluded.task_priority,
                        task_posted_at_ts = excluded.task_posted_at_ts,
                        task_locked_until_ts = excluded.task_locked_until_ts
                    returning task_lock_handle_id
                    "#,
                )
                .bind(id)
                .bind(&info.task_type)
                .bind(&info.source)
                .bind(&info.payload)
                .bind(info.priority)
                .bind(info.locked_until)
                .fetch_one(&mut *conn)
                .await?
            }
        };

        sqlx::query(
            r#"
            insert into stakhanov.task_result (
                task_id,
                task_type,
                task_source,
                task_payload,
                task_status,
                task_priority,
                task_posted_at_ts
            )
            values ($1, $2, $3, $4, $5, $6, now())
            on conflict (task_id) do update
            set task_status = excluded.task_status,
                task_source = excluded.task_source,
                task_priority = excluded.task_priority,
                task_posted_at_ts = excluded.task_posted_at_ts
            "#,
        )
        .bind(id)
        .bind(&info.task_type)
        .bind(&info.source)
        .bind(&info.payload)
        .bind(info.status)
        .bind(info.priority)
        .execute(&mut *conn)
        .await?;

        sqlx::query("select pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(id.as_hyphenated().to_string())
            .execute(&mut *conn)
            .await?;

        Ok(EnqueuedTask { id, lock_handle_id })
    }
}

fn validate(info: &QueuedTaskProduceInfo) -> Result {
    if info.priority < 0 {
        return Err(Error::InvalidPriority(info.priority));
    }
    if info.source.trim().is_empty() {
        return Err(Error::EmptySource);
    }
    if info.task_type.trim().is_empty() {
        return Err(Error::EmptyType);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use jiff::ToSpan;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use sqlx::postgres::PgListener;

    use super::*;
    use crate::{
        task::{QueuedTask, QueuedTaskResult, Status},
        timestamp::Timestamp,
    };

    const CHANNEL: &str = "stakhanov_producer_test";

    #[derive(Deserialize, Serialize)]
    struct Ping {
        n: u32,
    }

    impl TaskPayload for Ping {
        const TYPE: &'static str = "ping";
    }

    async fn task_row(pool: &PgPool, id: Id) -> sqlx::Result<Option<QueuedTask>> {
        sqlx::query_as("select * from stakhanov.task_queue where task_id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    async fn result_row(pool: &PgPool, id: Id) -> sqlx::Result<QueuedTaskResult> {
        sqlx::query_as("select * from stakhanov.task_result where task_id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    #[sqlx::test]
    async fn enqueue_writes_task_and_result(pool: PgPool) -> sqlx::Result<(), Error> {
        let producer = TaskQueueProducer::new(pool.clone(), CHANNEL);

        let posted = producer.enqueue_payload(&Ping { n: 7 }, "tests", 3).await?;

        let task = task_row(&pool, posted.id).await?.expect("task row exists");
        assert_eq!(task.task_type, "ping");
        assert_eq!(task.source, "tests");
        assert_eq!(task.priority, 3);
        assert_eq!(task.payload, Some(json!({ "n": 7 })));
        assert_eq!(task.lock_handle_id, posted.lock_handle_id);

        let result = result_row(&pool, posted.id).await?;
        assert_eq!(result.status, Status::Unprocessed);
        assert_eq!(result.error_count, 0);
        assert!(result.processing_finalized_at.is_none());

        Ok(())
    }

    #[sqlx::test]
    async fn enqueue_notifies_listeners(pool: PgPool) -> sqlx::Result<(), Error> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(CHANNEL).await?;

        let producer = TaskQueueProducer::new(pool, CHANNEL);
        let posted = producer
            .enqueue(QueuedTaskProduceInfo::new("ping", "tests", None, 0))
            .await?;

        let notification = listener.recv().await?;
        assert_eq!(notification.payload(), posted.id.to_string());

        Ok(())
    }

    #[sqlx::test]
    async fn repost_reuses_id_and_takes_new_lock_handle(pool: PgPool) -> sqlx::Result<(), Error> {
        let producer = TaskQueueProducer::new(pool.clone(), CHANNEL);
        let posted = producer
            .enqueue(QueuedTaskProduceInfo::new("ping", "tests", None, 1))
            .await?;

        let task = task_row(&pool, posted.id).await?.expect("task row exists");
        let mut repost = QueuedTaskProduceInfo::repost(&task, Status::Error);
        let retry_at = Timestamp::now()
            .checked_add(1.hour())
            .expect("in range");
        repost.locked_until = Some(retry_at);

        let reposted = producer.enqueue(repost).await?;
        assert_eq!(reposted.id, posted.id);
        assert_ne!(reposted.lock_handle_id, posted.lock_handle_id);

        let task = task_row(&pool, posted.id).await?.expect("task row exists");
        assert_eq!(task.lock_handle_id, reposted.lock_handle_id);
        assert!(task.locked_until > Timestamp::now());

        let result = result_row(&pool, posted.id).await?;
        assert_eq!(result.status, Status::Error);

        let (rows,): (i64,) = sqlx::query_as("select count(*) from stakhanov.task_queue")
            .fetch_one(&pool)
            .await?;
        assert_eq!(rows, 1);

        Ok(())
    }

    #[sqlx::test]
    async fn stale_repost_is_refused(pool: PgPool) -> sqlx::Result<(), Error> {
        let producer = TaskQueueProducer::new(pool.clone(), CHANNEL);
        let posted = producer
            .enqueue(QueuedTaskProduceInfo::new("ping", "tests", None, 1))
            .await?;
        let stale = task_row(&pool, posted.id).await?.expect("task row exists");

        // Someone else takes the task over first.
        let mut first = QueuedTaskProduceInfo::repost(&stale, Status::Error);
        let retry_at = Timestamp::now().checked_add(1.hour()).expect("in range");
        first.locked_until = Some(retry_at);
        let reposted = producer.enqueue(first).await?;

        let err = producer
            .enqueue(QueuedTaskProduceInfo::repost(&stale, Status::Unprocessed))
            .await
            .expect_err("lease was taken over");
        assert!(matches!(
            err,
            Error::LeaseLost { id, lock_handle_id }
                if id == posted.id && lock_handle_id == posted.lock_handle_id
        ));

        let task = task_row(&pool, posted.id).await?.expect("task row exists");
        assert_eq!(task.lock_handle_id, reposted.lock_handle_id);
        assert!(task.locked_until > Timestamp::now());
        assert_eq!(result_row(&pool, posted.id).await?.status, Status::Error);

        Ok(())
    }

    #[sqlx::test]
    async fn leased_repost_never_recreates_a_finished_task(
        pool: PgPool,
    ) -> sqlx::Result<(), Error> {
        let producer = TaskQueueProducer::new(pool.clone(), CHANNEL);
        let posted = producer
            .enqueue(QueuedTaskProduceInfo::new("ping", "tests", None, 1))
            .await?;
        let task = task_row(&pool, posted.id).await?.expect("task row exists");

        sqlx::query("delete from stakhanov.task_queue where task_id = $1")
            .bind(posted.id)
            .execute(&pool)
            .await?;

        let err = producer
            .enqueue(QueuedTaskProduceInfo::repost(&task, Status::Unprocessed))
            .await
            .expect_err("task is gone");
        assert!(matches!(err, Error::LeaseLost { .. }));
        assert!(task_row(&pool, posted.id).await?.is_none());

        Ok(())
    }

    #[sqlx::test]
    async fn rejects_invalid_posts(pool: PgPool) -> sqlx::Result<(), Error> {
        let producer = TaskQueueProducer::new(pool.clone(), CHANNEL);

        let err = producer
            .enqueue(QueuedTaskProduceInfo::new("ping", "tests", None, -1))
            .await
            .expect_err("negative priority");
        assert!(matches!(err, Error::InvalidPriority(-1)));

        let err = producer
            .enqueue(QueuedTaskProduceInfo::new("ping", " ", None, 0))
            .await
            .expect_err("empty source");
        assert!(matches!(err, Error::EmptySource));

        let (rows,): (i64,) = sqlx::query_as("select count(*) from stakhanov.task_result")
            .fetch_one(&pool)
            .await?;
        assert_eq!(rows, 0);

        Ok(())
    }

    #[sqlx::test]
    async fn failed_transaction_writes_nothing(pool: PgPool) -> sqlx::Result<(), Error> {
        let producer = TaskQueueProducer::new(pool.clone(), CHANNEL);

        let mut tx = pool.begin().await?;
        let posted = producer
            .enqueue_in(&mut tx, QueuedTaskProduceInfo::new("ping", "tests", None, 0))
            .await?;
        tx.rollback().await?;

        assert!(task_row(&pool, posted.id).await?.is_none());

        Ok(())
    }
}
