//! Tasks are the units of work moved through the queue.
//!
//! A [`QueuedTask`] is the identity and payload of one unit of work. Each task
//! is paired with exactly one [`QueuedTaskResult`], created at post time and
//! then advanced only through [`QueuedTaskResult::apply`], the result state
//! machine.
//!
//! Workers never act on a task directly. Instead, dequeuing yields a
//! [`QueuedTaskToken`], which bundles the leased task with its current result
//! and the moment the lease was acquired.
//!
//! # Priorities
//!
//! Lower priority values are dequeued first. Among tasks of equal priority,
//! the task whose lease expired earliest wins, and lock handle ids break any
//! remaining tie.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timestamp::Timestamp;

pub use self::{
    result::{
        Error as ResultError, QueuedTaskError, QueuedTaskProduceInfo, QueuedTaskResult, Status,
        TaskExecutionOutcome, TaskExecutionResult,
    },
    retry_policy::{BackoffStrategy, Recoverability, RetryCalculator},
    token::QueuedTaskToken,
};

pub mod result;
pub mod retry_policy;
mod token;

/// A type alias for task identifiers.
pub type Id = Uuid;

/// A type alias for store-assigned lock handle identifiers.
pub type LockHandleId = i64;

/// One unit of work as held by the queue.
///
/// Equality and hashing consider the [`Id`] only. A task with a nil id has not
/// been assigned an identity yet and is equal to nothing but itself.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueuedTask {
    /// Unique and immutable task identifier.
    #[sqlx(rename = "task_id")]
    pub id: Id,

    /// Identifies the lease under which the task was dequeued.
    #[sqlx(rename = "task_lock_handle_id")]
    pub lock_handle_id: LockHandleId,

    /// Logical payload kind, used to find an executor.
    #[sqlx(rename = "task_type")]
    pub task_type: String,

    /// Describes who posted the task.
    #[sqlx(rename = "task_source")]
    pub source: String,

    /// The serialized payload.
    #[sqlx(rename = "task_payload")]
    pub payload: Option<serde_json::Value>,

    /// Ordering key; lower values are dequeued first.
    #[sqlx(rename = "task_priority")]
    pub priority: i32,

    /// When the task was (last) posted.
    #[sqlx(rename = "task_posted_at_ts")]
    pub posted_at: Timestamp,

    /// Lease expiry. The task is eligible for dequeue once this has passed.
    #[sqlx(rename = "task_locked_until_ts")]
    pub locked_until: Timestamp,
}

impl QueuedTask {
    /// Returns `true` once the task has been given an identity.
    pub fn has_id(&self) -> bool {
        !self.id.is_nil()
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }

        self.has_id() && self.id == other.id
    }
}

impl Eq for QueuedTask {}

impl Hash for QueuedTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
