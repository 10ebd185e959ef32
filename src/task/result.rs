//! Per-task results and the state machine that advances them.
//!
//! Every attempt at executing a task ends in a [`TaskExecutionResult`].
//! Applying it to the task's [`QueuedTaskResult`] decides the new [`Status`]
//! and whether the task must be reposted for another attempt:
//!
//! | Outcome                  | Error count after      | Status      | Repost |
//! |--------------------------|------------------------|-------------|--------|
//! | Succeeded                |                        | `Processed` | no     |
//! | Cancelled                |                        | `Cancelled` | no     |
//! | Failed, recoverable      | `<= threshold`         | `Error`     | yes    |
//! | Failed, recoverable      | `== threshold + 1`     | `Faulted`   | yes    |
//! | Failed, recoverable      | `> threshold + 1`      | `Fatal`     | no     |
//! | Failed, not recoverable  |                        | `Fatal`     | no     |
//!
//! `Processed`, `Cancelled` and `Fatal` are terminal: applying anything to a
//! terminal result is a contract violation and fails with
//! [`Error::AlreadyFinalized`].

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use super::{Id, LockHandleId, QueuedTask};
use crate::timestamp::Timestamp;

/// A type alias for state machine results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Result state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transition was applied to a result that is already terminal.
    #[error("Result of task {id} is already finalized as {status:?}.")]
    AlreadyFinalized {
        /// The task whose result was targeted.
        id: Id,
        /// The terminal status the result holds.
        status: Status,
    },
}

/// Processing status of a task.
///
/// Stored as an integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
pub enum Status {
    /// Posted and never attempted.
    Unprocessed = 1,

    /// Leased by a consumer and being executed.
    Processing = 2,

    /// Executed successfully.
    Processed = 3,

    /// Failed recoverably and scheduled for another attempt.
    Error = 4,

    /// Failed past the fault threshold; one last attempt remains.
    Faulted = 5,

    /// Failed for good. Needs an operator to repost it.
    Fatal = 6,

    /// Execution was cancelled.
    Cancelled = 7,
}

impl Status {
    /// Returns `true` for statuses that permit no further transition.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Status::Processed | Status::Fatal | Status::Cancelled)
    }

    /// The integer code the status is stored as.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Statuses whose tasks may still be dequeued.
    pub const RESUMABLE: [Status; 4] = [
        Status::Unprocessed,
        Status::Processing,
        Status::Error,
        Status::Faulted,
    ];

    /// Statuses that end processing.
    pub const TERMINAL: [Status; 3] = [Status::Processed, Status::Fatal, Status::Cancelled];
}

/// Summary of the error captured during a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTaskError {
    /// The kind of error, e.g. `timeout`.
    #[serde(rename = "type")]
    pub error_type: String,

    /// Human readable message.
    pub message: String,

    /// Chain of underlying causes, outermost first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl QueuedTaskError {
    /// Creates an error summary.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack_trace: None,
        }
    }
}

/// How an execution attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskExecutionOutcome {
    /// The executor returned successfully.
    Succeeded,

    /// The execution was cancelled before it could finish.
    Cancelled,

    /// The executor failed.
    Failed {
        /// The captured error.
        error: QueuedTaskError,
        /// Whether another attempt may succeed.
        is_recoverable: bool,
    },
}

/// The immutable outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskExecutionResult {
    outcome: TaskExecutionOutcome,
    processing_time_ms: i64,
    retry_at: Timestamp,
    fault_error_threshold_count: i32,
}

impl TaskExecutionResult {
    /// A successful attempt.
    pub fn successful(processing_time_ms: i64, fault_error_threshold_count: i32) -> Self {
        Self {
            outcome: TaskExecutionOutcome::Succeeded,
            processing_time_ms,
            retry_at: Timestamp::now(),
            fault_error_threshold_count,
        }
    }

    /// A cancelled attempt.
    pub fn cancelled(processing_time_ms: i64, fault_error_threshold_count: i32) -> Self {
        Self {
            outcome: TaskExecutionOutcome::Cancelled,
            processing_time_ms,
            retry_at: Timestamp::now(),
            fault_error_threshold_count,
        }
    }

    /// A failed attempt which, if reposted, becomes eligible at `retry_at`.
    pub fn failed(
        error: QueuedTaskError,
        is_recoverable: bool,
        processing_time_ms: i64,
        retry_at: Timestamp,
        fault_error_threshold_count: i32,
    ) -> Self {
        Self {
            outcome: TaskExecutionOutcome::Failed {
                error,
                is_recoverable,
            },
            processing_time_ms,
            retry_at,
            fault_error_threshold_count,
        }
    }

    /// How the attempt ended.
    pub fn outcome(&self) -> &TaskExecutionOutcome {
        &self.outcome
    }

    /// Returns `true` if the attempt succeeded.
    pub fn executed_successfully(&self) -> bool {
        matches!(self.outcome, TaskExecutionOutcome::Succeeded)
    }

    /// Returns `true` if the attempt was cancelled.
    pub fn execution_cancelled(&self) -> bool {
        matches!(self.outcome, TaskExecutionOutcome::Cancelled)
    }

    /// Returns `true` if the attempt failed.
    pub fn execution_failed(&self) -> bool {
        matches!(self.outcome, TaskExecutionOutcome::Failed { .. })
    }

    /// The captured error, present only for failures.
    pub fn error(&self) -> Option<&QueuedTaskError> {
        match &self.outcome {
            TaskExecutionOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Whether a failure may succeed on another attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.outcome,
            TaskExecutionOutcome::Failed {
                is_recoverable: true,
                ..
            }
        )
    }

    /// How long the attempt took.
    pub fn processing_time_ms(&self) -> i64 {
        self.processing_time_ms
    }

    /// When a reposted task becomes eligible again.
    pub fn retry_at(&self) -> Timestamp {
        self.retry_at
    }

    /// Recoverable failures tolerated before the task is faulted.
    pub fn fault_error_threshold_count(&self) -> i32 {
        self.fault_error_threshold_count
    }
}

/// Instructions for posting, or reposting, a task.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTaskProduceInfo {
    /// Identity to reuse; `None` posts a new task.
    pub id: Option<Id>,

    /// Logical payload kind.
    pub task_type: String,

    /// Who posted the task.
    pub source: String,

    /// The serialized payload.
    pub payload: Option<serde_json::Value>,

    /// Ordering key; lower values are dequeued first.
    pub priority: i32,

    /// When the task becomes eligible; `None` means immediately.
    pub locked_until: Option<Timestamp>,

    /// The status the result row is upserted with.
    pub status: Status,

    /// Lease the repost is made under. When set, the repost only goes through
    /// while the queue row still carries this lock handle.
    pub lease: Option<LockHandleId>,
}

impl QueuedTaskProduceInfo {
    /// Instructions for a brand new task.
    pub fn new(
        task_type: impl Into<String>,
        source: impl Into<String>,
        payload: Option<serde_json::Value>,
        priority: i32,
    ) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            source: source.into(),
            payload,
            priority,
            locked_until: None,
            status: Status::Unprocessed,
            lease: None,
        }
    }

    /// Instructions to post `task` again, unchanged, for immediate pickup.
    ///
    /// The repost is made under the task's current lease.
    pub fn repost(task: &QueuedTask, status: Status) -> Self {
        Self {
            id: Some(task.id),
            task_type: task.task_type.clone(),
            source: task.source.clone(),
            payload: task.payload.clone(),
            priority: task.priority,
            locked_until: None,
            status,
            lease: Some(task.lock_handle_id),
        }
    }
}

/// The single result row kept for each task.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct QueuedTaskResult {
    /// The task this result belongs to.
    #[sqlx(rename = "task_id")]
    pub id: Id,

    /// Logical payload kind.
    #[sqlx(rename = "task_type")]
    pub task_type: String,

    /// Who posted the task.
    #[sqlx(rename = "task_source")]
    pub source: String,

    /// The serialized payload.
    #[sqlx(rename = "task_payload")]
    pub payload: Option<serde_json::Value>,

    /// Current processing status.
    #[sqlx(rename = "task_status")]
    pub status: Status,

    /// Ordering key of the task.
    #[sqlx(rename = "task_priority")]
    pub priority: i32,

    /// The most recent error.
    #[sqlx(rename = "task_last_error")]
    pub last_error: Option<Json<QueuedTaskError>>,

    /// Whether the most recent error was recoverable.
    #[sqlx(rename = "task_last_error_is_recoverable")]
    pub last_error_is_recoverable: bool,

    /// Failed attempts so far.
    #[sqlx(rename = "task_error_count")]
    pub error_count: i32,

    /// Duration of the most recent attempt.
    #[sqlx(rename = "task_processing_time_milliseconds")]
    pub processing_time_ms: i64,

    /// When the task was (last) posted.
    #[sqlx(rename = "task_posted_at_ts")]
    pub posted_at: Timestamp,

    /// When the first attempt was made.
    #[sqlx(rename = "task_first_processing_attempted_at_ts")]
    pub first_processing_attempted_at: Option<Timestamp>,

    /// When the latest attempt was made.
    #[sqlx(rename = "task_last_processing_attempted_at_ts")]
    pub last_processing_attempted_at: Option<Timestamp>,

    /// When the task reached a terminal status.
    #[sqlx(rename = "task_processing_finalized_at_ts")]
    pub processing_finalized_at: Option<Timestamp>,
}

impl QueuedTaskResult {
    /// A fresh `Unprocessed` result for `task`.
    pub fn from_task(task: &QueuedTask) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type.clone(),
            source: task.source.clone(),
            payload: task.payload.clone(),
            status: Status::Unprocessed,
            priority: task.priority,
            last_error: None,
            last_error_is_recoverable: false,
            error_count: 0,
            processing_time_ms: 0,
            posted_at: task.posted_at,
            first_processing_attempted_at: None,
            last_processing_attempted_at: None,
            processing_finalized_at: None,
        }
    }

    /// The most recent error, if any.
    pub fn last_error(&self) -> Option<&QueuedTaskError> {
        self.last_error.as_ref().map(|Json(err)| err)
    }

    /// Applies the outcome of an attempt made now.
    ///
    /// See [`apply_at`](Self::apply_at).
    pub fn apply(
        &mut self,
        result: &TaskExecutionResult,
    ) -> Result<Option<QueuedTaskProduceInfo>> {
        self.apply_at(result, Timestamp::now())
    }

    /// Applies the outcome of an attempt made at `now`.
    ///
    /// Returns repost instructions when the task deserves another attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyFinalized`] when the result is terminal. The
    /// result is left untouched in that case.
    pub fn apply_at(
        &mut self,
        result: &TaskExecutionResult,
        now: Timestamp,
    ) -> Result<Option<QueuedTaskProduceInfo>> {
        if self.status.is_terminal() {
            return Err(Error::AlreadyFinalized {
                id: self.id,
                status: self.status,
            });
        }

        self.processing_time_ms = result.processing_time_ms();
        self.record_attempt(now);

        match result.outcome() {
            TaskExecutionOutcome::Succeeded => {
                self.status = Status::Processed;
                self.last_error = None;
                self.processing_finalized_at = Some(now);
                Ok(None)
            }

            TaskExecutionOutcome::Cancelled => {
                self.status = Status::Cancelled;
                self.processing_finalized_at = Some(now);
                Ok(None)
            }

            TaskExecutionOutcome::Failed {
                error,
                is_recoverable,
            } => {
                self.error_count += 1;
                self.last_error = Some(Json(error.clone()));
                self.last_error_is_recoverable = *is_recoverable;

                let threshold = result.fault_error_threshold_count();
                self.status = if !is_recoverable || self.error_count > threshold + 1 {
                    Status::Fatal
                } else if self.error_count > threshold {
                    Status::Faulted
                } else {
                    Status::Error
                };

                if self.status == Status::Fatal {
                    self.processing_finalized_at = Some(now);
                    return Ok(None);
                }

                Ok(Some(QueuedTaskProduceInfo {
                    id: Some(self.id),
                    task_type: self.task_type.clone(),
                    source: self.source.clone(),
                    payload: self.payload.clone(),
                    priority: self.priority,
                    locked_until: Some(result.retry_at()),
                    status: self.status,
                    lease: None,
                }))
            }
        }
    }

    fn record_attempt(&mut self, now: Timestamp) {
        if self.first_processing_attempted_at.is_none() {
            self.first_processing_attempted_at = Some(now);
        }
        self.last_processing_attempted_at = Some(now);
    }
}
