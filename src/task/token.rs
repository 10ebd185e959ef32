use super::{
    result::{QueuedTaskProduceInfo, QueuedTaskResult, Result, Status, TaskExecutionResult},
    QueuedTask,
};
use crate::timestamp::Timestamp;

/// Exclusive handle to a leased task.
///
/// Created by the consumer at dequeue time and handed to exactly one worker,
/// which owns it until the task's result has been posted.
#[derive(Debug)]
pub struct QueuedTaskToken {
    task: QueuedTask,
    result: QueuedTaskResult,
    status_before_dequeue: Status,
    dequeued_at: Timestamp,
}

impl QueuedTaskToken {
    pub(crate) fn new(
        task: QueuedTask,
        result: QueuedTaskResult,
        status_before_dequeue: Status,
        dequeued_at: Timestamp,
    ) -> Self {
        Self {
            task,
            result,
            status_before_dequeue,
            dequeued_at,
        }
    }

    /// The leased task.
    pub fn dequeued_task(&self) -> &QueuedTask {
        &self.task
    }

    /// The task's result as of the last transition.
    pub fn last_result(&self) -> &QueuedTaskResult {
        &self.result
    }

    /// When the lease was acquired.
    pub fn dequeued_at(&self) -> Timestamp {
        self.dequeued_at
    }

    /// Applies the outcome of an execution attempt to this token's result.
    ///
    /// Repost instructions are bound to this token's lease.
    pub fn apply(&mut self, result: &TaskExecutionResult) -> Result<Option<QueuedTaskProduceInfo>> {
        let lease = self.task.lock_handle_id;
        let repost = self.result.apply(result)?;
        Ok(repost.map(|info| QueuedTaskProduceInfo {
            lease: Some(lease),
            ..info
        }))
    }

    /// Repost instructions that return the task to the queue as it was before
    /// it was dequeued.
    pub fn to_repost(&self) -> QueuedTaskProduceInfo {
        QueuedTaskProduceInfo::repost(&self.task, self.status_before_dequeue)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::task::{result::QueuedTaskError, tests::token_with_id};

    #[test]
    fn reposts_are_bound_to_the_lease() -> Result {
        let mut token = token_with_id(Uuid::new_v4());
        let lease = token.dequeued_task().lock_handle_id;

        assert_eq!(token.to_repost().lease, Some(lease));
        assert_eq!(token.to_repost().status, Status::Unprocessed);

        let failure = TaskExecutionResult::failed(
            QueuedTaskError::new("transient", "connection reset"),
            true,
            3,
            Timestamp::now(),
            5,
        );
        let repost = token.apply(&failure)?.expect("recoverable failures repost");
        assert_eq!(repost.lease, Some(lease));
        assert_eq!(repost.status, Status::Error);

        Ok(())
    }
}
