//! The two gates the poller waits on.
//!
//! - The **buffer gate** starts open. The poller closes it right before it
//!   checks for buffer space. Retrieving a task from the buffer reopens it.
//! - The **dequeue gate** starts closed. The poller closes it right before
//!   each dequeue attempt. A "clear for dequeue" signal from the consumer
//!   reopens it.
//!
//! Closing a gate before checking the condition it guards means a signal that
//! arrives in between leaves the gate open, so no wakeup is missed. Once stop
//! is requested both gates stay open until the poller is started again.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::TaskBuffer,
    consumer::ClearForDequeueReason,
    metrics::{AppMetric, AppMetricId, AppMetricsCollection, AppMetricsProvider},
};

/// A type alias for gate waits.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Gate wait errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The wait was aborted through its cancellation token.
    #[error("Wait was cancelled.")]
    Cancelled,
}

#[derive(Debug)]
struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    fn new(open: bool) -> Self {
        let (open, _) = watch::channel(open);
        Self { open }
    }

    fn open(&self) {
        self.open.send_replace(true);
    }

    // The stop flag is read under the gate's lock so that a close can never
    // land after the open issued by a stop request.
    fn close_unless(&self, stop_requested: &AtomicBool) {
        self.open.send_if_modified(|open| {
            if stop_requested.load(Ordering::Acquire) || !*open {
                return false;
            }
            *open = false;
            true
        });
    }

    fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    async fn wait(&self, cancellation_token: &CancellationToken) -> Result {
        let mut open = self.open.subscribe();
        tokio::select! {
            biased;

            _ = cancellation_token.cancelled() => Err(Error::Cancelled),

            opened = open.wait_for(|open| *open) => {
                opened.map(|_| ()).map_err(|_| Error::Cancelled)
            }
        }
    }
}

/// Coordinates the poller with the buffer and the consumer.
#[derive(Debug)]
pub struct PollerSynchronizationPolicy {
    buffer: Arc<TaskBuffer>,
    clear_for_dequeue: watch::Receiver<Option<ClearForDequeueReason>>,
    buffer_gate: Arc<Gate>,
    dequeue_gate: Arc<Gate>,
    stop_requested: AtomicBool,
    forwarding: Mutex<Option<CancellationToken>>,
    metrics: AppMetricsCollection,
}

impl PollerSynchronizationPolicy {
    /// Creates a policy over `buffer` and the consumer's clear signal.
    pub fn new(
        buffer: Arc<TaskBuffer>,
        clear_for_dequeue: watch::Receiver<Option<ClearForDequeueReason>>,
    ) -> Self {
        Self {
            buffer,
            clear_for_dequeue,
            buffer_gate: Arc::new(Gate::new(true)),
            dequeue_gate: Arc::new(Gate::new(false)),
            stop_requested: AtomicBool::new(false),
            forwarding: Mutex::new(None),
            metrics: AppMetricsCollection::new(&[
                AppMetricId::POLLER_WAIT_FOR_BUFFER_SPACE_COUNT,
                AppMetricId::POLLER_WAIT_FOR_DEQUEUE_COUNT,
            ]),
        }
    }

    /// Subscribes the gates to their signals.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn notify_poller_started(&self) {
        let mut forwarding = self.forwarding.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = forwarding.take() {
            previous.cancel();
        }

        self.stop_requested.store(false, Ordering::Release);
        self.buffer_gate.open();
        self.dequeue_gate.open.send_replace(false);

        let cancellation_token = CancellationToken::new();

        tokio::spawn(forward(
            self.buffer.subscribe_retrieved(),
            self.buffer_gate.clone(),
            cancellation_token.clone(),
        ));
        tokio::spawn(forward(
            self.clear_for_dequeue.clone(),
            self.dequeue_gate.clone(),
            cancellation_token.clone(),
        ));

        *forwarding = Some(cancellation_token);
    }

    /// Unsubscribes the gates and opens both.
    pub fn notify_poller_stop_requested(&self) {
        if let Some(forwarding) = self
            .forwarding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            forwarding.cancel();
        }

        self.stop_requested.store(true, Ordering::Release);
        self.buffer_gate.open();
        self.dequeue_gate.open();
    }

    /// Waits until the buffer has space.
    ///
    /// Returns at once if the buffer is not full.
    pub async fn wait_for_clear_to_add_to_buffer(
        &self,
        cancellation_token: &CancellationToken,
    ) -> Result {
        self.buffer_gate.close_unless(&self.stop_requested);
        if !self.buffer.is_full() {
            return Ok(());
        }

        self.metrics.update(AppMetricId::POLLER_WAIT_FOR_BUFFER_SPACE_COUNT, |m| {
            m.increment();
        });
        tracing::debug!("Waiting for buffer space");

        self.buffer_gate.wait(cancellation_token).await
    }

    /// Closes the dequeue gate ahead of a dequeue attempt.
    pub fn prepare_to_dequeue(&self) {
        self.dequeue_gate.close_unless(&self.stop_requested);
    }

    /// Waits for a signal that a dequeue may find something.
    ///
    /// Any signal since the last [`prepare_to_dequeue`](Self::prepare_to_dequeue)
    /// releases the wait at once.
    pub async fn wait_for_clear_to_dequeue(&self, cancellation_token: &CancellationToken) -> Result {
        self.metrics.update(AppMetricId::POLLER_WAIT_FOR_DEQUEUE_COUNT, |m| {
            m.increment();
        });
        tracing::debug!("Waiting for clear to dequeue");

        self.dequeue_gate.wait(cancellation_token).await
    }

    /// Returns `true` while the buffer gate is open.
    pub fn is_clear_to_add_to_buffer(&self) -> bool {
        self.buffer_gate.is_open()
    }

    /// Returns `true` while the dequeue gate is open.
    pub fn is_clear_to_dequeue(&self) -> bool {
        self.dequeue_gate.is_open()
    }
}

impl AppMetricsProvider for PollerSynchronizationPolicy {
    fn collect_metrics(&self) -> Vec<AppMetric> {
        self.metrics.collect()
    }
}

async fn forward<T>(
    mut signal: watch::Receiver<T>,
    gate: Arc<Gate>,
    cancellation_token: CancellationToken,
) {
    signal.borrow_and_update();

    loop {
        tokio::select! {
            biased;

            _ = cancellation_token.cancelled() => break,

            changed = signal.changed() => {
                if changed.is_err() {
                    break;
                }
                gate.open();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::task::tests::token_with_id;

    fn policy(
        capacity: usize,
    ) -> (
        Arc<TaskBuffer>,
        watch::Sender<Option<ClearForDequeueReason>>,
        PollerSynchronizationPolicy,
    ) {
        let buffer = Arc::new(TaskBuffer::new(capacity));
        let (clear, clear_rx) = watch::channel(None);
        let policy = PollerSynchronizationPolicy::new(buffer.clone(), clear_rx);
        (buffer, clear, policy)
    }

    #[tokio::test]
    async fn gates_start_buffer_open_dequeue_closed() {
        let (_buffer, _clear, policy) = policy(1);
        policy.notify_poller_started();

        assert!(policy.is_clear_to_add_to_buffer());
        assert!(!policy.is_clear_to_dequeue());
    }

    #[tokio::test]
    async fn buffer_space_returns_immediately_when_not_full() -> Result {
        let (_buffer, _clear, policy) = policy(1);
        policy.notify_poller_started();

        policy
            .wait_for_clear_to_add_to_buffer(&CancellationToken::new())
            .await?;

        assert_eq!(
            policy
                .query_metric(AppMetricId::POLLER_WAIT_FOR_BUFFER_SPACE_COUNT)
                .map(|m| m.value()),
            Some(0)
        );

        Ok(())
    }

    #[tokio::test]
    async fn retrieval_opens_buffer_gate() -> Result {
        let (buffer, _clear, policy) = policy(1);
        let policy = Arc::new(policy);
        policy.notify_poller_started();
        buffer
            .try_add_new_task(token_with_id(Uuid::new_v4()))
            .expect("space available");

        let waiter = tokio::spawn({
            let policy = policy.clone();
            async move {
                policy
                    .wait_for_clear_to_add_to_buffer(&CancellationToken::new())
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        buffer.try_get_next_task();

        let waited = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("gate opened")
            .expect("waiter did not panic");
        assert_eq!(waited, Ok(()));

        Ok(())
    }

    #[tokio::test]
    async fn clear_signal_opens_dequeue_gate() {
        let (_buffer, clear, policy) = policy(1);
        let policy = Arc::new(policy);
        policy.notify_poller_started();
        policy.prepare_to_dequeue();

        let waiter = tokio::spawn({
            let policy = policy.clone();
            async move { policy.wait_for_clear_to_dequeue(&CancellationToken::new()).await }
        });

        clear.send_replace(Some(ClearForDequeueReason::NewTaskNotified));

        let waited = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("gate opened")
            .expect("waiter did not panic");
        assert_eq!(waited, Ok(()));
    }

    #[tokio::test]
    async fn signal_before_wait_is_not_missed() {
        let (_buffer, clear, policy) = policy(1);
        policy.notify_poller_started();
        policy.prepare_to_dequeue();

        clear.send_replace(Some(ClearForDequeueReason::ListenerTimedOut));
        // Let the forwarder observe the signal.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waited = tokio::time::timeout(
            Duration::from_millis(100),
            policy.wait_for_clear_to_dequeue(&CancellationToken::new()),
        )
        .await;
        assert_eq!(waited, Ok(Ok(())));
    }

    #[tokio::test]
    async fn cancellation_is_distinguishable() {
        let (buffer, _clear, policy) = policy(1);
        policy.notify_poller_started();
        buffer
            .try_add_new_task(token_with_id(Uuid::new_v4()))
            .expect("space available");

        let cancellation_token = CancellationToken::new();
        cancellation_token.cancel();

        assert_eq!(
            policy.wait_for_clear_to_add_to_buffer(&cancellation_token).await,
            Err(Error::Cancelled)
        );
        policy.prepare_to_dequeue();
        assert_eq!(
            policy.wait_for_clear_to_dequeue(&cancellation_token).await,
            Err(Error::Cancelled)
        );
    }

    #[tokio::test]
    async fn stop_request_opens_both_gates() {
        let (buffer, _clear, policy) = policy(1);
        let policy = Arc::new(policy);
        policy.notify_poller_started();
        buffer
            .try_add_new_task(token_with_id(Uuid::new_v4()))
            .expect("space available");
        policy.prepare_to_dequeue();

        let space = tokio::spawn({
            let policy = policy.clone();
            async move {
                policy
                    .wait_for_clear_to_add_to_buffer(&CancellationToken::new())
                    .await
            }
        });
        let dequeue = tokio::spawn({
            let policy = policy.clone();
            async move { policy.wait_for_clear_to_dequeue(&CancellationToken::new()).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        policy.notify_poller_stop_requested();

        for waiter in [space, dequeue] {
            let waited = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("gate opened")
                .expect("waiter did not panic");
            assert_eq!(waited, Ok(()));
        }

        // Closing has no effect once stop was requested.
        policy.prepare_to_dequeue();
        assert!(policy.is_clear_to_dequeue());
    }
}
