//! Persistent subscription to the new-task notification channel.
//!
//! The listener owns one dedicated connection on which it `LISTEN`s. Each wait
//! cycle is bounded by a timeout and ends in exactly one of three ways:
//!
//! - a notification arrives: [`ListenerEvent::NewTaskPosted`] is raised,
//! - the timeout elapses: [`ListenerEvent::TimedOut`] is raised,
//! - the connection is lost: the listener moves to
//!   [`ListenerState::Reconnecting`] and retries with backoff until a fresh
//!   subscription is in place, then raises
//!   [`ListenerEvent::ConnectionRestored`].
//!
//! Connection loss is never surfaced as an error. It only shows up in the
//! reconnect counter and as a delay before notifications resume.

use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgListener, PgPool};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    metrics::{AppMetric, AppMetricId, AppMetricsCollection, AppMetricsProvider},
    task::BackoffStrategy,
};

const RECONNECT_BACKOFF: BackoffStrategy = BackoffStrategy::exponential(100, 2.0, 5_000);

/// Lifecycle of a [`NotificationListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Not running.
    Stopped,
    /// Establishing the first subscription.
    Starting,
    /// Subscribed and waiting for notifications.
    Listening,
    /// Re-establishing a lost subscription.
    Reconnecting,
}

/// Activity reported by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The first subscription was established.
    Connected,
    /// A notification arrived on the channel.
    NewTaskPosted,
    /// A wait cycle ended without a notification.
    TimedOut,
    /// A lost subscription was re-established.
    ConnectionRestored,
}

/// Receives listener events.
///
/// Handlers are called from the listener's task and must not block.
pub trait NotificationHandler: Send + Sync + 'static {
    /// Handles one event.
    fn handle(&self, event: ListenerEvent);
}

impl NotificationHandler for mpsc::UnboundedSender<ListenerEvent> {
    fn handle(&self, event: ListenerEvent) {
        // A closed receiver simply has no interest left.
        let _ = self.send(event);
    }
}

struct Shared {
    pool: PgPool,
    channel: String,
    wait_timeout: Duration,
    handler: Arc<dyn NotificationHandler>,
    state: watch::Sender<ListenerState>,
    metrics: AppMetricsCollection,
}

struct Running {
    shutdown_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Reconnecting listener for the new-task notification channel.
pub struct NotificationListener {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl NotificationListener {
    /// Creates a stopped listener for `channel`.
    ///
    /// Each wait for a notification is bounded by `wait_timeout`.
    pub fn new(
        pool: PgPool,
        channel: impl Into<String>,
        wait_timeout: Duration,
        handler: Arc<dyn NotificationHandler>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Stopped);

        Self {
            shared: Arc::new(Shared {
                pool,
                channel: channel.into(),
                wait_timeout,
                handler,
                state,
                metrics: AppMetricsCollection::new(&[
                    AppMetricId::LISTENER_TASK_NOTIFICATION_COUNT,
                    AppMetricId::LISTENER_RECONNECT_COUNT,
                    AppMetricId::LISTENER_NOTIFICATION_WAIT_TIMEOUT_COUNT,
                ]),
            }),
            running: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ListenerState {
        *self.shared.state.borrow()
    }

    /// Returns `true` while the listener is running.
    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Starts listening in a background task.
    ///
    /// Returns once the task is spawned; the first subscription is made in
    /// the background. Starting a started listener does nothing.
    #[tracing::instrument(skip(self), fields(channel = %self.shared.channel))]
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Listener already started");
            return;
        }

        self.shared.state.send_replace(ListenerState::Starting);

        let shutdown_token = CancellationToken::new();
        let handle = tokio::spawn(listen(self.shared.clone(), shutdown_token.clone()));

        *running = Some(Running {
            shutdown_token,
            handle,
        });
    }

    /// Stops listening and waits for the background task to exit.
    ///
    /// Safe to call in any state, including while reconnecting. No events
    /// are raised after this returns.
    #[tracing::instrument(skip(self), fields(channel = %self.shared.channel))]
    pub async fn stop(&self) {
        let Some(Running {
            shutdown_token,
            handle,
        }) = self.running.lock().await.take()
        else {
            tracing::debug!("Listener already stopped");
            return;
        };

        shutdown_token.cancel();
        if let Err(err) = handle.await {
            tracing::error!(%err, "Listener task did not exit cleanly");
        }

        self.shared.state.send_replace(ListenerState::Stopped);
        tracing::info!("Listener stopped");
    }
}

impl AppMetricsProvider for NotificationListener {
    fn collect_metrics(&self) -> Vec<AppMetric> {
        self.shared.metrics.collect()
    }
}

async fn listen(shared: Arc<Shared>, shutdown_token: CancellationToken) {
    let Some(mut listener) = shared.connect(&shutdown_token).await else {
        return;
    };

    shared.state.send_replace(ListenerState::Listening);
    tracing::info!(channel = %shared.channel, "Listener connected");
    shared.handler.handle(ListenerEvent::Connected);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_token.cancelled() => break,

            received = tokio::time::timeout(shared.wait_timeout, listener.try_recv()) => {
                match received {
                    Ok(Ok(Some(_))) => {
                        shared.metrics.update(AppMetricId::LISTENER_TASK_NOTIFICATION_COUNT, |m| {
                            m.increment();
                        });
                        shared.handler.handle(ListenerEvent::NewTaskPosted);
                    }

                    Err(_elapsed) => {
                        shared.metrics.update(AppMetricId::LISTENER_NOTIFICATION_WAIT_TIMEOUT_COUNT, |m| {
                            m.increment();
                        });
                        shared.handler.handle(ListenerEvent::TimedOut);
                    }

                    Ok(lost) => {
                        match lost {
                            Err(err) => tracing::warn!(%err, "Listener connection lost, reconnecting"),
                            Ok(_) => tracing::warn!("Listener connection closed, reconnecting"),
                        }

                        shared.metrics.update(AppMetricId::LISTENER_RECONNECT_COUNT, |m| {
                            m.increment();
                        });
                        shared.state.send_replace(ListenerState::Reconnecting);
                        drop(listener);

                        let Some(restored) = shared.connect(&shutdown_token).await else {
                            break;
                        };
                        listener = restored;

                        shared.state.send_replace(ListenerState::Listening);
                        tracing::info!(channel = %shared.channel, "Listener connection restored");
                        shared.handler.handle(ListenerEvent::ConnectionRestored);
                    }
                }
            }
        }
    }
}

impl Shared {
    // Retries until subscribed; only gives up when shutdown is requested.
    async fn connect(&self, shutdown_token: &CancellationToken) -> Option<PgListener> {
        let mut attempt = 0;

        loop {
            let connected = tokio::select! {
                _ = shutdown_token.cancelled() => return None,
                connected = self.subscribe() => connected,
            };

            match connected {
                Ok(listener) => return Some(listener),
                Err(err) => {
                    attempt += 1;
                    let delay_ms = RECONNECT_BACKOFF.calculate_delay_ms(attempt);
                    tracing::warn!(%err, attempt, delay_ms, "Failed to subscribe, retrying");

                    tokio::select! {
                        _ = shutdown_token.cancelled() => return None,
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms as u64)) => {}
                    }
                }
            }
        }
    }

    async fn subscribe(&self) -> sqlx::Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        Ok(listener)
    }
}
