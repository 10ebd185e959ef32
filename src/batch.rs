//! Batching of write requests.
//!
//! Callers post payloads to an [`AsyncProcessingRequestBatchProcessor`] and
//! get a [`RequestHandle`] back as soon as the request is accepted. One
//! background loop gathers pending requests into batches of at most
//! `batch_size` and hands each batch to a [`BatchFlush`] implementation.
//!
//! Every request completes on its own, regardless of batch boundaries:
//!
//! - when the flusher reports it written, it completes,
//! - when the flusher reports it failed, or the whole flush fails, its fail
//!   count goes up; it is retried in a later batch until the count reaches
//!   `max_fail_count`, after which it is faulted,
//! - when the flusher rejects it, it ends at once without another attempt,
//! - when its deadline passes before it gets flushed, it times out.
//!
//! A failing request never takes its batch-mates down with it.
//!
//! A request with `max_fail_count = N` is therefore attempted at most `N`
//! times. One that succeeds on attempt `k` completes with a fail count of
//! `k - 1`.
//!
//! The processor knows nothing about what it writes; the result queue and the
//! performance monitor each wrap one.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    metrics::{AppMetric, AppMetricId, AppMetricsCollection, AppMetricsProvider},
    options::BatchOptions,
};

const RETRY_DELAY: Duration = Duration::from_millis(100);

/// A type alias for batch request results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Error returned by a failed flush.
pub type FlushError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Batch request errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Requests are only accepted between start and stop.
    #[error("Batch processor is not running.")]
    NotRunning,

    /// The request failed every attempt it was allowed.
    #[error("Request {id} failed permanently after {fail_count} attempts: {message}")]
    Faulted {
        /// The request.
        id: u64,
        /// Failed attempts.
        fail_count: u32,
        /// The last flush error.
        message: String,
    },

    /// The request was not flushed before its deadline.
    #[error("Request {id} timed out.")]
    TimedOut {
        /// The request.
        id: u64,
    },

    /// The flusher refused the request for good.
    #[error("Request {id} was rejected: {reason}")]
    Rejected {
        /// The request.
        id: u64,
        /// Why it was refused.
        reason: String,
    },
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request was flushed.
    Completed {
        /// Failed attempts before the successful one.
        fail_count: u32,
    },

    /// The request exhausted its attempts.
    Faulted {
        /// Failed attempts.
        fail_count: u32,
        /// The last flush error.
        error: String,
    },

    /// The request's deadline passed.
    TimedOut,

    /// The flusher refused the request.
    Rejected {
        /// Why it was refused.
        reason: String,
    },
}

/// How one request of a flushed batch fared.
#[derive(Debug)]
pub enum RequestStatus {
    /// Written.
    Flushed,

    /// Not written; the request may be attempted again.
    Failed(FlushError),

    /// Can never be written; the request is not attempted again.
    Rejected(String),
}

/// A pending unit of batched work.
#[derive(Debug)]
pub struct AsyncProcessingRequest<T> {
    id: u64,
    payload: T,
    deadline: Instant,
    max_fail_count: u32,
    fail_count: u32,
    completion: oneshot::Sender<Outcome>,
}

impl<T> AsyncProcessingRequest<T> {
    /// Identifies the request within its processor.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The request's payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Failed attempts so far.
    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    /// Attempts allowed in total.
    pub fn max_fail_count(&self) -> u32 {
        self.max_fail_count
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    fn complete(self, outcome: Outcome) {
        // The caller may have stopped waiting.
        let _ = self.completion.send(outcome);
    }
}

/// Requests flushed together.
#[derive(Debug)]
pub struct RequestBatch<T> {
    requests: Vec<AsyncProcessingRequest<T>>,
}

impl<T> RequestBatch<T> {
    /// The payloads in the batch.
    pub fn payloads(&self) -> impl Iterator<Item = &T> {
        self.requests.iter().map(AsyncProcessingRequest::payload)
    }

    /// Number of requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Returns `true` for an empty batch.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Statuses marking every request of the batch as written.
    pub fn all_flushed(&self) -> Vec<RequestStatus> {
        self.requests.iter().map(|_| RequestStatus::Flushed).collect()
    }
}

/// Writes one batch.
pub trait BatchFlush<T>: Send + Sync + 'static {
    /// Flushes `batch` and returns one status per request, in batch order.
    ///
    /// An `Err` fails every request of the batch. A request without a status
    /// counts as failed.
    fn flush(
        &self,
        batch: &RequestBatch<T>,
    ) -> impl Future<Output = std::result::Result<Vec<RequestStatus>, FlushError>> + Send;
}

/// Awaits the completion of one request.
#[derive(Debug)]
pub struct RequestHandle {
    id: u64,
    deadline: Instant,
    completion: oneshot::Receiver<Outcome>,
}

impl RequestHandle {
    /// Identifies the request within its processor.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the request to end, at most until its deadline.
    pub async fn outcome(self) -> Outcome {
        match tokio::time::timeout_at(self.deadline, self.completion).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Outcome::Faulted {
                fail_count: 0,
                error: "Request was dropped by the batch processor".to_string(),
            },
            Err(_) => Outcome::TimedOut,
        }
    }

    /// Waits for the request to end and returns its fail count on success.
    pub async fn wait(self) -> Result<u32> {
        let id = self.id;
        match self.outcome().await {
            Outcome::Completed { fail_count } => Ok(fail_count),
            Outcome::Faulted { fail_count, error } => Err(Error::Faulted {
                id,
                fail_count,
                message: error,
            }),
            Outcome::TimedOut => Err(Error::TimedOut { id }),
            Outcome::Rejected { reason } => Err(Error::Rejected { id, reason }),
        }
    }
}

/// Metric ids a processor reports under.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchMetricIds {
    /// Accepted requests.
    pub post_count: Option<AppMetricId>,
    /// Successful flushes.
    pub write_count: Option<AppMetricId>,
    /// Shortest successful flush.
    pub min_write_duration: Option<AppMetricId>,
    /// Longest successful flush.
    pub max_write_duration: Option<AppMetricId>,
    /// Time spent in successful flushes.
    pub total_write_duration: Option<AppMetricId>,
    /// Requests that timed out.
    pub request_timeout_count: Option<AppMetricId>,
}

impl BatchMetricIds {
    fn collection(&self) -> AppMetricsCollection {
        let initial: Vec<_> = [
            (self.post_count, 0),
            (self.write_count, 0),
            (self.min_write_duration, 0),
            (self.max_write_duration, 0),
            (self.total_write_duration, 0),
            (self.request_timeout_count, 0),
        ]
        .into_iter()
        .filter_map(|(id, value)| id.map(|id| (id, value)))
        .collect();

        AppMetricsCollection::with_initial(&initial)
    }
}

struct Stats {
    ids: BatchMetricIds,
    metrics: AppMetricsCollection,
}

impl Stats {
    fn bump(&self, id: Option<AppMetricId>, f: impl FnOnce(&AppMetric)) {
        if let Some(id) = id {
            self.metrics.update(id, f);
        }
    }

    fn record_write(&self, elapsed_ms: i64) {
        self.bump(self.ids.write_count, |m| {
            m.increment();
        });
        self.bump(self.ids.total_write_duration, |m| {
            m.add(elapsed_ms);
        });
        self.bump(self.ids.max_write_duration, |m| {
            m.max(elapsed_ms);
        });

        // Zero stands for "no write yet".
        self.bump(self.ids.min_write_duration, |m| {
            if m.value() == 0 || elapsed_ms < m.value() {
                m.update(elapsed_ms.max(1));
            }
        });
    }
}

struct Running<T> {
    sender: mpsc::UnboundedSender<AsyncProcessingRequest<T>>,
    shutdown_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Aggregates posted requests into batches and flushes them in the background.
pub struct AsyncProcessingRequestBatchProcessor<T, F> {
    flusher: Arc<F>,
    options: BatchOptions,
    next_id: AtomicU64,
    running: Mutex<Option<Running<T>>>,
    stats: Arc<Stats>,
}

impl<T, F> AsyncProcessingRequestBatchProcessor<T, F>
where
    T: Send + Sync + 'static,
    F: BatchFlush<T>,
{
    /// Creates a stopped processor.
    pub fn new(flusher: F, options: BatchOptions, metric_ids: BatchMetricIds) -> Self {
        Self {
            flusher: Arc::new(flusher),
            options,
            next_id: AtomicU64::new(1),
            running: Mutex::new(None),
            stats: Arc::new(Stats {
                metrics: metric_ids.collection(),
                ids: metric_ids,
            }),
        }
    }

    /// The flush implementation.
    pub fn flusher(&self) -> &F {
        &self.flusher
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Option<Running<T>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the background loop. Starting a running processor does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut running = self.running();
        if running.is_some() {
            tracing::debug!("Batch processor already started");
            return;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown_token = CancellationToken::new();
        let handle = tokio::spawn(process(
            self.flusher.clone(),
            self.options,
            receiver,
            shutdown_token.clone(),
            self.stats.clone(),
        ));

        *running = Some(Running {
            sender,
            shutdown_token,
            handle,
        });
    }

    /// Stops accepting requests and waits for the loop to exit.
    ///
    /// An in-flight flush finishes, and requests accepted before the call are
    /// still flushed (with their remaining attempts) before this returns.
    pub async fn stop(&self) {
        let Some(Running {
            sender,
            shutdown_token,
            handle,
        }) = self.running().take()
        else {
            tracing::debug!("Batch processor already stopped");
            return;
        };

        drop(sender);
        shutdown_token.cancel();

        if let Err(err) = handle.await {
            tracing::error!(%err, "Batch processor loop did not exit cleanly");
        }
    }

    /// Returns `true` between start and stop.
    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Accepts `payload` for flushing.
    ///
    /// Returns once the request is queued, not once it is flushed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] outside of start and stop.
    pub fn post(&self, payload: T) -> Result<RequestHandle> {
        self.post_with_timeout(payload, self.options.request_timeout())
    }

    /// Accepts `payload` for flushing within `timeout` instead of the
    /// configured request timeout.
    pub fn post_with_timeout(&self, payload: T, timeout: Duration) -> Result<RequestHandle> {
        let running = self.running();
        let Some(running) = running.as_ref() else {
            return Err(Error::NotRunning);
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        let (completion, receiver) = oneshot::channel();

        running
            .sender
            .send(AsyncProcessingRequest {
                id,
                payload,
                deadline,
                max_fail_count: self.options.max_fail_count.max(1),
                fail_count: 0,
                completion,
            })
            .map_err(|_| Error::NotRunning)?;

        self.stats.bump(self.stats.ids.post_count, |m| {
            m.increment();
        });

        Ok(RequestHandle {
            id,
            deadline,
            completion: receiver,
        })
    }
}

impl<T, F> AppMetricsProvider for AsyncProcessingRequestBatchProcessor<T, F>
where
    T: Send + 'static,
    F: Send + Sync,
{
    fn collect_metrics(&self) -> Vec<AppMetric> {
        self.stats.metrics.collect()
    }
}

async fn process<T, F>(
    flusher: Arc<F>,
    options: BatchOptions,
    mut receiver: mpsc::UnboundedReceiver<AsyncProcessingRequest<T>>,
    shutdown_token: CancellationToken,
    stats: Arc<Stats>,
) where
    T: Send + Sync + 'static,
    F: BatchFlush<T>,
{
    let batch_size = options.batch_size.max(1);
    let mut pending = VecDeque::new();

    loop {
        if pending.is_empty() {
            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => break,

                received = receiver.recv() => match received {
                    Some(request) => pending.push_back(request),
                    None => break,
                },
            }
        }

        let batch = take_batch(&mut pending, &mut receiver, batch_size, &stats);
        if batch.is_empty() {
            continue;
        }

        if !flush(flusher.as_ref(), batch, &mut pending, &stats).await {
            tokio::select! {
                _ = shutdown_token.cancelled() => {}
                _ = tokio::time::sleep(RETRY_DELAY) => {}
            }
        }
    }

    // Drain what was accepted before stop.
    receiver.close();
    while let Ok(request) = receiver.try_recv() {
        pending.push_back(request);
    }
    while !pending.is_empty() {
        let batch = take_batch(&mut pending, &mut receiver, batch_size, &stats);
        if !batch.is_empty() {
            flush(flusher.as_ref(), batch, &mut pending, &stats).await;
        }
    }

    tracing::debug!("Batch processor loop exited");
}

fn take_batch<T>(
    pending: &mut VecDeque<AsyncProcessingRequest<T>>,
    receiver: &mut mpsc::UnboundedReceiver<AsyncProcessingRequest<T>>,
    batch_size: usize,
    stats: &Stats,
) -> RequestBatch<T> {
    let now = Instant::now();
    let mut requests = Vec::with_capacity(batch_size);

    while requests.len() < batch_size {
        let request = match pending.pop_front() {
            Some(request) => request,
            None => match receiver.try_recv() {
                Ok(request) => request,
                Err(_) => break,
            },
        };

        if request.is_expired(now) {
            stats.bump(stats.ids.request_timeout_count, |m| {
                m.increment();
            });
            tracing::warn!(request.id = request.id, "Batch request timed out");
            request.complete(Outcome::TimedOut);
            continue;
        }

        requests.push(request);
    }

    RequestBatch { requests }
}

// Returns `false` when any request failed.
async fn flush<T, F>(
    flusher: &F,
    batch: RequestBatch<T>,
    pending: &mut VecDeque<AsyncProcessingRequest<T>>,
    stats: &Stats,
) -> bool
where
    T: Send + Sync + 'static,
    F: BatchFlush<T>,
{
    let started = Instant::now();
    let flushed = flusher.flush(&batch).await;

    let statuses = match flushed {
        Ok(statuses) => {
            stats.record_write(started.elapsed().as_millis() as i64);
            tracing::debug!(batch.len = batch.len(), "Flushed batch");
            statuses
        }

        Err(err) => {
            tracing::warn!(%err, batch.len = batch.len(), "Batch flush failed");
            let message = err.to_string();
            batch
                .requests
                .iter()
                .map(|_| RequestStatus::Failed(message.clone().into()))
                .collect()
        }
    };

    let mut statuses = statuses.into_iter();
    let mut all_flushed = true;

    for request in batch.requests {
        match statuses.next() {
            Some(RequestStatus::Flushed) => {
                let fail_count = request.fail_count;
                request.complete(Outcome::Completed { fail_count });
            }

            Some(RequestStatus::Rejected(reason)) => {
                tracing::debug!(request.id = request.id, %reason, "Batch request rejected");
                request.complete(Outcome::Rejected { reason });
            }

            Some(RequestStatus::Failed(err)) => {
                all_flushed = false;
                retry_or_fault(request, err.to_string(), pending);
            }

            None => {
                all_flushed = false;
                retry_or_fault(request, "No status reported".to_string(), pending);
            }
        }
    }

    all_flushed
}

fn retry_or_fault<T>(
    mut request: AsyncProcessingRequest<T>,
    error: String,
    pending: &mut VecDeque<AsyncProcessingRequest<T>>,
) {
    request.fail_count += 1;
    if request.fail_count < request.max_fail_count {
        pending.push_back(request);
        return;
    }

    tracing::error!(
        %error,
        request.id = request.id,
        fail_count = request.fail_count,
        "Batch request failed permanently"
    );
    let fail_count = request.fail_count;
    request.complete(Outcome::Faulted { fail_count, error });
}
