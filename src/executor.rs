//! Executors turn task payloads into work.
//!
//! Each payload type names itself with [`TaskPayload::TYPE`]; that tag is what
//! gets stored as the task's type and what the poller asks the store for. An
//! executor for the payload is registered with an [`ExecutorRegistry`], which
//! the worker pool consults for every dequeued task.
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use stakhanov::executor::{
//!     ExecutionError, ExecutorRegistry, TaskExecutionContext, TaskExecutor, TaskPayload,
//! };
//!
//! #[derive(Deserialize, Serialize)]
//! struct ResizeImage {
//!     path: String,
//! }
//!
//! impl TaskPayload for ResizeImage {
//!     const TYPE: &'static str = "resize-image";
//! }
//!
//! struct Resizer;
//!
//! impl TaskExecutor for Resizer {
//!     type Payload = ResizeImage;
//!
//!     async fn execute(
//!         &self,
//!         payload: Self::Payload,
//!         _cx: &TaskExecutionContext,
//!     ) -> Result<(), ExecutionError> {
//!         if payload.path.is_empty() {
//!             return Err(ExecutionError::invalid_input("Path is empty"));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = ExecutorRegistry::new();
//! registry.register(Resizer);
//! assert_eq!(registry.payload_types(), vec!["resize-image".to_string()]);
//! ```

use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

use jiff::{Span, ToSpan};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::task::{QueuedTask, QueuedTaskError};

/// Classifies execution errors for the recoverability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A passing condition, such as a dropped connection.
    Transient,

    /// The executor ran past its timeout.
    Timeout,

    /// The payload can never be processed as given.
    InvalidInput,

    /// A bug in the executor.
    Defect,

    /// The executor gave up on the task.
    Fatal,

    /// No executor is registered for the task's type.
    Unsupported,

    /// The executor stopped because cancellation was requested.
    Cancelled,
}

impl ErrorKind {
    /// The stable name recorded as the error type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::InvalidInput => "invalid_input",
            Self::Defect => "defect",
            Self::Fatal => "fatal",
            Self::Unsupported => "unsupported",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error returned by a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    kind: ErrorKind,
    message: String,
    details: Option<String>,
}

impl ExecutionError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// A failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// The execution took too long.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// The payload is unusable.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// The executor is broken.
    pub fn defect(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Defect, message)
    }

    /// The task must not be attempted again.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Cancellation was observed.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// No executor handles the payload type.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    /// Builds an error from `err` and its chain of sources.
    pub fn from_error(kind: ErrorKind, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        let mut error = Self::new(kind, err.to_string());
        if !causes.is_empty() {
            error.details = Some(causes.join("\n"));
        }
        error
    }

    /// Attaches free-form details, e.g. a backtrace.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// The error's kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The error's message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Details attached to the error.
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }
}

impl From<ExecutionError> for QueuedTaskError {
    fn from(err: ExecutionError) -> Self {
        QueuedTaskError {
            error_type: err.kind.as_str().to_string(),
            message: err.message,
            stack_trace: err.details,
        }
    }
}

impl From<serde_json::Error> for ExecutionError {
    fn from(err: serde_json::Error) -> Self {
        Self::from_error(ErrorKind::InvalidInput, &err)
    }
}

/// Context handed to an executor for one attempt.
#[derive(Debug, Clone)]
pub struct TaskExecutionContext {
    task: Arc<QueuedTask>,
    cancellation_token: CancellationToken,
}

impl TaskExecutionContext {
    /// Creates a context for `task`, cancelled through `cancellation_token`.
    pub fn new(task: QueuedTask, cancellation_token: CancellationToken) -> Self {
        Self {
            task: Arc::new(task),
            cancellation_token,
        }
    }

    /// The task being executed.
    pub fn task(&self) -> &QueuedTask {
        &self.task
    }

    /// Returns `true` once the engine asked executions to stop.
    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Completes once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }
}

/// A payload that can be posted as a task.
pub trait TaskPayload: DeserializeOwned + Serialize + Send + 'static {
    /// Type tag stored with each task carrying this payload.
    const TYPE: &'static str;
}

/// Executes tasks carrying one payload type.
pub trait TaskExecutor: Send + Sync + 'static {
    /// The payload this executor handles.
    type Payload: TaskPayload;

    /// Executes one task.
    ///
    /// Long-running executors should watch
    /// [`TaskExecutionContext::cancelled`] and return early with
    /// [`ExecutionError::cancelled`].
    fn execute(
        &self,
        payload: Self::Payload,
        cx: &TaskExecutionContext,
    ) -> impl Future<Output = Result<(), ExecutionError>> + Send;

    /// How long one attempt may take.
    fn timeout(&self) -> Span {
        15.minutes()
    }
}

trait ExecutorHandler: Send + Sync {
    fn payload_type(&self) -> &'static str;
    fn timeout(&self) -> Span;
    fn execute_json<'a>(
        &'a self,
        payload: Value,
        cx: &'a TaskExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExecutionError>> + Send + 'a>>;
}

struct Registered<E: TaskExecutor> {
    inner: E,
}

impl<E: TaskExecutor> ExecutorHandler for Registered<E> {
    fn payload_type(&self) -> &'static str {
        E::Payload::TYPE
    }

    fn timeout(&self) -> Span {
        self.inner.timeout()
    }

    fn execute_json<'a>(
        &'a self,
        payload: Value,
        cx: &'a TaskExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExecutionError>> + Send + 'a>> {
        Box::pin(async move {
            let payload: E::Payload = serde_json::from_value(payload).map_err(|err| {
                ExecutionError::invalid_input(format!(
                    "Failed to deserialize payload of type `{}`: {err}",
                    E::Payload::TYPE
                ))
            })?;

            self.inner.execute(payload, cx).await
        })
    }
}

/// A type-erased executor resolved from the registry.
#[derive(Clone)]
pub struct ResolvedExecutor {
    handler: Arc<dyn ExecutorHandler>,
}

impl ResolvedExecutor {
    /// The payload type the executor handles.
    pub fn payload_type(&self) -> &'static str {
        self.handler.payload_type()
    }

    /// How long one attempt may take.
    pub fn timeout(&self) -> Span {
        self.handler.timeout()
    }

    /// Deserializes `payload` and executes it.
    ///
    /// A missing payload is passed as JSON `null`.
    pub async fn execute(
        &self,
        payload: Option<Value>,
        cx: &TaskExecutionContext,
    ) -> Result<(), ExecutionError> {
        self.handler
            .execute_json(payload.unwrap_or(Value::Null), cx)
            .await
    }
}

impl fmt::Debug for ResolvedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedExecutor")
            .field("payload_type", &self.payload_type())
            .finish()
    }
}

/// Maps payload types to their executors.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    handlers: HashMap<String, Arc<dyn ExecutorHandler>>,
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `executor` for its payload type.
    ///
    /// A later registration for the same type replaces the earlier one.
    pub fn register<E: TaskExecutor>(&mut self, executor: E) -> &mut Self {
        let replaced = self
            .handlers
            .insert(
                E::Payload::TYPE.to_string(),
                Arc::new(Registered { inner: executor }),
            )
            .is_some();

        if replaced {
            tracing::warn!(
                payload_type = E::Payload::TYPE,
                "Replaced previously registered executor"
            );
        }

        self
    }

    /// Finds the executor for `payload_type`.
    pub fn resolve(&self, payload_type: &str) -> Option<ResolvedExecutor> {
        self.handlers
            .get(payload_type)
            .map(|handler| ResolvedExecutor {
                handler: handler.clone(),
            })
    }

    /// The registered payload types, sorted.
    pub fn payload_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("payload_types", &self.payload_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::task::tests::task_with_id;

    #[derive(Deserialize, Serialize)]
    struct Greet {
        name: String,
    }

    impl TaskPayload for Greet {
        const TYPE: &'static str = "greet";
    }

    struct Greeter;

    impl TaskExecutor for Greeter {
        type Payload = Greet;

        async fn execute(
            &self,
            payload: Self::Payload,
            _cx: &TaskExecutionContext,
        ) -> Result<(), ExecutionError> {
            if payload.name.is_empty() {
                return Err(ExecutionError::invalid_input("Name is empty"));
            }
            Ok(())
        }

        fn timeout(&self) -> Span {
            5.seconds()
        }
    }

    struct PatientGreeter;

    impl TaskExecutor for PatientGreeter {
        type Payload = Greet;

        async fn execute(
            &self,
            _payload: Self::Payload,
            cx: &TaskExecutionContext,
        ) -> Result<(), ExecutionError> {
            cx.cancelled().await;
            Err(ExecutionError::cancelled("Stopped waiting"))
        }
    }

    fn context() -> TaskExecutionContext {
        TaskExecutionContext::new(task_with_id(Uuid::new_v4()), CancellationToken::new())
    }

    #[tokio::test]
    async fn resolves_and_executes_registered_executor() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Greeter);

        let executor = registry.resolve("greet").expect("greeter is registered");
        assert_eq!(executor.payload_type(), "greet");
        assert_eq!(executor.timeout().get_seconds(), 5);

        let cx = context();
        assert!(executor
            .execute(Some(json!({ "name": "Ferris" })), &cx)
            .await
            .is_ok());

        let err = executor
            .execute(Some(json!({ "name": "" })), &cx)
            .await
            .expect_err("empty names are rejected");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        assert!(registry.resolve("unknown").is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_invalid_input() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Greeter);

        let executor = registry.resolve("greet").expect("greeter is registered");
        let err = executor
            .execute(None, &context())
            .await
            .expect_err("null is not a greeting");

        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.message().contains("greet"));
    }

    #[tokio::test]
    async fn later_registration_replaces_earlier() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Greeter).register(PatientGreeter);

        assert_eq!(registry.payload_types(), vec!["greet".to_string()]);

        let executor = registry.resolve("greet").expect("greeter is registered");
        assert_eq!(executor.timeout().get_minutes(), 15);

        let token = CancellationToken::new();
        let cx = TaskExecutionContext::new(task_with_id(Uuid::new_v4()), token.clone());
        token.cancel();
        assert!(cx.is_cancellation_requested());

        let err = executor
            .execute(Some(json!({ "name": "Ferris" })), &cx)
            .await
            .expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn converts_into_queued_task_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err = ExecutionError::from_error(ErrorKind::Transient, &io).with_details("at line 3");

        let queued: QueuedTaskError = err.into();
        assert_eq!(queued.error_type, "transient");
        assert_eq!(queued.message, "peer reset");
        assert_eq!(queued.stack_trace.as_deref(), Some("at line 3"));
    }

    #[test]
    fn kinds_serialize_in_snake_case() -> Result<(), serde_json::Error> {
        assert_eq!(serde_json::to_string(&ErrorKind::InvalidInput)?, r#""invalid_input""#);
        let kind: ErrorKind = serde_json::from_str(r#""unsupported""#)?;
        assert_eq!(kind, ErrorKind::Unsupported);
        Ok(())
    }
}
