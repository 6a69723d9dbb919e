//! Single-stage tasks and the responses they produce.
//!
//! A [`FutureTask`] wraps a user callback together with its execution policy:
//! a per-stage timeout, a retry budget for errored attempts, and an optional
//! replica fan-out where the fastest invocation wins. The callback itself is
//! opaque to the engine; it receives the previous stage's
//! [`BridgeConnection`] and produces a [`TaskResponse`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::core::bridge::BridgeConnection;
use crate::core::error::StageError;

/// Opaque stage payload. Reference-counted so the same value can be recorded
/// in a response and handed to the next bridge without copying.
pub type TaskData = Arc<dyn Any + Send + Sync>;

/// Cloneable error handle carried by responses and bridge connections.
pub type TaskError = Arc<dyn std::error::Error + Send + Sync>;

/// Type-erased async callback: the single-stage computation.
pub type Callback = Arc<dyn Fn(BridgeConnection) -> BoxFuture<'static, TaskResponse> + Send + Sync>;

/// Erases a value into a [`TaskData`] payload.
///
/// # Example
///
/// ```
/// use seira::core::task_data;
///
/// let payload = task_data("order-42");
/// assert_eq!(payload.downcast_ref::<&str>(), Some(&"order-42"));
/// ```
pub fn task_data<T: Any + Send + Sync>(value: T) -> TaskData {
    Arc::new(value)
}

/// The value a callback produces for one stage.
#[derive(Clone)]
pub struct TaskResponse {
    /// Application-level status code; the engine does not interpret it.
    pub code: i32,
    /// Payload handed to the next bridge, if any.
    pub data: Option<TaskData>,
    /// A set error makes the attempt eligible for retry.
    pub error: Option<TaskError>,
}

impl TaskResponse {
    /// A successful response carrying `value` as its payload.
    pub fn ok<T: Any + Send + Sync>(code: i32, value: T) -> Self {
        Self {
            code,
            data: Some(task_data(value)),
            error: None,
        }
    }

    /// A failed response with a bare message and no payload.
    pub fn fail(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            error: Some(Arc::new(StageError::Callback(message.into()))),
        }
    }

    /// A failed response carrying a caller-supplied error.
    pub fn fail_with(code: i32, error: TaskError) -> Self {
        Self {
            code,
            data: None,
            error: Some(error),
        }
    }

    /// The well-known sentinel a callback returns when it declines to run
    /// because its arguments were unavailable.
    pub fn empty_callback_response() -> Self {
        Self {
            code: -1,
            data: None,
            error: Some(Arc::new(StageError::CallbackDeclined)),
        }
    }
}

impl fmt::Debug for TaskResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskResponse")
            .field("code", &self.code)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

/// One stage of a request chain: an opaque callback plus its execution
/// policy.
///
/// Knobs are chainable by value:
///
/// ```
/// use seira::core::{FutureTask, TaskResponse};
///
/// let task = FutureTask::new(|_conn| async { TaskResponse::ok(200, "done") })
///     .with_second_timeout(2)
///     .with_retry(3);
/// assert_eq!(task.retry_count(), 3);
/// ```
///
/// A task with no timeout budget times out immediately; always set one.
#[derive(Clone)]
pub struct FutureTask {
    pub(crate) name: Option<String>,
    pub(crate) callback: Callback,
    pub(crate) timeout: Duration,
    pub(crate) retry_count: u32,
    pub(crate) replica_count: u32,
}

impl FutureTask {
    /// Creates a task from an async callback.
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(BridgeConnection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskResponse> + Send + 'static,
    {
        let callback: Callback = Arc::new(move |conn| Box::pin(callback(conn)));
        Self {
            name: None,
            callback,
            timeout: Duration::ZERO,
            retry_count: 0,
            replica_count: 0,
        }
    }

    /// Creates a named task; the name shows up in engine logs.
    pub fn named<F, Fut>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(BridgeConnection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskResponse> + Send + 'static,
    {
        let mut task = Self::new(callback);
        task.name = Some(name.into());
        task
    }

    /// Sets the per-stage timeout in milliseconds.
    pub fn with_millisecond_timeout(mut self, millis: u64) -> Self {
        self.timeout = Duration::from_millis(millis);
        self
    }

    /// Sets the per-stage timeout in seconds.
    pub fn with_second_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// Sets how many times an errored attempt is retried. `0` means a single
    /// attempt. The budget belongs to the stage, not the request: timeouts
    /// are terminal and consume no retries.
    pub fn with_retry(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Sets the replica fan-out: the callback is invoked this many times
    /// concurrently and the fastest response wins. Useful against services
    /// with jittery latency. `0` and `1` both mean a single invocation.
    pub fn with_replica(mut self, count: u32) -> Self {
        self.replica_count = count;
        self
    }

    /// The task's name, if one was given.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn replica_count(&self) -> u32 {
        self.replica_count
    }
}

impl fmt::Debug for FutureTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureTask")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retry_count", &self.retry_count)
            .field("replica_count", &self.replica_count)
            .finish()
    }
}
