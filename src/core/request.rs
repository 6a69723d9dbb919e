//! Requests: caller-visible chain descriptors and their per-stage results.
//!
//! A request is built from a first task and grown with
//! [`Request::followed_by`], then handed to the balancer. The owning worker
//! fills in one [`Response`] per executed stage, in stage order, and fires
//! the request's one-shot completion signal exactly once when the chain
//! reaches a terminal state.

use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::core::bridge::Bridge;
use crate::core::bridge::BridgeConnection;
use crate::core::error::{RequestError, ResponseError};
use crate::core::task::{FutureTask, TaskData, TaskError, TaskResponse};

/// The recorded outcome of one executed stage.
///
/// `response_time` is the measured callback latency; responses the engine
/// synthesises (bridge short-circuit, malformed chain) carry no measurement
/// and a `-1` code.
#[derive(Clone)]
pub struct Response {
    /// Callback latency for the winning attempt; `None` on synthesised
    /// failures.
    pub response_time: Option<Duration>,
    /// Status code from the callback, or `-1` when synthesised.
    pub code: i32,
    /// Payload produced by the callback.
    pub data: Option<TaskData>,
    /// Failure carried by the final attempt, or the synthesised cause.
    pub error: Option<TaskError>,
}

impl Response {
    /// Wraps a callback's response together with its measured latency.
    pub(crate) fn measured(elapsed: Duration, produced: TaskResponse) -> Self {
        Self {
            response_time: Some(elapsed),
            code: produced.code,
            data: produced.data,
            error: produced.error,
        }
    }

    /// A failure the engine fabricates for stages that never ran.
    pub(crate) fn synthesised(error: TaskError) -> Self {
        Self {
            response_time: None,
            code: -1,
            data: None,
            error: Some(error),
        }
    }

    /// Downcasts the payload.
    pub fn data_as<T: 'static>(&self) -> Option<&T> {
        self.data.as_ref().and_then(|value| value.downcast_ref())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("response_time", &self.response_time)
            .field("code", &self.code)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

/// State shared between the caller's `Request` and the worker executing it:
/// the stage results and the one-shot completion latch.
pub(crate) struct RequestState {
    responses: Mutex<Vec<Response>>,
    finished: AtomicBool,
    done: Notify,
}

impl RequestState {
    fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            done: Notify::new(),
        }
    }

    /// Appends one stage result. Only the owning worker calls this.
    pub(crate) fn push_response(&self, response: Response) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(response);
        }
    }

    /// Fabricates failure responses for `count` stages that will never run.
    pub(crate) fn fail_remaining(&self, count: usize, error: TaskError) {
        if let Ok(mut responses) = self.responses.lock() {
            for _ in 0..count {
                responses.push(Response::synthesised(error.clone()));
            }
        }
    }

    /// Fires the completion latch. Idempotent by construction, but every
    /// terminal branch of the worker exits its loop after calling this, so
    /// it runs once per request.
    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.done.notify_waiters();
    }

    fn snapshot(&self) -> Vec<Response> {
        self.responses
            .lock()
            .map(|responses| responses.clone())
            .unwrap_or_default()
    }

    async fn wait(&self) {
        // Register interest before checking the latch so a completion that
        // lands between the check and the await is not lost.
        let mut notified = pin!(self.done.notified());
        notified.as_mut().enable();
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}

/// A linearly ordered chain of tasks joined by bridges, plus the
/// cancellation context and completion signal for the whole run.
///
/// # Example
///
/// ```no_run
/// use seira::core::{BridgeConnection, FutureTask, Request, TaskResponse};
/// use seira::executor::Balancer;
/// use seira::CancellationToken;
///
/// # async fn example() {
/// let balancer = Balancer::new(4, 8);
///
/// let fetch = FutureTask::named("fetch", |_conn| async {
///     TaskResponse::ok(200, "row-7")
/// })
/// .with_second_timeout(1);
///
/// let render = FutureTask::named("render", |conn: BridgeConnection| async move {
///     match conn.first_as::<&str>() {
///         Some(row) => TaskResponse::ok(200, format!("<{row}>")),
///         None => TaskResponse::empty_callback_response(),
///     }
/// })
/// .with_second_timeout(1);
///
/// let request = Request::new(CancellationToken::new(), fetch)
///     .followed_by(|data| BridgeConnection::carrying(vec![data]), render);
///
/// balancer.post_job(&request).await.unwrap();
/// request.completed().await;
/// let rendered = request.response(1).unwrap();
/// assert_eq!(rendered.data_as::<String>().unwrap(), "<row-7>");
/// # }
/// ```
pub struct Request {
    pub(crate) tasks: Vec<FutureTask>,
    pub(crate) bridges: Vec<Bridge>,
    pub(crate) state: Arc<RequestState>,
    pub(crate) ctx: CancellationToken,
}

impl Request {
    /// Starts a chain with its first task. Cancelling `ctx` abandons the
    /// request at the next stage boundary.
    pub fn new(ctx: CancellationToken, task: FutureTask) -> Self {
        Self {
            tasks: vec![task],
            bridges: Vec::new(),
            state: Arc::new(RequestState::new()),
            ctx,
        }
    }

    /// Assembles a request from pre-built parts. Prefer [`Request::new`]
    /// plus [`Request::followed_by`]; this exists for hand-assembled chains
    /// and leaves the bridge-count check to `post_job`.
    pub fn from_parts(ctx: CancellationToken, tasks: Vec<FutureTask>, bridges: Vec<Bridge>) -> Self {
        Self {
            tasks,
            bridges,
            state: Arc::new(RequestState::new()),
            ctx,
        }
    }

    /// Appends a stage: `bridge` converts the previous stage's payload into
    /// the new task's input. Chainable.
    pub fn followed_by<B>(mut self, bridge: B, task: FutureTask) -> Self
    where
        B: Fn(TaskData) -> BridgeConnection + Send + Sync + 'static,
    {
        self.bridges.push(Arc::new(bridge));
        self.tasks.push(task);
        self
    }

    /// Checks the chain invariants the balancer enforces before accepting a
    /// request: at least one task, and exactly n - 1 bridges for n tasks.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.tasks.is_empty() {
            return Err(RequestError::EmptyTasks);
        }
        if self.tasks.len() > 1 && self.bridges.len() != self.tasks.len() - 1 {
            return Err(RequestError::BridgeCountMismatch {
                tasks: self.tasks.len(),
                bridges: self.bridges.len(),
                expected: self.tasks.len() - 1,
            });
        }
        Ok(())
    }

    /// The response of the stage at `index`. Use this when the chain has
    /// multiple tasks; responses line up with task positions.
    pub fn response(&self, index: usize) -> Result<Response, ResponseError> {
        let responses = self.state.snapshot();
        if responses.is_empty() {
            return Err(ResponseError::Empty);
        }
        responses
            .get(index)
            .cloned()
            .ok_or(ResponseError::OutOfRange { index })
    }

    /// The one and only response. Use this for single-task requests.
    pub fn only_response(&self) -> Result<Response, ResponseError> {
        self.state
            .snapshot()
            .into_iter()
            .next()
            .ok_or(ResponseError::Empty)
    }

    /// A snapshot of every response recorded so far, in stage order.
    pub fn responses(&self) -> Vec<Response> {
        self.state.snapshot()
    }

    /// Waits for the request to reach a terminal state. Returns immediately
    /// if it already has.
    pub async fn completed(&self) {
        self.state.wait().await;
    }

    /// The number of tasks in the chain.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("tasks", &self.tasks.len())
            .field("bridges", &self.bridges.len())
            .field("responses", &self.state.snapshot().len())
            .finish()
    }
}
