//! Core value model for the pipeline engine.
//!
//! # Domain model
//! - [`FutureTask`]: one stage, an opaque async callback plus timeout,
//!   retry, and replica policy
//! - [`TaskResponse`]: what a callback produces
//! - [`Bridge`] / [`BridgeConnection`]: the projection from one stage's
//!   output to the next stage's input, with a terminal error short-circuit
//! - [`Request`] / [`Response`]: the caller-visible chain and its indexed
//!   per-stage results
//!
//! # Error handling
//! - [`RequestError`]: validation failures surfaced synchronously by
//!   `post_job`
//! - [`ResponseError`]: indexed reads against missing responses
//! - [`StageError`]: failure causes the engine synthesises itself

mod bridge;
mod error;
mod request;
mod task;

pub use bridge::{Bridge, BridgeConnection};
pub use error::{RequestError, ResponseError, Result, StageError};
pub use request::{Request, Response};
pub use task::{task_data, Callback, FutureTask, TaskData, TaskError, TaskResponse};

pub(crate) use request::RequestState;
