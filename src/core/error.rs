use thiserror::Error;

/// Validation error returned synchronously by `post_job` before a request is
/// accepted. A request that fails validation is never enqueued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestError {
    /// The request carries no tasks at all.
    #[error("please provide some tasks to process, the task list is empty")]
    EmptyTasks,

    /// A chain of n tasks needs exactly n - 1 bridges.
    #[error("provided task count: {tasks}, bridge count: {bridges}, expected bridge count: {expected}")]
    BridgeCountMismatch {
        tasks: usize,
        bridges: usize,
        expected: usize,
    },
}

/// Error returned by the indexed response accessors on a [`Request`].
///
/// [`Request`]: crate::core::Request
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseError {
    /// The request has not produced any responses yet (or terminated before
    /// its first stage completed).
    #[error("no response obtained from the process, the response list is empty")]
    Empty,

    /// Fewer stages completed than the requested index.
    #[error("no response available at index position {index}")]
    OutOfRange { index: usize },
}

/// Failure cause attached to responses the engine synthesises itself, plus
/// the plain-message variant user callbacks reach for when they have nothing
/// more structured to report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StageError {
    /// A callback reported failure with a bare message.
    #[error("{0}")]
    Callback(String),

    /// The well-known decline sentinel: the callback chose not to run
    /// because its arguments were unavailable.
    #[error("the callback did not run due to argument unavailability")]
    CallbackDeclined,

    /// A stage produced no data while later stages still needed input, so
    /// the rest of the chain was failed.
    #[error("previous stage produced no data, the chain cannot continue")]
    MissingStageData,

    /// No bridge was available to carry data into the next stage.
    #[error("no bridge available to continue the chain")]
    MissingBridge,

    /// The callback task died before publishing a response.
    #[error("task callback panicked before producing a response")]
    CallbackPanicked,
}

pub type Result<T> = std::result::Result<T, RequestError>;
