//! Bridges connect adjacent stages of a chain.
//!
//! A bridge is a plain function from the previous stage's payload to a
//! [`BridgeConnection`], the value the next callback receives. A bridge that
//! sets `error` on its connection short-circuits the whole chain: every
//! remaining stage is failed with that error and the request completes.

use std::fmt;
use std::sync::Arc;

use crate::core::error::StageError;
use crate::core::task::{TaskData, TaskError};

/// Stage-to-stage projection. Pure by convention; the engine calls it once
/// per chain advance on the worker's own task.
pub type Bridge = Arc<dyn Fn(TaskData) -> BridgeConnection + Send + Sync>;

/// The input handed to a stage callback.
///
/// The first stage of every chain receives [`BridgeConnection::empty`]; later
/// stages receive whatever the preceding bridge produced. A set `error` is a
/// terminal signal and the connection's data is not delivered anywhere.
#[derive(Clone, Default)]
pub struct BridgeConnection {
    /// Ordered payload values for the next callback.
    pub data: Vec<TaskData>,
    /// Terminal failure signal; set by bridges that cannot produce an input.
    pub error: Option<TaskError>,
}

impl BridgeConnection {
    /// The synthesised input for a chain's first stage.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A connection carrying the given payload values.
    pub fn carrying(data: Vec<TaskData>) -> Self {
        Self { data, error: None }
    }

    /// A failed connection with a bare message; short-circuits the chain.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            error: Some(Arc::new(StageError::Callback(message.into()))),
        }
    }

    /// A failed connection carrying a caller-supplied error.
    pub fn failed_with(error: TaskError) -> Self {
        Self {
            data: Vec::new(),
            error: Some(error),
        }
    }

    pub fn first(&self) -> Option<&TaskData> {
        self.data.first()
    }

    pub fn get(&self, index: usize) -> Option<&TaskData> {
        self.data.get(index)
    }

    /// Downcasts the first payload value.
    ///
    /// ```
    /// use seira::core::{task_data, BridgeConnection};
    ///
    /// let conn = BridgeConnection::carrying(vec![task_data(7_u64)]);
    /// assert_eq!(conn.first_as::<u64>(), Some(&7));
    /// assert!(conn.first_as::<String>().is_none());
    /// ```
    pub fn first_as<T: 'static>(&self) -> Option<&T> {
        self.get_as(0)
    }

    /// Downcasts the payload value at `index`.
    pub fn get_as<T: 'static>(&self, index: usize) -> Option<&T> {
        self.data.get(index).and_then(|value| value.downcast_ref())
    }
}

impl fmt::Debug for BridgeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConnection")
            .field("values", &self.data.len())
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}
