//! Seira: Concurrent Task Pipelines over a Least-Loaded Worker Pool
//!
//! `seira` (σειρά, Greek for "series" or "chain") runs linear chains of
//! asynchronous tasks on a fixed fleet of long-lived workers, always handing
//! new work to the worker with the fewest requests in flight.
//!
//! # Features
//!
//! - **Chained execution**: each stage's output flows through a *bridge*
//!   into the next stage's input
//! - **Per-stage policy**: independent timeout, retry budget, and replica
//!   fan-out (fastest response wins) on every task
//! - **Least-loaded dispatch**: a min-heap over worker load, maintained by a
//!   single lock-free control loop
//! - **Cooperative cancellation**: a request's `CancellationToken` abandons
//!   the chain at the next stage boundary
//! - **Graceful shutdown**: close quiesces in-flight requests before
//!   tearing down workers, then acks
//!
//! # Quick start
//!
//! ```no_run
//! use seira::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let balancer = Balancer::new(4, 8);
//!
//!     let fetch = FutureTask::named("fetch", |_conn| async {
//!         TaskResponse::ok(200, "user-17")
//!     })
//!     .with_second_timeout(1)
//!     .with_retry(2);
//!
//!     let greet = FutureTask::named("greet", |conn: BridgeConnection| async move {
//!         match conn.first_as::<&str>() {
//!             Some(user) => TaskResponse::ok(200, format!("hello, {user}")),
//!             None => TaskResponse::empty_callback_response(),
//!         }
//!     })
//!     .with_second_timeout(1);
//!
//!     let request = Request::new(CancellationToken::new(), fetch)
//!         .followed_by(|data| BridgeConnection::carrying(vec![data]), greet);
//!
//!     balancer.post_job(&request).await.expect("request is well-formed");
//!     request.completed().await;
//!
//!     let greeting = request.response(1).expect("second stage ran");
//!     println!("{}", greeting.data_as::<String>().expect("string payload"));
//!
//!     balancer.close().await.ok();
//! }
//! ```
//!
//! # Module organization
//!
//! Each module hides one set of design decisions:
//!
//! - [`core`]: the value model (tasks, bridges, requests, responses, errors)
//! - [`executor`]: the engine (balancer, worker pool, workers)

pub mod core;
pub mod executor;

// Re-export commonly used types for convenience
pub use crate::core::{
    task_data, Bridge, BridgeConnection, FutureTask, Request, RequestError, Response,
    ResponseError, StageError, TaskData, TaskError, TaskResponse,
};
pub use crate::executor::Balancer;

// Re-export dependencies used in the public API so callers don't fight
// version mismatches.
pub use tokio_util::sync::CancellationToken;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```ignore
/// use seira::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{
        task_data, BridgeConnection, FutureTask, Request, Response, TaskResponse,
    };
    pub use crate::executor::Balancer;
    pub use tokio_util::sync::CancellationToken;
}
