//! Execution engine: the balancer, its worker fleet, and the least-loaded
//! pool they meet in.
//!
//! The engine has exactly three moving parts:
//!
//! - [`Balancer`]: a single control-loop task that validates and admits
//!   requests, hands each one to the least-loaded worker, and runs the
//!   graceful shutdown protocol.
//! - `WorkerPool` (internal): an index-tracked binary min-heap keyed on each
//!   worker's in-flight count.
//! - `Worker` (internal): a long-lived task with a bounded mailbox that runs
//!   one request chain at a time, driving per-stage dispatch, timeout,
//!   retry, replica fan-out, and bridge chaining.

mod balancer;
mod pool;
mod worker;

pub use balancer::Balancer;
