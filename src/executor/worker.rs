//! Long-lived worker executing one request chain at a time.
//!
//! The worker owns a bounded mailbox fed by the balancer. Its outer loop
//! multiplexes mailbox receive against the close command; each received
//! request runs an inner state machine that interleaves sub-task completion,
//! per-stage timeout, context cancellation, retry, and bridge-driven
//! chaining. Every terminal branch notifies the balancer, fires the
//! request's completion latch, and exits the inner loop, which is what
//! makes the latch fire exactly once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use tokio_util::sync::CancellationToken;

use crate::core::RequestState;
use crate::core::{Bridge, BridgeConnection, FutureTask, Response, StageError, TaskError};

/// A validated request in worker-side form: the worker owns its task copies,
/// so retry-budget decrements never leak back to the caller's `Request`.
pub(crate) struct Job {
    pub(crate) tasks: Vec<FutureTask>,
    pub(crate) bridges: Vec<Bridge>,
    pub(crate) state: Arc<RequestState>,
    pub(crate) ctx: CancellationToken,
}

/// Graceful-shutdown command; the receiver acks once it has wound down.
pub(crate) struct CloseCommand {
    pub(crate) ack: oneshot::Sender<()>,
}

/// Balancer-side view of a worker: the mailbox, the load key the heap
/// orders on, and the teardown plumbing. `pending` is mutated only by the
/// balancer control loop.
pub(crate) struct WorkerHandle {
    pub(crate) id: usize,
    pub(crate) name: String,
    pub(crate) pending: usize,
    pub(crate) mailbox: mpsc::Sender<Job>,
    pub(crate) close: Option<oneshot::Sender<CloseCommand>>,
    pub(crate) task: JoinHandle<()>,
}

pub(crate) struct Worker {
    id: usize,
    name: String,
    mailbox: mpsc::Receiver<Job>,
    done: mpsc::UnboundedSender<usize>,
    close: oneshot::Receiver<CloseCommand>,
}

impl Worker {
    /// Spawns a worker task with a mailbox of the given capacity and returns
    /// the balancer-side handle. `done` is the balancer's shared completion
    /// stream; the worker publishes its id there after each request.
    pub(crate) fn spawn(
        id: usize,
        mailbox_capacity: usize,
        done: mpsc::UnboundedSender<usize>,
    ) -> WorkerHandle {
        let (job_tx, job_rx) = mpsc::channel(mailbox_capacity);
        let (close_tx, close_rx) = oneshot::channel();
        let name = format!("worker-{id}");

        let worker = Worker {
            id,
            name: name.clone(),
            mailbox: job_rx,
            done,
            close: close_rx,
        };
        let task = tokio::spawn(worker.run());

        WorkerHandle {
            id,
            name,
            pending: 0,
            mailbox: job_tx,
            close: Some(close_tx),
            task,
        }
    }

    async fn run(self) {
        let Worker {
            id,
            name,
            mut mailbox,
            done,
            mut close,
        } = self;
        debug!("Starting worker: {}", name);

        loop {
            tokio::select! {
                biased;

                // The balancer only closes a worker after quiescing, so the
                // mailbox is empty by the time this fires.
                cmd = &mut close => {
                    mailbox.close();
                    if let Ok(cmd) = cmd {
                        let _ = cmd.ack.send(());
                    }
                    break;
                }

                job = mailbox.recv() => match job {
                    Some(job) => run_chain(id, &name, &done, job).await,
                    None => break,
                }
            }
        }

        debug!("Worker {} stopped", name);
    }
}

/// Runs one request chain to a terminal state.
async fn run_chain(id: usize, name: &str, done: &mpsc::UnboundedSender<usize>, job: Job) {
    let Job {
        tasks,
        bridges,
        state,
        ctx,
    } = job;
    let mut tasks: VecDeque<FutureTask> = tasks.into();
    let mut bridges: VecDeque<Bridge> = bridges.into();

    let Some(mut current) = tasks.pop_front() else {
        // Validation rejects empty chains; nothing to run regardless.
        complete(id, done, &state);
        return;
    };

    // The first stage gets a synthesised empty connection.
    let mut conn = BridgeConnection::empty();
    let mut responses = dispatch(&current, conn.clone());
    let mut timer = Box::pin(time::sleep(current.timeout));

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!("Worker {} abandoning request, context cancelled", name);
                complete(id, done, &state);
                return;
            }

            _ = timer.as_mut() => {
                debug!(
                    "Worker {} abandoning request, stage {} timed out after {:?}",
                    name,
                    stage_label(&current),
                    current.timeout
                );
                complete(id, done, &state);
                return;
            }

            received = responses.recv() => {
                let response = match received {
                    Some(response) => response,
                    // Every publisher died without publishing.
                    None => Response::synthesised(Arc::new(StageError::CallbackPanicked)),
                };

                if response.error.is_some() && current.retry_count > 0 {
                    current.retry_count -= 1;
                    debug!(
                        "Worker {} retrying stage {}, {} retries left after this one",
                        name,
                        stage_label(&current),
                        current.retry_count
                    );
                    responses = dispatch(&current, conn.clone());
                    timer.as_mut().reset(time::Instant::now() + current.timeout);
                    continue;
                }

                if tasks.is_empty() {
                    state.push_response(response);
                    complete(id, done, &state);
                    return;
                }

                let data = response.data.clone();
                state.push_response(response);

                let Some(bridge) = bridges.pop_front() else {
                    // Unreachable on a validated request; fail the tail
                    // rather than leave the caller parked forever.
                    warn!("Worker {} has no bridge to continue the chain", name);
                    fail_tail(id, done, &state, tasks.len(), Arc::new(StageError::MissingBridge));
                    return;
                };

                let Some(data) = data else {
                    warn!(
                        "Worker {} cannot continue the chain, previous stage produced no data",
                        name
                    );
                    fail_tail(id, done, &state, tasks.len(), Arc::new(StageError::MissingStageData));
                    return;
                };

                conn = bridge(data);
                if let Some(error) = conn.error.clone() {
                    debug!(
                        "Worker {} short-circuiting {} remaining stages: {}",
                        name,
                        tasks.len(),
                        error
                    );
                    fail_tail(id, done, &state, tasks.len(), error);
                    return;
                }

                // Non-empty here, checked above.
                let Some(next) = tasks.pop_front() else {
                    complete(id, done, &state);
                    return;
                };
                current = next;
                responses = dispatch(&current, conn.clone());
                timer.as_mut().reset(time::Instant::now() + current.timeout);
            }
        }
    }
}

/// Fabricates failure responses for every stage that will never run, then
/// completes the request.
fn fail_tail(
    id: usize,
    done: &mpsc::UnboundedSender<usize>,
    state: &RequestState,
    remaining: usize,
    error: TaskError,
) {
    state.fail_remaining(remaining, error);
    complete(id, done, state);
}

/// Terminal bookkeeping: the balancer hears about the completion before
/// the caller wakes.
fn complete(id: usize, done: &mpsc::UnboundedSender<usize>, state: &RequestState) {
    let _ = done.send(id);
    state.finish();
}

/// Launches one dispatch attempt as detached sub-tasks and returns the
/// channel the winning response arrives on.
///
/// The channel's capacity equals the fan-out, so losing replicas publish
/// into the buffer and are dropped with it; a publication that arrives
/// after the worker abandoned the dispatch hits a dropped receiver and is
/// discarded. Nothing blocks, nothing panics.
fn dispatch(task: &FutureTask, conn: BridgeConnection) -> mpsc::Receiver<Response> {
    let replicas = task.replica_count.max(1) as usize;
    let (tx, rx) = mpsc::channel(replicas);

    for _ in 0..replicas {
        let callback = Arc::clone(&task.callback);
        let conn = conn.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let produced = callback(conn).await;
            let _ = tx.try_send(Response::measured(start.elapsed(), produced));
        });
    }

    rx
}

fn stage_label(task: &FutureTask) -> &str {
    task.name().unwrap_or("<unnamed>")
}
