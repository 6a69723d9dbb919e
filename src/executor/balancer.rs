//! The balancer: admission, least-loaded dispatch, and graceful shutdown.
//!
//! A single control-loop task owns the worker heap and every load counter,
//! so dispatch and completion bookkeeping need no locks: both sides of each
//! counter mutation happen on the same task. Dispatch blocks when the chosen
//! worker's mailbox is full, which also stalls admission of new requests;
//! that is the engine's only form of backpressure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::core::{Request, RequestError};
use crate::executor::pool::WorkerPool;
use crate::executor::worker::{CloseCommand, Job, Worker};

/// How long a close command waits before re-checking whether in-flight
/// requests have drained.
const CLOSE_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Dispatches requests to the least-loaded worker of a fixed fleet.
///
/// Construct one per engine instance; there is deliberately no process-wide
/// singleton. Dropping the balancer without calling [`Balancer::close`]
/// tears the fleet down after in-flight requests finish.
///
/// # Example
///
/// ```no_run
/// use seira::core::{FutureTask, Request, TaskResponse};
/// use seira::executor::Balancer;
/// use seira::CancellationToken;
///
/// # async fn example() {
/// let balancer = Balancer::new(8, 16);
///
/// let task = FutureTask::new(|_conn| async { TaskResponse::ok(200, "done") })
///     .with_second_timeout(1);
/// let request = Request::new(CancellationToken::new(), task);
///
/// balancer.post_job(&request).await.unwrap();
/// request.completed().await;
///
/// let ack = balancer.close();
/// ack.await.ok();
/// # }
/// ```
pub struct Balancer {
    job_tx: mpsc::Sender<Job>,
    close_tx: mpsc::UnboundedSender<CloseCommand>,
    closed: AtomicBool,
    posted: Arc<AtomicUsize>,
    worker_count: usize,
    control: JoinHandle<()>,
}

impl Balancer {
    /// Starts `worker_count` workers, each with a mailbox holding up to
    /// `tasks_per_worker` queued requests, and spawns the control loop.
    ///
    /// # Panics
    ///
    /// Panics if either argument is zero.
    pub fn new(worker_count: usize, tasks_per_worker: usize) -> Self {
        assert!(worker_count >= 1, "a balancer needs at least one worker");
        assert!(
            tasks_per_worker >= 1,
            "worker mailboxes need capacity for at least one request"
        );

        let (job_tx, job_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        let mut pool = WorkerPool::with_capacity(worker_count);
        for id in 0..worker_count {
            pool.push(Worker::spawn(id, tasks_per_worker, done_tx.clone()));
        }

        let posted = Arc::new(AtomicUsize::new(0));
        let control = ControlLoop {
            pool,
            queued_items: 0,
            seen: 0,
            accepting: true,
            posted: posted.clone(),
            job_rx,
            done_rx,
            close_rx,
            close_tx: close_tx.clone(),
        };
        let control = tokio::spawn(control.run());

        info!(
            "Balancer started with {} workers, {} requests per mailbox",
            worker_count, tasks_per_worker
        );

        Self {
            job_tx,
            close_tx,
            closed: AtomicBool::new(false),
            posted,
            worker_count,
            control,
        }
    }

    /// Validates `request` and, on success, enqueues it for dispatch.
    ///
    /// A validation failure is returned synchronously and the request is not
    /// enqueued. On success the request has been accepted: its completion
    /// signal will fire exactly once, and its responses fill in stage order.
    ///
    /// Blocks while the engine is saturated (every worker's mailbox full).
    ///
    /// # Panics
    ///
    /// Panics if called after [`Balancer::close`]; posting into a
    /// shutting-down engine is a programming error.
    pub async fn post_job(&self, request: &Request) -> Result<(), RequestError> {
        assert!(
            !self.closed.load(Ordering::Acquire),
            "post_job called after close"
        );
        request.validate()?;

        let job = Job {
            tasks: request.tasks.clone(),
            bridges: request.bridges.clone(),
            state: request.state.clone(),
            ctx: request.ctx.clone(),
        };

        self.posted.fetch_add(1, Ordering::AcqRel);
        if self.job_tx.send(job).await.is_err() {
            panic!("balancer control loop is gone, cannot accept requests");
        }
        Ok(())
    }

    /// Requests graceful shutdown and returns the acknowledgement channel.
    ///
    /// Returns immediately. The ack fires exactly once, after every accepted
    /// request has reached a terminal state and every worker has been torn
    /// down. While requests are still in flight the engine re-checks roughly
    /// once per second.
    ///
    /// The receiver yields an error instead if the engine was already gone.
    pub fn close(&self) -> oneshot::Receiver<()> {
        self.closed.store(true, Ordering::Release);
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.close_tx.send(CloseCommand { ack: ack_tx }).is_err() {
            warn!("Balancer control loop already stopped, close has no effect");
        }
        ack_rx
    }

    /// The number of workers in the fleet.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Whether the control loop is still alive.
    pub fn is_running(&self) -> bool {
        !self.control.is_finished()
    }
}

/// The single-task event loop that owns all pool state.
struct ControlLoop {
    pool: WorkerPool,
    /// Requests dispatched to a worker and not yet acknowledged complete.
    queued_items: usize,
    /// Requests this loop has taken off the job channel.
    seen: usize,
    /// Cleared when the balancer handle is dropped.
    accepting: bool,
    /// Requests accepted by `post_job`; compared against `seen` so a close
    /// command cannot overtake a request that was accepted but not yet
    /// received.
    posted: Arc<AtomicUsize>,
    job_rx: mpsc::Receiver<Job>,
    done_rx: mpsc::UnboundedReceiver<usize>,
    close_rx: mpsc::UnboundedReceiver<CloseCommand>,
    close_tx: mpsc::UnboundedSender<CloseCommand>,
}

impl ControlLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                job = self.job_rx.recv(), if self.accepting => match job {
                    Some(job) => self.dispatch(job).await,
                    None => {
                        // Balancer handle dropped without close; quiesce and
                        // tear down through the normal close path, with
                        // nobody listening for the ack.
                        self.accepting = false;
                        let (ack, _) = oneshot::channel();
                        let _ = self.close_tx.send(CloseCommand { ack });
                    }
                },

                Some(id) = self.done_rx.recv() => self.completed(id),

                Some(cmd) = self.close_rx.recv() => {
                    if self.handle_close(cmd).await {
                        break;
                    }
                }

                else => break,
            }
        }
        debug!("Balancer control loop stopped");
    }

    /// Hands `job` to the least-loaded worker and updates its load key.
    ///
    /// The mailbox send blocks when the worker is saturated; because this
    /// loop is the only dispatcher, that also pauses admission.
    async fn dispatch(&mut self, job: Job) {
        self.seen += 1;

        let Some(mut worker) = self.pool.pop_min() else {
            error!("No workers available, completing request without execution");
            job.state.finish();
            return;
        };

        debug!("Dispatching request to {}", worker.name);
        match worker.mailbox.send(job).await {
            Ok(()) => {
                worker.pending += 1;
                self.queued_items += 1;
            }
            Err(mpsc::error::SendError(job)) => {
                error!(
                    "Worker {} mailbox is closed, completing request without execution",
                    worker.name
                );
                job.state.finish();
            }
        }
        self.pool.push(worker);
    }

    /// A worker finished one request: drop its load key and re-heapify.
    fn completed(&mut self, id: usize) {
        let Some(slot) = self.pool.slot_of(id) else {
            warn!("Completion from unknown or retired worker {}", id);
            return;
        };
        if let Some(worker) = self.pool.get_mut(slot) {
            worker.pending = worker.pending.saturating_sub(1);
        }
        self.pool.fix(slot);
        self.queued_items = self.queued_items.saturating_sub(1);
    }

    /// Returns `true` when the loop should terminate.
    async fn handle_close(&mut self, cmd: CloseCommand) -> bool {
        let accepted = self.posted.load(Ordering::Acquire);
        if self.queued_items > 0 || self.seen < accepted {
            debug!(
                "Close deferred, {} requests in flight, {} accepted but not yet received",
                self.queued_items,
                accepted - self.seen
            );
            let close_tx = self.close_tx.clone();
            tokio::spawn(async move {
                time::sleep(CLOSE_RECHECK_INTERVAL).await;
                let _ = close_tx.send(cmd);
            });
            return false;
        }

        self.teardown(cmd).await;
        true
    }

    /// Closes every worker in turn, waiting for each ack and join, then
    /// fires the caller's ack.
    async fn teardown(&mut self, cmd: CloseCommand) {
        info!("Balancer shutting down {} workers", self.pool.len());
        while let Some(mut worker) = self.pool.pop_min() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if let Some(close) = worker.close.take() {
                if close.send(CloseCommand { ack: ack_tx }).is_ok() {
                    let _ = ack_rx.await;
                }
            }
            let _ = worker.task.await;
            debug!("Worker {} torn down", worker.name);
        }
        let _ = cmd.ack.send(());
    }
}
