//! Worker pool scheduler.
//!
//! `WorkerPool` is a thin handle. One scheduler task owns the queue, the free
//! workers and the pending tasks, and handles every event (submission, worker
//! reply, worker exit, cancellation) to completion before looking at the next
//! one. Nothing in the scheduler state is shared, so nothing is locked.

use crate::error::PoolError;
use crate::worker::{Worker, WorkerEvents, WorkerFactory, WorkerId};
use recheck_core::{
    CancellationToken, CheckOptions, Diagnostics, KeepAlive, KeepAliveGuard, LogFn, Parameters,
    RequestId, Response, TaskMessage,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

type Reply = Result<Diagnostics, PoolError>;

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Upper bound on live workers. Values below one are treated as one.
    pub max_workers: usize,
}

impl WorkerPoolConfig {
    pub fn new(max_workers: usize) -> Self {
        Self { max_workers }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Snapshot of the scheduler state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub running_workers: usize,
    pub free_workers: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
    pub pending_tasks: usize,
}

/// A submitted task, as it travels to the scheduler.
pub(crate) struct Task {
    id: RequestId,
    source: String,
    flags: String,
    params: Parameters,
    logger: Option<LogFn>,
    cancel: Option<CancellationToken>,
    reply: oneshot::Sender<Reply>,
}

pub(crate) enum PoolEvent {
    Submit(Task),
    Abort(RequestId),
    Message { worker: WorkerId, text: String },
    Exited { worker: WorkerId, reason: String },
    Stats(oneshot::Sender<PoolStats>),
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Future resolving to the diagnostics of one pool task.
#[derive(Debug)]
pub struct TaskHandle {
    id: RequestId,
    rx: oneshot::Receiver<Reply>,
}

impl TaskHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = Result<Diagnostics, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(PoolError::Closed)))
    }
}

/// Bounded pool of persistent workers.
///
/// Dropping the pool shuts it down.
pub struct WorkerPool {
    events: mpsc::UnboundedSender<PoolEvent>,
    next_id: AtomicU64,
    keep_alive: KeepAlive,
}

impl WorkerPool {
    /// Create a pool and its first worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        factory: Arc<dyn WorkerFactory>,
        config: WorkerPoolConfig,
        keep_alive: KeepAlive,
    ) -> Result<Self, PoolError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler {
            factory,
            max_workers: config.max_workers.max(1),
            running: 0,
            next_worker: 0,
            free: Vec::new(),
            queue: VecDeque::new(),
            pending: HashMap::new(),
            keep_alive: keep_alive.clone(),
            events: tx.clone(),
        };

        let first = scheduler.spawn_worker()?;
        scheduler.free.push(first);
        info!(max_workers = scheduler.max_workers, "Worker pool started");

        tokio::spawn(scheduler.run(rx));
        Ok(Self {
            events: tx,
            next_id: AtomicU64::new(0),
            keep_alive,
        })
    }

    /// Submit a task. Never waits for a worker; the returned handle resolves
    /// once the task has been served.
    ///
    /// If `options.cancel` fires, the handle resolves with cancelled
    /// diagnostics rather than an error.
    pub fn check(&self, source: &str, flags: &str, options: CheckOptions) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (params, logger, cancel) = options.into_parts();
        let (reply, rx) = oneshot::channel();

        let task = Task {
            id,
            source: source.to_string(),
            flags: flags.to_string(),
            params,
            logger,
            cancel,
            reply,
        };
        if self.events.send(PoolEvent::Submit(task)).is_err() {
            debug!(id = id, "Task submitted to a closed pool");
        }
        TaskHandle { id, rx }
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(PoolEvent::Stats(tx))
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Cancel every pending task and terminate every worker.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(PoolEvent::Shutdown(Some(tx))).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = self.events.send(PoolEvent::Shutdown(None));
    }
}

/// Scheduler-side record of a submitted task.
struct PendingTask {
    source: String,
    flags: String,
    params: Parameters,
    logger: Option<LogFn>,
    cancel: Option<CancellationToken>,
    reply: oneshot::Sender<Reply>,
    /// Assigned once dispatched.
    worker: Option<Box<dyn Worker>>,
    guard: Option<KeepAliveGuard>,
    abort_listener: Option<JoinHandle<()>>,
}

impl PendingTask {
    fn new(task: Task) -> Self {
        Self {
            source: task.source,
            flags: task.flags,
            params: task.params,
            logger: task.logger,
            cancel: task.cancel,
            reply: task.reply,
            worker: None,
            guard: None,
            abort_listener: None,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn is_assigned_to(&self, worker: WorkerId) -> bool {
        self.worker.as_ref().is_some_and(|w| w.id() == worker)
    }

    /// Deliver the terminal disposition. The worker must already be detached.
    fn settle(mut self, reply: Reply) {
        if let Some(listener) = self.abort_listener.take() {
            listener.abort();
        }
        self.guard = None;
        let _ = self.reply.send(reply);
    }

    fn settle_cancelled(self) {
        let diagnostics = Diagnostics::cancelled(&self.source, &self.flags);
        self.settle(Ok(diagnostics));
    }
}

struct Scheduler {
    factory: Arc<dyn WorkerFactory>,
    max_workers: usize,
    running: usize,
    next_worker: u64,
    /// Idle workers; the most recently freed is reused first.
    free: Vec<Box<dyn Worker>>,
    queue: VecDeque<RequestId>,
    pending: HashMap<RequestId, PendingTask>,
    keep_alive: KeepAlive,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl Scheduler {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                PoolEvent::Submit(task) => {
                    let id = task.id;
                    trace!(id = id, "Task queued");
                    self.pending.insert(id, PendingTask::new(task));
                    self.queue.push_back(id);
                    self.wake();
                }
                PoolEvent::Abort(id) => self.abort(id),
                PoolEvent::Message { worker, text } => self.on_message(worker, &text),
                PoolEvent::Exited { worker, reason } => {
                    debug!(worker = %worker, reason = %reason, "Worker exited");
                    self.fail_worker(worker, PoolError::WorkerTerminated { worker, reason });
                }
                PoolEvent::Stats(reply) => {
                    let _ = reply.send(self.stats());
                }
                PoolEvent::Shutdown(reply) => {
                    self.shutdown();
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }
        debug!("Worker pool scheduler stopped");
    }

    fn spawn_worker(&mut self) -> Result<Box<dyn Worker>, PoolError> {
        let id = WorkerId(self.next_worker);
        self.next_worker += 1;
        let worker = self
            .factory
            .create(id, WorkerEvents::new(id, self.events.clone()))?;
        self.running += 1;
        debug!(worker = %id, running = self.running, "Created worker");
        Ok(worker)
    }

    /// Dispatch queued tasks while workers are available or can be created.
    fn wake(&mut self) {
        while let Some(&id) = self.queue.front() {
            let cancelled = match self.pending.get(&id) {
                Some(task) => task.is_cancelled(),
                None => {
                    self.queue.pop_front();
                    continue;
                }
            };
            // Settled before a worker is taken or created for it.
            if cancelled {
                debug!(id = id, "Task cancelled while queued");
                self.queue.pop_front();
                if let Some(task) = self.pending.remove(&id) {
                    task.settle_cancelled();
                }
                continue;
            }

            let worker = match self.free.pop() {
                Some(worker) => worker,
                None if self.running < self.max_workers => match self.spawn_worker() {
                    Ok(worker) => worker,
                    Err(e) => {
                        warn!(id = id, error = %e, "Failed to create worker");
                        self.queue.pop_front();
                        if let Some(task) = self.pending.remove(&id) {
                            task.settle(Err(e));
                        }
                        continue;
                    }
                },
                None => {
                    trace!(queued = self.queue.len(), "All workers busy");
                    break;
                }
            };

            self.queue.pop_front();
            self.dispatch(id, worker);
        }
    }

    fn dispatch(&mut self, id: RequestId, mut worker: Box<dyn Worker>) {
        let Some(task) = self.pending.get_mut(&id) else {
            self.free.push(worker);
            return;
        };

        if task.is_cancelled() {
            debug!(id = id, "Task cancelled before dispatch");
            self.free.push(worker);
            if let Some(task) = self.pending.remove(&id) {
                task.settle_cancelled();
            }
            return;
        }

        let message = TaskMessage {
            id,
            source: task.source.clone(),
            flags: task.flags.clone(),
            params: task.params.clone(),
        };
        let posted = message
            .to_line()
            .map_err(PoolError::from)
            .and_then(|line| worker.post_message(line));
        if let Err(e) = posted {
            warn!(id = id, worker = %worker.id(), error = %e, "Failed to send task to worker");
            worker.terminate();
            self.running -= 1;
            if let Some(task) = self.pending.remove(&id) {
                task.settle(Err(e));
            }
            return;
        }

        debug!(id = id, worker = %worker.id(), "Dispatched task");
        task.guard = Some(self.keep_alive.acquire());
        if let Some(token) = task.cancel.clone() {
            let events = self.events.clone();
            task.abort_listener = Some(tokio::spawn(async move {
                token.cancelled().await;
                let _ = events.send(PoolEvent::Abort(id));
            }));
        }
        task.worker = Some(worker);
    }

    fn on_message(&mut self, worker: WorkerId, text: &str) {
        let response = match Response::from_line(text) {
            Ok(response) => response,
            Err(e) => {
                warn!(worker = %worker, error = %e, "Malformed message from worker");
                self.fail_worker(worker, PoolError::from(e));
                return;
            }
        };

        let Some(id) = response.id() else {
            warn!(worker = %worker, "Worker sent a message without a task id");
            return;
        };
        if !self
            .pending
            .get(&id)
            .is_some_and(|task| task.is_assigned_to(worker))
        {
            debug!(id = id, worker = %worker, "Ignoring message for a task this worker does not hold");
            return;
        }

        match response {
            Response::Push(push) => {
                if let Some(logger) = self.pending.get(&id).and_then(|task| task.logger.as_ref()) {
                    logger(&push.message);
                }
            }
            Response::Result(result) => self.complete(id, Ok(result.result)),
            Response::Error(error) => self.complete(
                id,
                Err(PoolError::Protocol(format!(
                    "worker error {}: {}",
                    error.error.code, error.error.message
                ))),
            ),
        }
    }

    /// Settle a dispatched task and return its worker to the free set.
    fn complete(&mut self, id: RequestId, reply: Reply) {
        let Some(mut task) = self.pending.remove(&id) else {
            return;
        };
        if let Some(worker) = task.worker.take() {
            trace!(id = id, worker = %worker.id(), "Worker is free");
            self.free.push(worker);
        }
        task.settle(reply);
        self.wake();
    }

    /// The caller cancelled a dispatched task: its worker cannot be
    /// interrupted, so it is terminated.
    fn abort(&mut self, id: RequestId) {
        let dispatched = self
            .pending
            .get(&id)
            .is_some_and(|task| task.worker.is_some());
        if !dispatched {
            return;
        }
        let Some(mut task) = self.pending.remove(&id) else {
            return;
        };
        if let Some(mut worker) = task.worker.take() {
            info!(id = id, worker = %worker.id(), "Terminating worker of cancelled task");
            worker.terminate();
            self.running -= 1;
        }
        task.settle_cancelled();
        self.wake();
    }

    /// Drop a worker that stopped on its own or broke the protocol.
    fn fail_worker(&mut self, worker: WorkerId, error: PoolError) {
        if let Some(pos) = self.free.iter().position(|w| w.id() == worker) {
            let mut gone = self.free.remove(pos);
            gone.terminate();
            self.running -= 1;
        } else if let Some(id) = self
            .pending
            .iter()
            .find(|(_, task)| task.is_assigned_to(worker))
            .map(|(id, _)| *id)
        {
            let Some(mut task) = self.pending.remove(&id) else {
                return;
            };
            if let Some(mut gone) = task.worker.take() {
                gone.terminate();
            }
            self.running -= 1;
            warn!(id = id, worker = %worker, error = %error, "Task lost its worker");
            task.settle(Err(error));
        } else {
            trace!(worker = %worker, "Ignoring event from untracked worker");
            return;
        }
        self.wake();
    }

    fn stats(&self) -> PoolStats {
        let busy_workers = self
            .pending
            .values()
            .filter(|task| task.worker.is_some())
            .count();
        PoolStats {
            running_workers: self.running,
            free_workers: self.free.len(),
            busy_workers,
            queued_tasks: self.queue.len(),
            pending_tasks: self.pending.len(),
        }
    }

    fn shutdown(&mut self) {
        info!(
            pending = self.pending.len(),
            workers = self.running,
            "Shutting down worker pool"
        );
        self.queue.clear();
        for (id, mut task) in self.pending.drain() {
            if let Some(mut worker) = task.worker.take() {
                worker.terminate();
            }
            debug!(id = id, "Cancelling task on shutdown");
            task.settle_cancelled();
        }
        for mut worker in self.free.drain(..) {
            worker.terminate();
        }
        self.running = 0;
    }
}
