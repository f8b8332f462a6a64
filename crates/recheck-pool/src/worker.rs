//! Workers as seen from the pool.
//!
//! The pool only needs three things from a worker: a way to post a task
//! message, a way to terminate it, and a stream of the worker's replies and
//! exit, delivered through [`WorkerEvents`].

use crate::bootstrap::{bootstrap_worker, Checker};
use crate::error::PoolError;
use crate::pool::PoolEvent;
use crate::port::ChannelPort;
use recheck_core::LineFramer;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Identifier of a worker within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A persistent execution unit serving one task at a time.
pub trait Worker: Send {
    fn id(&self) -> WorkerId;

    /// Send one task message to the worker.
    fn post_message(&mut self, message: String) -> Result<(), PoolError>;

    /// Stop the worker. Anything it sends afterwards is ignored by the pool.
    fn terminate(&mut self);
}

/// Creates workers for a pool.
///
/// Called from the pool's scheduler task, so implementations may spawn tokio tasks.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, id: WorkerId, events: WorkerEvents) -> Result<Box<dyn Worker>, PoolError>;
}

/// Channel through which a worker reports replies and its own exit.
#[derive(Clone)]
pub struct WorkerEvents {
    id: WorkerId,
    tx: mpsc::UnboundedSender<PoolEvent>,
}

impl WorkerEvents {
    pub(crate) fn new(id: WorkerId, tx: mpsc::UnboundedSender<PoolEvent>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Deliver one reply document. Returns false once the pool is gone.
    pub fn message(&self, text: impl Into<String>) -> bool {
        self.tx
            .send(PoolEvent::Message {
                worker: self.id,
                text: text.into(),
            })
            .is_ok()
    }

    /// Report that the worker stopped on its own.
    pub fn exited(&self, reason: impl Into<String>) {
        let _ = self.tx.send(PoolEvent::Exited {
            worker: self.id,
            reason: reason.into(),
        });
    }
}

impl fmt::Debug for WorkerEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerEvents").field("id", &self.id).finish()
    }
}

/// Runs each worker on its own OS thread with an in-process checker.
pub struct ThreadWorkerFactory {
    checker: Arc<dyn Checker>,
}

impl ThreadWorkerFactory {
    pub fn new(checker: Arc<dyn Checker>) -> Self {
        Self { checker }
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    fn create(&self, id: WorkerId, events: WorkerEvents) -> Result<Box<dyn Worker>, PoolError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let checker = self.checker.clone();

        std::thread::Builder::new()
            .name(format!("recheck-worker-{}", id.0))
            .spawn(move || {
                let mut port = ChannelPort::new(rx, events.clone());
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    bootstrap_worker(&mut port, checker.as_ref())
                }));
                let reason = match outcome {
                    Ok(Ok(())) => "task channel closed".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "checker panicked".to_string(),
                };
                events.exited(reason);
            })
            .map_err(|e| PoolError::Spawn(format!("Failed to start worker thread: {}", e)))?;

        debug!(worker = %id, "Started thread worker");
        Ok(Box::new(ThreadWorker { id, tx: Some(tx) }))
    }
}

/// Handle to a thread worker.
///
/// Threads cannot be killed. Terminating closes the task channel, so the
/// thread exits once its current check returns; its late reply is ignored.
struct ThreadWorker {
    id: WorkerId,
    tx: Option<std::sync::mpsc::Sender<String>>,
}

impl Worker for ThreadWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn post_message(&mut self, message: String) -> Result<(), PoolError> {
        let sent = self.tx.as_ref().map(|tx| tx.send(message).is_ok());
        match sent {
            Some(true) => Ok(()),
            _ => Err(PoolError::WorkerTerminated {
                worker: self.id,
                reason: "worker thread is gone".to_string(),
            }),
        }
    }

    fn terminate(&mut self) {
        if self.tx.take().is_some() {
            debug!(worker = %self.id, "Detached thread worker");
        }
    }
}

/// Runs each worker as a child process speaking the task protocol over stdio.
#[derive(Debug, Clone)]
pub struct ProcessWorkerFactory {
    command: String,
    args: Vec<String>,
}

impl ProcessWorkerFactory {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn create(&self, id: WorkerId, events: WorkerEvents) -> Result<Box<dyn Worker>, PoolError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("Failed to spawn '{}': {}", self.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("Failed to capture stdout".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(id, stdin, rx));
        tokio::spawn(read_loop(stdout, events));

        info!(worker = %id, command = %self.command, pid = ?child.id(), "Started process worker");
        Ok(Box::new(ProcessWorker { id, child, tx }))
    }
}

struct ProcessWorker {
    id: WorkerId,
    child: Child,
    tx: mpsc::UnboundedSender<String>,
}

impl Worker for ProcessWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn post_message(&mut self, message: String) -> Result<(), PoolError> {
        self.tx.send(message).map_err(|_| PoolError::WorkerTerminated {
            worker: self.id,
            reason: "stdin closed".to_string(),
        })
    }

    fn terminate(&mut self) {
        debug!(worker = %self.id, pid = ?self.child.id(), "Killing process worker");
        if let Err(e) = self.child.start_kill() {
            debug!(worker = %self.id, error = %e, "Process worker already gone");
        }
    }
}

async fn write_loop(id: WorkerId, mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut stdin, &message).await {
            warn!(worker = %id, error = %e, "Failed to write to process worker");
            break;
        }
    }
}

async fn write_message(stdin: &mut ChildStdin, message: &str) -> std::io::Result<()> {
    stdin.write_all(message.as_bytes()).await?;
    stdin.flush().await
}

async fn read_loop(mut stdout: ChildStdout, events: WorkerEvents) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => {
                events.exited("process closed stdout");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                events.exited(format!("read failed: {}", e));
                return;
            }
        };

        for line in framer.feed(&buf[..n]) {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(worker = %events.id(), error = %e, "Malformed output from process worker");
                    events.exited(format!("malformed output: {}", e));
                    return;
                }
            };
            trace!(worker = %events.id(), line = %line, "Received worker message");
            if !events.message(line) {
                return;
            }
        }
    }
}
