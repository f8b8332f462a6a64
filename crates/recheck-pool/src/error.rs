//! Worker pool error definitions.

use crate::worker::WorkerId;
use recheck_core::ProtocolError;
use thiserror::Error;

/// Errors that can reject a pool task or fail a worker.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker could not be created.
    #[error("Failed to start worker: {0}")]
    Spawn(String),

    /// The worker holding a task went away before replying.
    #[error("Worker {worker} terminated: {reason}")]
    WorkerTerminated { worker: WorkerId, reason: String },

    /// The pool has been shut down.
    #[error("Worker pool is closed")]
    Closed,

    /// A task or reply could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error on a worker port.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for PoolError {
    fn from(err: ProtocolError) -> Self {
        PoolError::Protocol(err.to_string())
    }
}
