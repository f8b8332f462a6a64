//! Bounded pool of persistent workers.
//!
//! A pool owns up to `max_workers` workers, each serving one task at a time.
//! Tasks beyond that wait in a FIFO queue until a worker is free. Workers are
//! either OS threads running a [`Checker`] in-process, or child processes
//! speaking the same task protocol over stdio.
//!
//! # Architecture
//!
//! - `WorkerPool`: client handle; all scheduling happens on one background task
//! - `Worker` / `WorkerFactory`: how the pool creates, feeds and terminates workers
//! - `MessagePort`: worker-side transport (in-memory channel or stdio)
//! - `bootstrap_worker`: worker-side task loop around a `Checker`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use recheck_core::{CheckOptions, Diagnostics, KeepAlive, Parameters};
//! use recheck_pool::{Checker, Logger, ThreadWorkerFactory, WorkerPool, WorkerPoolConfig};
//!
//! struct AlwaysSafe;
//!
//! impl Checker for AlwaysSafe {
//!     fn check(&self, source: &str, flags: &str, _: &Parameters, _: Option<&Logger<'_>>) -> Diagnostics {
//!         serde_json::json!({ "source": source, "flags": flags, "status": "safe" }).into()
//!     }
//! }
//!
//! # async fn example() -> Result<(), recheck_pool::PoolError> {
//! let factory = Arc::new(ThreadWorkerFactory::new(Arc::new(AlwaysSafe)));
//! let pool = WorkerPool::new(factory, WorkerPoolConfig::new(4), KeepAlive::new())?;
//!
//! let diagnostics = pool.check("^a+$", "", CheckOptions::new()).await?;
//! assert_eq!(diagnostics.status(), Some("safe"));
//!
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod error;
pub mod pool;
pub mod port;
pub mod worker;

pub use bootstrap::{bootstrap_worker, run_stdio_worker, Checker, Logger};
pub use error::PoolError;
pub use pool::{PoolStats, TaskHandle, WorkerPool, WorkerPoolConfig};
pub use port::{ChannelPort, LinePort, MessagePort};
pub use worker::{
    ProcessWorkerFactory, ThreadWorkerFactory, Worker, WorkerEvents, WorkerFactory, WorkerId,
};
