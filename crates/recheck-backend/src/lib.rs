//! Backend selection for recheck.
//!
//! A [`Backend`] says how checks run: on an agent process (native or JVM) or
//! on a worker pool. [`create_check`] turns it into a live [`Dispatcher`].
//! [`Context`] owns the one dispatcher a process needs, created lazily on
//! first use from the loaded configuration.

pub mod backend;
pub mod context;
pub mod error;

pub use backend::{create_check, native_bin_name, AgentBackend, Backend, Dispatcher, WorkerPoolBackend};
pub use context::Context;
pub use error::BackendError;
