//! Shared protocol and runtime primitives for recheck task dispatch.
//!
//! This crate has no knowledge of how checks are executed. It defines:
//!
//! - `Request` / `Response`: the JSON envelopes exchanged with agents and workers
//! - `LineFramer`: reassembly of newline-delimited documents from stream chunks
//! - `Diagnostics` / `Parameters`: opaque payloads carried through the core
//! - `CheckOptions`: per-call logger and cancellation settings
//! - `KeepAlive`: a counter of outstanding work used to decide when a host may exit
//!
//! # Wire format
//!
//! Every document is a single line of JSON terminated by `\n`:
//!
//! ```text
//! -> {"jsonrpc":"2.0+push","id":0,"method":"ping","params":{}}
//! <- {"jsonrpc":"2.0+push","id":0,"result":null}
//! -> {"jsonrpc":"2.0+push","id":1,"method":"check","params":{"source":"^a+$","flags":"","params":{}}}
//! <- {"id":1,"message":"start"}
//! <- {"id":1,"result":{"source":"^a+$","flags":"","status":"safe"}}
//! ```

pub mod diagnostics;
pub mod framing;
pub mod keep_alive;
pub mod options;
pub mod protocol;

pub use diagnostics::{Diagnostics, Parameters};
pub use framing::LineFramer;
pub use keep_alive::{KeepAlive, KeepAliveGuard};
pub use options::{CheckOptions, LogFn};
pub use protocol::{
    CancelParams, CheckParams, ErrorResponse, Method, ProtocolError, PushResponse, Request,
    RequestId, Response, ResultResponse, RpcError, TaskMessage, PROTOCOL_VERSION,
};

// Re-exported so callers can build cancellation signals without a direct dependency.
pub use tokio_util::sync::CancellationToken;
