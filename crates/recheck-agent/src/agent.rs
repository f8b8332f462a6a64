//! Agent client for a single process connection.
//!
//! This module provides `Agent`, which multiplexes concurrent requests over
//! one agent process's stdio, routes streamed log lines to their subscribers,
//! and resolves each request exactly once.

use crate::transport::StdioTransport;
use crate::types::{AgentConfig, AgentError};
use recheck_core::{
    CancelParams, CheckOptions, CheckParams, Diagnostics, KeepAlive, KeepAliveGuard, LineFramer,
    LogFn, Method, ProtocolError, Request, RequestId, Response,
};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Size of a single read from the agent's stdout.
const READ_CHUNK_SIZE: usize = 8 * 1024;

type Reply = Result<Diagnostics, AgentError>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedTransport = Arc<tokio::sync::Mutex<StdioTransport>>;

/// Pending request waiting for its terminal response.
struct PendingRequest {
    sender: oneshot::Sender<Reply>,
    subscribe: Option<LogFn>,
}

/// Why the connection stopped accepting requests.
#[derive(Debug, Clone)]
enum Closed {
    Terminated,
    Protocol(String),
}

impl Closed {
    fn to_error(&self) -> AgentError {
        match self {
            Closed::Terminated => AgentError::ProcessTerminated,
            Closed::Protocol(message) => AgentError::Protocol(message.clone()),
        }
    }
}

struct PendingState {
    requests: HashMap<RequestId, PendingRequest>,
    closed: Option<Closed>,
    /// Held exactly while `requests` is non-empty.
    guard: Option<KeepAliveGuard>,
}

/// State shared between the `Agent` handle and its reader task.
struct Shared {
    state: Mutex<PendingState>,
    keep_alive: KeepAlive,
}

impl Shared {
    fn new(keep_alive: KeepAlive) -> Self {
        Self {
            state: Mutex::new(PendingState {
                requests: HashMap::new(),
                closed: None,
                guard: None,
            }),
            keep_alive,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, id: RequestId, request: PendingRequest) -> Result<(), AgentError> {
        let mut state = self.lock();
        if let Some(closed) = &state.closed {
            return Err(closed.to_error());
        }
        state.requests.insert(id, request);
        if state.requests.len() == 1 {
            state.guard = Some(self.keep_alive.acquire());
        }
        Ok(())
    }

    fn deregister(state: &mut PendingState, id: RequestId) -> Option<PendingRequest> {
        let request = state.requests.remove(&id)?;
        if state.requests.is_empty() {
            state.guard = None;
        }
        Some(request)
    }

    fn take(&self, id: RequestId) -> Option<PendingRequest> {
        Self::deregister(&mut self.lock(), id)
    }

    /// Route one response. Terminal responses for unknown ids are no-ops.
    fn dispatch(&self, response: Response) {
        match response {
            Response::Push(push) => {
                let subscriber = self
                    .lock()
                    .requests
                    .get(&push.id)
                    .and_then(|request| request.subscribe.clone());
                match subscriber {
                    Some(subscribe) => subscribe(&push.message),
                    None => trace!(id = push.id, "Dropping push message without subscriber"),
                }
            }
            Response::Result(result) => match self.take(result.id) {
                Some(request) => {
                    let _ = request.sender.send(Ok(result.result));
                }
                None => debug!(id = result.id, "Received result for unknown request"),
            },
            Response::Error(error) => match error.id {
                Some(id) => match self.take(id) {
                    Some(request) => {
                        let _ = request.sender.send(Err(AgentError::Rpc {
                            code: error.error.code,
                            message: error.error.message,
                        }));
                    }
                    None => debug!(id = id, "Received error for unknown request"),
                },
                None => warn!(
                    code = error.error.code,
                    message = %error.error.message,
                    "Agent reported an error without a request id"
                ),
            },
        }
    }

    /// Stop accepting requests and reject everything still pending.
    fn close(&self, reason: Closed) {
        let (error, drained) = {
            let mut state = self.lock();
            let reason = state.closed.get_or_insert(reason).clone();
            state.guard = None;
            let drained: Vec<PendingRequest> =
                state.requests.drain().map(|(_, request)| request).collect();
            (reason, drained)
        };

        if !drained.is_empty() {
            warn!(count = drained.len(), "Rejecting pending agent requests");
        }
        for request in drained {
            let _ = request.sender.send(Err(error.to_error()));
        }
    }
}

/// Future resolving to the terminal response of one request.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    rx: oneshot::Receiver<Reply>,
}

impl RequestHandle {
    /// Id of the request, usable with [`Agent::cancel`].
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for RequestHandle {
    type Output = Result<Diagnostics, AgentError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(AgentError::ProcessTerminated)))
    }
}

/// RPC client for one agent connection.
pub struct Agent {
    /// The agent process, absent for connections made with [`Agent::connect`].
    transport: Option<SharedTransport>,
    pid: Option<u32>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl Agent {
    /// Spawn an agent process and wait for it to answer a `ping`.
    pub async fn spawn(config: AgentConfig, keep_alive: KeepAlive) -> Result<Self, AgentError> {
        let command = config.command.clone();
        let (transport, stdin, stdout) = StdioTransport::spawn(config)?;

        let agent = Self::start(stdout, stdin, keep_alive, Some(transport)).await?;
        info!(command = %command, pid = ?agent.pid, "Agent ready");
        Ok(agent)
    }

    /// Run the agent protocol over an existing stream pair.
    ///
    /// Performs the same liveness handshake as [`Agent::spawn`].
    pub async fn connect<R, W>(
        reader: R,
        writer: W,
        keep_alive: KeepAlive,
    ) -> Result<Self, AgentError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(reader, writer, keep_alive, None).await
    }

    async fn start<R, W>(
        reader: R,
        writer: W,
        keep_alive: KeepAlive,
        transport: Option<StdioTransport>,
    ) -> Result<Self, AgentError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::new(keep_alive));
        let pid = transport.as_ref().and_then(StdioTransport::pid);
        let transport = transport.map(|t| Arc::new(tokio::sync::Mutex::new(t)));
        let reader_handle = tokio::spawn(Self::reader_loop(
            reader,
            shared.clone(),
            transport.clone(),
        ));

        let agent = Self {
            pid,
            transport,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            next_id: AtomicU64::new(0),
            shared,
            reader_handle,
        };

        // On failure `agent` is dropped here, which kills the process.
        agent
            .ping()
            .await
            .map_err(|e| AgentError::Launch(format!("Liveness handshake failed: {}", e)))?;

        Ok(agent)
    }

    /// Background task that reads responses from the agent.
    ///
    /// A malformed message is fatal: the connection is closed and the
    /// process, if any, is killed.
    async fn reader_loop<R: AsyncRead + Unpin>(
        mut reader: R,
        shared: Arc<Shared>,
        transport: Option<SharedTransport>,
    ) {
        let mut framer = LineFramer::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("Agent closed stdout");
                    shared.close(Closed::Terminated);
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Error reading from agent");
                    shared.close(Closed::Terminated);
                    return;
                }
            };

            for line in framer.feed(&buf[..n]) {
                let response = line.and_then(|line| {
                    trace!(line = %line, "Received agent message");
                    Response::from_line(&line)
                });
                match response {
                    Ok(response) => shared.dispatch(response),
                    Err(e) => {
                        warn!(error = %e, "Malformed message from agent");
                        shared.close(Closed::Protocol(e.to_string()));
                        if let Some(transport) = &transport {
                            Self::kill_transport(transport).await;
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Send a request expecting a reply.
    ///
    /// `subscribe` receives the request's push messages, in order, before the
    /// returned handle resolves.
    pub async fn request(
        &self,
        method: Method,
        params: Value,
        subscribe: Option<LogFn>,
    ) -> Result<RequestHandle, AgentError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = Request::new(Some(id), method, params).to_line()?;

        let (tx, rx) = oneshot::channel();
        self.shared.register(
            id,
            PendingRequest {
                sender: tx,
                subscribe,
            },
        )?;

        trace!(method = %method, id = id, "Sending agent request");
        if let Err(e) = self.write(&line).await {
            self.shared.take(id);
            return Err(e);
        }

        Ok(RequestHandle { id, rx })
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: Method, params: Value) -> Result<(), AgentError> {
        let line = Request::new(None, method, params).to_line()?;
        trace!(method = %method, "Sending agent notification");
        self.write(&line).await
    }

    /// Ask the agent to abandon request `id`.
    ///
    /// Advisory only: the request stays pending until its terminal response arrives.
    pub async fn cancel(&self, id: RequestId) -> Result<(), AgentError> {
        let params = serde_json::to_value(CancelParams { id }).map_err(ProtocolError::from)?;
        self.notify(Method::Cancel, params).await
    }

    /// Liveness check.
    pub async fn ping(&self) -> Result<(), AgentError> {
        self.request(Method::Ping, Value::Object(Default::default()), None)
            .await?
            .await
            .map(|_| ())
    }

    /// Check one pattern.
    ///
    /// If `options.cancel` fires first, a `cancel` notification is sent and
    /// the agent's terminal response is still awaited.
    pub async fn check(
        &self,
        source: &str,
        flags: &str,
        options: CheckOptions,
    ) -> Result<Diagnostics, AgentError> {
        let (params, logger, cancel) = options.into_parts();
        let params = serde_json::to_value(CheckParams {
            source: source.to_string(),
            flags: flags.to_string(),
            params,
        })
        .map_err(ProtocolError::from)?;

        let mut handle = self.request(Method::Check, params, logger).await?;
        let Some(token) = cancel else {
            return handle.await;
        };

        let id = handle.id();
        tokio::select! {
            result = &mut handle => result,
            _ = token.cancelled() => {
                debug!(id = id, "Cancelling agent request");
                if let Err(e) = self.cancel(id).await {
                    warn!(id = id, error = %e, "Failed to send cancel notification");
                }
                handle.await
            }
        }
    }

    async fn write(&self, line: &str) -> Result<(), AgentError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn kill_transport(transport: &SharedTransport) {
        let mut transport = transport.lock().await;
        if transport.is_running() {
            if let Err(e) = transport.kill().await {
                warn!(error = %e, "Failed to kill agent process");
            }
        }
    }

    /// Terminate the agent unconditionally. Pending requests are rejected.
    pub async fn kill(&self) -> Result<(), AgentError> {
        if let Some(transport) = &self.transport {
            let mut transport = transport.lock().await;
            if transport.is_running() {
                transport.kill().await?;
            }
        }
        self.reader_handle.abort();
        self.shared.close(Closed::Terminated);
        Ok(())
    }

    /// Whether the connection has stopped accepting requests.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed.is_some()
    }

    /// Number of requests awaiting a terminal response.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().requests.len()
    }

    /// Process id of a spawned agent.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}
