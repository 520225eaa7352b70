//! One MCP server connection: handshake, request correlation and shutdown.
//!
//! Handles the MCP protocol handshake (initialize + initialized notification),
//! tool discovery (tools/list), and tool invocation (tools/call). A single
//! reader task owns the server's output for the client's lifetime and routes
//! responses to whichever caller is waiting on the matching id.

use crate::codec::{FrameReader, FrameSink, FrameWriter};
use crate::config::{ClientIdentity, McpServerConfig};
use crate::error::{CancelReason, McpError};
use crate::jsonrpc::{
    Envelope, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    METHOD_NOT_FOUND,
};
use crate::process::ServerProcess;
use crate::registry::PendingCalls;
use crate::tool::{InitializeResult, Tool, ToolCallResult, ToolContent, ToolsListResult};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// MCP protocol version we support.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Lifecycle of a client. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClientState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Closed = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Uninitialized,
            1 => ClientState::Initializing,
            2 => ClientState::Ready,
            _ => ClientState::Closed,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClientState::Uninitialized => "uninitialized",
            ClientState::Initializing => "initializing",
            ClientState::Ready => "ready",
            ClientState::Closed => "closed",
        })
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> ClientState {
        ClientState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to` if that is forward of the current state.
    fn advance(&self, to: ClientState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (to as u8 > current).then_some(to as u8)
            })
            .is_ok()
    }
}

/// Cancellation and deadline for one request.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Fires to abandon the request.
    pub cancel: CancellationToken,
    /// Overrides the client's default request timeout.
    pub timeout: Option<Duration>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Per-client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_info: ClientIdentity,
    /// Deadline applied when a call brings none of its own.
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_info: ClientIdentity::default(),
            request_timeout: Duration::from_millis(30000),
        }
    }
}

impl ClientOptions {
    pub fn for_server(config: &McpServerConfig, client_info: &ClientIdentity) -> Self {
        Self {
            client_info: client_info.clone(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// State shared between the client handle and its reader task.
struct Shared {
    name: String,
    state: StateCell,
    pending: PendingCalls,
    writer: OnceLock<FrameWriter>,
}

impl Shared {
    async fn send(&self, envelope: &Envelope) -> Result<(), McpError> {
        let Some(writer) = self.writer.get() else {
            return Err(McpError::NotReady {
                server: self.name.clone(),
                state: self.state.get(),
            });
        };
        if let Err(e) = writer.send(envelope).await {
            if matches!(e, McpError::Transport { .. }) {
                self.close(&e.to_string());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Enter `Closed` and fail every outstanding request.
    fn close(&self, reason: &str) {
        if self.state.advance(ClientState::Closed) {
            tracing::info!("MCP server '{}' closed: {}", self.name, reason);
        }
        let released = self.pending.close(reason);
        if released > 0 {
            tracing::debug!(server = %self.name, released, "released pending requests");
        }
    }

    fn closed_error(&self) -> McpError {
        McpError::Closed {
            server: self.name.clone(),
            reason: self
                .pending
                .closed_reason()
                .unwrap_or_else(|| "client closed".to_string()),
        }
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Response(response) => {
                let id = response.id.clone();
                if !self.pending.resolve(&id, response) {
                    tracing::debug!(server = %self.name, %id, "Dropping response with no waiter");
                }
            }
            Envelope::Request(request) => {
                let reply = if request.method == "ping" {
                    JsonRpcResponse::success(request.id, serde_json::json!({}))
                } else {
                    JsonRpcResponse::failure(
                        request.id,
                        JsonRpcError {
                            code: METHOD_NOT_FOUND,
                            message: format!("Method not found: {}", request.method),
                            data: None,
                        },
                    )
                };
                // Replying from the reader would stall it if the server stops
                // draining its input.
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = shared.send(&Envelope::Response(reply)).await {
                        tracing::debug!(server = %shared.name, "reply to server failed: {e}");
                    }
                });
            }
            Envelope::Notification(notification) => {
                tracing::debug!(
                    server = %self.name,
                    method = %notification.method,
                    "server notification"
                );
            }
        }
    }
}

/// Drains the server's output until it ends, then closes the client.
async fn read_loop(shared: Arc<Shared>, mut reader: FrameReader) {
    let reason = loop {
        match reader.next_frame().await {
            Ok(Some(Ok(envelope))) => shared.dispatch(envelope),
            Ok(Some(Err(e))) => {
                tracing::warn!("Skipping message from MCP server '{}': {}", shared.name, e);
            }
            Ok(None) => break "server closed its output".to_string(),
            Err(e) => break format!("reading server output failed: {e}"),
        }
    };
    shared.close(&reason);
}

/// Removes a registry entry if the waiting caller goes away without an answer.
struct AbandonOnDrop<'a> {
    pending: &'a PendingCalls,
    id: u64,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed && self.pending.abandon(self.id) {
            tracing::trace!(id = self.id, "request abandoned");
        }
    }
}

type Streams = (FrameReader, FrameSink);

/// Client for a single MCP server.
pub struct McpClient {
    shared: Arc<Shared>,
    options: ClientOptions,
    process: tokio::sync::Mutex<Option<ServerProcess>>,
    streams: Mutex<Option<Streams>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    tools: OnceLock<Vec<Tool>>,
    server_info: OnceLock<InitializeResult>,
}

impl McpClient {
    fn build(
        name: String,
        options: ClientOptions,
        process: Option<ServerProcess>,
        streams: Option<Streams>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: PendingCalls::new(name.clone()),
                name,
                state: StateCell(AtomicU8::new(ClientState::Uninitialized as u8)),
                writer: OnceLock::new(),
            }),
            options,
            process: tokio::sync::Mutex::new(process),
            streams: Mutex::new(streams),
            reader_task: Mutex::new(None),
            tools: OnceLock::new(),
            server_info: OnceLock::new(),
        }
    }

    /// Prepare a client for a server process. Nothing runs until [`start`](Self::start).
    pub fn spawn(
        name: impl Into<String>,
        config: &McpServerConfig,
        options: ClientOptions,
    ) -> Result<Self, McpError> {
        let name = name.into();
        let process = ServerProcess::spawn(name.clone(), config)?;
        Ok(Self::build(name, options, Some(process), None))
    }

    /// A client speaking over already-connected streams instead of a child process.
    pub fn with_transport(
        name: impl Into<String>,
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
        options: ClientOptions,
    ) -> Self {
        let name = name.into();
        let streams = (FrameReader::new(reader), FrameSink::new(writer));
        Self::build(name, options, None, Some(streams))
    }

    /// Connect to an MCP server: spawn, handshake, discover tools.
    pub async fn connect(
        name: impl Into<String>,
        config: &McpServerConfig,
        options: ClientOptions,
    ) -> Result<Self, McpError> {
        let client = Self::spawn(name, config, options)?;
        client.start(&CallContext::default()).await?;
        Ok(client)
    }

    /// Launch the server and run the handshake. On failure the client is
    /// stopped and stays closed.
    pub async fn start(&self, ctx: &CallContext) -> Result<(), McpError> {
        if !self.shared.state.advance(ClientState::Initializing) {
            if self.shared.state.get() == ClientState::Closed {
                return Err(self.shared.closed_error());
            }
            return Err(McpError::AlreadyStarted {
                server: self.shared.name.clone(),
            });
        }

        let reader = match self.attach().await {
            Ok(reader) => reader,
            Err(e) => {
                self.stop().await;
                return Err(e);
            }
        };
        let task = tokio::spawn(read_loop(Arc::clone(&self.shared), reader));
        *self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        if let Err(e) = self.handshake(ctx).await {
            tracing::warn!("MCP server '{}' failed to initialize: {}", self.shared.name, e);
            self.stop().await;
            return Err(e);
        }
        if !self.shared.state.advance(ClientState::Ready) {
            let e = self.shared.closed_error();
            self.stop().await;
            return Err(e);
        }

        tracing::info!(
            "MCP server '{}' connected with {} tools",
            self.shared.name,
            self.tools().len()
        );
        Ok(())
    }

    async fn attach(&self) -> Result<FrameReader, McpError> {
        let streams = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (reader, sink) = match streams {
            Some(streams) => streams,
            None => {
                let mut process = self.process.lock().await;
                let Some(process) = process.as_mut() else {
                    return Err(self.shared.closed_error());
                };
                let pipes = process.start()?;
                process.drain_stderr(pipes.stderr);
                (FrameReader::new(pipes.stdout), FrameSink::new(pipes.stdin))
            }
        };

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let writer = FrameWriter::spawn(self.shared.name.clone(), sink, move |e| {
            if let Some(shared) = shared.upgrade() {
                shared.close(&format!("writing to server failed: {e}"));
            }
        });
        let _ = self.shared.writer.set(writer);
        Ok(reader)
    }

    async fn handshake(&self, ctx: &CallContext) -> Result<(), McpError> {
        let server = self.shared.name.clone();
        let stage = |stage: &'static str| {
            let server = server.clone();
            move |e: McpError| McpError::Handshake {
                server,
                stage,
                source: Box::new(e),
            }
        };

        let init_params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.options.client_info.name,
                "version": self.options.client_info.version,
            }
        });
        let result = self
            .request("initialize", Some(init_params), ctx)
            .await
            .map_err(stage("initialize"))?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse initialize result: {e}")))
            .map_err(stage("initialize"))?;
        if init.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                "MCP server '{}' speaks protocol {} (we asked for {})",
                self.shared.name,
                init.protocol_version,
                PROTOCOL_VERSION
            );
        }

        let initialized = JsonRpcNotification::new("notifications/initialized", None);
        self.shared
            .send(&Envelope::Notification(initialized))
            .await
            .map_err(stage("notifications/initialized"))?;

        let result = self
            .request("tools/list", None, ctx)
            .await
            .map_err(stage("tools/list"))?;
        let list: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/list response: {e}")))
            .map_err(stage("tools/list"))?;

        let _ = self.tools.set(list.tools);
        let _ = self.server_info.set(init);
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), McpError> {
        match self.shared.state.get() {
            ClientState::Ready => Ok(()),
            ClientState::Closed => Err(self.shared.closed_error()),
            state => Err(McpError::NotReady {
                server: self.shared.name.clone(),
                state,
            }),
        }
    }

    /// Send a request and wait for its response, the caller's cancellation,
    /// or the deadline, whichever comes first.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, McpError> {
        self.ensure_ready()?;
        self.request(method, params, ctx).await
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, McpError> {
        let cancelled = |reason| McpError::Cancelled {
            server: self.shared.name.clone(),
            method: method.to_string(),
            reason,
        };
        if ctx.cancel.is_cancelled() {
            return Err(cancelled(CancelReason::Requested));
        }

        let pending = &self.shared.pending;
        let id = pending.next_id();
        let rx = pending.register(id)?;
        let mut guard = AbandonOnDrop {
            pending,
            id,
            armed: true,
        };

        let timeout = ctx.timeout.unwrap_or(self.options.request_timeout);
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        let elapsed = || {
            cancelled(CancelReason::DeadlineElapsed {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        };

        // The write itself can stall when the server stops reading, so the
        // token and deadline cover it too.
        let request = Envelope::Request(JsonRpcRequest::new(id, method, params));
        tokio::select! {
            biased;
            sent = self.shared.send(&request) => sent?,
            _ = ctx.cancel.cancelled() => return Err(cancelled(CancelReason::Requested)),
            _ = tokio::time::sleep_until(deadline) => return Err(elapsed()),
        }

        let delivered = tokio::select! {
            biased;
            delivered = rx => delivered,
            _ = ctx.cancel.cancelled() => return Err(cancelled(CancelReason::Requested)),
            _ = tokio::time::sleep_until(deadline) => return Err(elapsed()),
        };
        guard.armed = false;

        let response = delivered.map_err(|_| self.shared.closed_error())?;
        if let Some(err) = response.error {
            return Err(McpError::JsonRpc {
                server: self.shared.name.clone(),
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    /// Send a notification. Returns once written; nothing is awaited.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.ensure_ready()?;
        let notification = JsonRpcNotification::new(method, params);
        self.shared.send(&Envelope::Notification(notification)).await
    }

    /// Call a tool on this server.
    ///
    /// A result flagged `isError` becomes [`McpError::ToolFailed`] carrying the
    /// server's content as diagnostics.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
        ctx: &CallContext,
    ) -> Result<Vec<ToolContent>, McpError> {
        self.ensure_ready()?;
        if let Some(tool) = self.tool(tool_name) {
            let missing = tool.missing_required(&arguments);
            if !missing.is_empty() {
                return Err(McpError::InvalidArguments {
                    tool: tool_name.to_string(),
                    missing: missing.into_iter().map(str::to_string).collect(),
                });
            }
        }

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let result = self.request("tools/call", Some(params), ctx).await?;

        let call_result: ToolCallResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/call result: {e}")))?;
        if call_result.is_error {
            return Err(McpError::ToolFailed {
                server: self.shared.name.clone(),
                tool: tool_name.to_string(),
                content: call_result.content,
            });
        }
        Ok(call_result.content)
    }

    /// The tools discovered during the handshake.
    pub fn tools(&self) -> &[Tool] {
        self.tools.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Look up a discovered tool by name.
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools().iter().find(|t| t.name == name)
    }

    /// What the server reported during `initialize`.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.get()
    }

    pub fn state(&self) -> ClientState {
        self.shared.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// Get the server name.
    pub fn server_name(&self) -> &str {
        &self.shared.name
    }

    /// Number of requests still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Close the client and kill the server. Safe to call more than once.
    pub async fn stop(&self) {
        self.shared.close("client stopped");

        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            process.stop().await;
        }
        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        if let Some(writer) = self.shared.writer.get() {
            writer.close().await;
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        let task = self
            .reader_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}
