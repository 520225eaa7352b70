//! Error types for MCP operations.

use crate::client::ClientState;
use crate::tool::ToolContent;
use std::fmt;
use thiserror::Error;

/// Errors from tool server communication.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("Failed to start MCP server '{name}': {source}")]
    StartFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("Transport failure talking to '{server}': {source}")]
    Transport {
        server: String,
        source: std::io::Error,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    JsonRpc {
        server: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("MCP server '{server}' is not ready (state: {state})")]
    NotReady { server: String, state: ClientState },

    #[error("MCP server '{server}' is closed: {reason}")]
    Closed { server: String, reason: String },

    #[error("MCP server '{server}' was already started")]
    AlreadyStarted { server: String },

    #[error("Request '{method}' to '{server}' cancelled: {reason}")]
    Cancelled {
        server: String,
        method: String,
        reason: CancelReason,
    },

    #[error("Tool '{tool}' on '{server}' reported an error: {}", summarize(.content))]
    ToolFailed {
        server: String,
        tool: String,
        content: Vec<ToolContent>,
    },

    #[error("Invalid arguments for tool '{tool}': missing required {}", .missing.join(", "))]
    InvalidArguments { tool: String, missing: Vec<String> },

    #[error("Handshake with '{server}' failed during {stage}: {source}")]
    Handshake {
        server: String,
        stage: &'static str,
        source: Box<McpError>,
    },

    #[error("Request id {0} is already outstanding")]
    DuplicateRequestId(u64),

    #[error("Unknown MCP server '{0}'")]
    UnknownServer(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Whether the caller gave up on the request (token or deadline).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, McpError::Cancelled { .. })
    }
}

/// Why a request stopped waiting for its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired.
    Requested,
    /// The per-request deadline elapsed.
    DeadlineElapsed { timeout_ms: u64 },
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => f.write_str("cancelled by caller"),
            CancelReason::DeadlineElapsed { timeout_ms } => {
                write!(f, "no response after {timeout_ms}ms")
            }
        }
    }
}

fn summarize(content: &[ToolContent]) -> String {
    let text: Vec<&str> = content.iter().filter_map(ToolContent::as_text).collect();
    if text.is_empty() {
        format!("{} non-text content item(s)", content.len())
    } else {
        text.join("\n")
    }
}
