//! MCP (Model Context Protocol) client for KubeStellar Console tool servers.
//!
//! A tool server is a child process speaking newline-delimited JSON-RPC 2.0
//! on its stdin and stdout. [`McpClient`] launches one, runs the
//! initialize handshake, snapshots its tool catalog, and lets any number of
//! tasks call tools at once with per-call cancellation and deadlines.
//! [`McpManager`] does the same for every server in an [`McpConfig`].

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod manager;
pub mod process;
pub mod registry;
pub mod tool;

pub use client::{CallContext, ClientOptions, ClientState, McpClient, PROTOCOL_VERSION};
pub use config::{ClientIdentity, McpConfig, McpServerConfig};
pub use error::{CancelReason, McpError};
pub use manager::McpManager;
pub use tool::{Implementation, InitializeResult, InputSchema, Property, Tool, ToolContent};
