//! ksc: talk to KubeStellar Console MCP tool servers from the terminal.

mod config;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ksc_mcp::{CallContext, McpError, McpManager, ToolContent};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "ksc",
    version,
    about = "Talk to KubeStellar Console MCP tool servers"
)]
struct Cli {
    /// Server configuration file (overrides KSC_MCP_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every configured server and show how many tools each offers
    Servers,

    /// List the tools offered by the configured servers
    Tools {
        /// Only start and list this server
        #[arg(long)]
        server: Option<String>,
    },

    /// Call a tool on a server and print its output
    Call {
        /// Server name from the configuration
        server: String,

        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Give up on the call after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let mcp_config = config::load(cli.config.as_deref())?;

    // Ctrl-C cancels whatever is in flight; the manager is still shut down below.
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupted, cancelling");
            ctrl_c.cancel();
        }
    });
    let ctx = CallContext::new().with_cancel(cancel);

    match cli.command {
        Command::Servers => {
            if mcp_config.servers.is_empty() {
                eprintln!("No MCP servers configured.");
                return Ok(ExitCode::SUCCESS);
            }
            let manager = McpManager::start(&mcp_config, &ctx).await;
            for name in mcp_config.servers.keys() {
                if let Some(client) = manager.client(name) {
                    let version = client
                        .server_info()
                        .map(|info| info.server_info.version.as_str())
                        .unwrap_or("?");
                    println!("{name}\tready\t{} tools\t{version}", client.tools().len());
                } else if let Some((_, e)) = manager.failed().iter().find(|(n, _)| n == name) {
                    println!("{name}\tfailed\t{e}");
                } else {
                    println!("{name}\tnot started");
                }
            }
            let healthy = manager.failed().is_empty();
            manager.shutdown().await;

            Ok(if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Tools { server } => {
            let mcp_config = config::select(mcp_config, server.as_deref())?;
            let manager = McpManager::start(&mcp_config, &ctx).await;
            for (client, tool) in manager.tools() {
                println!(
                    "{}\t{}\t{}",
                    client.server_name(),
                    tool.name,
                    first_line(&tool.description)
                );
            }
            let started = manager.client_count();
            manager.shutdown().await;

            if let (Some(name), 0) = (server, started) {
                bail!("MCP server '{name}' failed to start");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Call {
            server,
            tool,
            args,
            timeout_ms,
        } => {
            let arguments = parse_arguments(&args)?;
            let mcp_config = config::select(mcp_config, Some(&server))?;
            let manager = McpManager::start(&mcp_config, &ctx).await;
            if manager.client(&server).is_none() {
                manager.shutdown().await;
                bail!("MCP server '{server}' failed to start");
            }

            let call_ctx = match timeout_ms {
                Some(ms) => ctx.clone().with_timeout(Duration::from_millis(ms)),
                None => ctx.clone(),
            };
            let result = manager.call_tool(&server, &tool, arguments, &call_ctx).await;
            manager.shutdown().await;

            match result {
                Ok(content) => {
                    for item in &content {
                        println!("{}", render(item));
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(McpError::ToolFailed { content, .. }) => {
                    eprintln!("Tool '{tool}' reported an error:");
                    for item in &content {
                        eprintln!("{}", render(item));
                    }
                    Ok(ExitCode::FAILURE)
                }
                Err(e) => Err(e).with_context(|| format!("Calling {server}/{tool} failed")),
            }
        }
    }
}

/// Parse `--args` into a JSON object.
fn parse_arguments(raw: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str(raw).context("--args is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--args must be a JSON object, got: {other}"),
    }
}

/// Printable form of one content item.
fn render(item: &ToolContent) -> String {
    match item {
        ToolContent::Text { text } => text.clone(),
        ToolContent::Image { data, mime_type } => {
            format!("[image: {mime_type}, {} bytes base64]", data.len())
        }
        ToolContent::Resource { resource } => {
            serde_json::to_string_pretty(resource).unwrap_or_else(|_| resource.to_string())
        }
        ToolContent::Unsupported => "[unsupported content]".to_string(),
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}
