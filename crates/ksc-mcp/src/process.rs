//! Child process supervision for stdio tool servers.
//!
//! The supervisor is the only owner of the child handle: nothing else may
//! signal or wait on it.

use crate::config::McpServerConfig;
use crate::error::McpError;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

/// The three pipes of a running server.
pub struct ProcessPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// A tool server process: configured, then started, then stopped.
pub struct ServerProcess {
    name: String,
    command: Command,
    child: Option<Child>,
    stderr_drain: Option<JoinHandle<()>>,
}

impl ServerProcess {
    /// Prepare the command with all three stdio streams piped. Nothing runs yet.
    pub fn spawn(name: impl Into<String>, config: &McpServerConfig) -> Result<Self, McpError> {
        let name = name.into();
        if config.command.trim().is_empty() {
            return Err(McpError::SpawnFailed {
                name,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "no command configured",
                ),
            });
        }

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        Ok(Self {
            name,
            command,
            child: None,
            stderr_drain: None,
        })
    }

    /// Execute the child and hand out its pipes.
    pub fn start(&mut self) -> Result<ProcessPipes, McpError> {
        let mut child = self.command.spawn().map_err(|e| McpError::StartFailed {
            name: self.name.clone(),
            source: e,
        })?;

        let pipes = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => ProcessPipes {
                stdin,
                stdout,
                stderr,
            },
            _ => {
                let _ = child.start_kill();
                return Err(McpError::SpawnFailed {
                    name: self.name.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "child stdio was not piped",
                    ),
                });
            }
        };

        tracing::debug!(server = %self.name, pid = ?child.id(), "MCP server process started");
        self.child = Some(child);
        Ok(pipes)
    }

    /// Forward stderr lines to the log until the stream closes.
    pub fn drain_stderr(&mut self, stderr: ChildStderr) {
        let name = self.name.clone();
        self.stderr_drain = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => tracing::debug!(server = %name, "stderr: {line}"),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(server = %name, "stderr unreadable: {e}");
                        break;
                    }
                }
            }
        }));
    }

    /// OS process id while the child is running.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Kill and reap the child. Safe to call repeatedly, before start, or
    /// after the child already exited on its own.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(server = %self.name, %status, "MCP server already exited");
                }
                _ => {
                    if let Err(e) = child.kill().await {
                        tracing::debug!(server = %self.name, "kill failed: {e}");
                    }
                }
            }
        }
        if let Some(drain) = self.stderr_drain.take() {
            drain.abort();
        }
    }
}
