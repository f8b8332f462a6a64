//! Stdio transport for agent processes.
//!
//! This module handles spawning the agent process and providing
//! stdin/stdout handles for the line protocol.

use crate::types::{AgentConfig, AgentError};
use std::process::Stdio;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

/// Owns a spawned agent process.
pub struct StdioTransport {
    /// The spawned agent process.
    process: Child,
    /// Process configuration.
    config: AgentConfig,
}

impl StdioTransport {
    /// Spawn a new agent process.
    ///
    /// Returns the transport along with the stdin and stdout handles
    /// for communication. Stderr is discarded.
    pub fn spawn(config: AgentConfig) -> Result<(Self, ChildStdin, ChildStdout), AgentError> {
        let command_path = Self::resolve_command(&config.command)?;
        info!(command = %command_path, args = ?config.args, "Spawning agent process");

        let mut cmd = Command::new(&command_path);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        if let Some(ref dir) = config.working_directory {
            cmd.current_dir(dir);
        }

        let mut process = cmd.spawn().map_err(|e| {
            AgentError::Launch(format!("Failed to spawn '{}': {}", config.command, e))
        })?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| AgentError::Launch("Failed to capture stdin".to_string()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| AgentError::Launch("Failed to capture stdout".to_string()))?;

        debug!(pid = ?process.id(), "Agent process started");

        Ok((Self { process, config }, stdin, stdout))
    }

    /// Resolve the command path, checking if it exists.
    pub(crate) fn resolve_command(command: &str) -> Result<String, AgentError> {
        let path = std::path::Path::new(command);
        if path.is_absolute() {
            if path.exists() {
                return Ok(command.to_string());
            } else {
                return Err(AgentError::ExecutableNotFound(command.to_string()));
            }
        }

        match which::which(command) {
            Ok(path) => Ok(path.to_string_lossy().to_string()),
            Err(_) => Err(AgentError::ExecutableNotFound(command.to_string())),
        }
    }

    /// Get the process ID if available.
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    /// Check if the process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    /// Kill the agent process and reap it.
    pub async fn kill(&mut self) -> Result<(), AgentError> {
        info!(command = %self.config.command, pid = ?self.process.id(), "Killing agent process");
        self.process.kill().await.map_err(AgentError::from)
    }
}
