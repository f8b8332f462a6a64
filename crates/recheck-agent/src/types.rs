//! Agent error definitions and configuration.

use recheck_core::ProtocolError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while talking to an agent process.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The process failed to start or failed its liveness handshake.
    #[error("Failed to launch agent: {0}")]
    Launch(String),

    /// Agent executable not found. A launch failure, like `Launch`.
    #[error("Agent executable not found: {0}")]
    ExecutableNotFound(String),

    /// The transport closed while requests were outstanding.
    #[error("Agent process terminated")]
    ProcessTerminated,

    /// The agent wrote something that is not a protocol document.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The agent answered a request with an error response.
    #[error("Agent error: code={code}, message={message}")]
    Rpc { code: i64, message: String },

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the agent never started: the executable is missing, the
    /// process failed to spawn, or it failed the liveness handshake.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, AgentError::Launch(_) | AgentError::ExecutableNotFound(_))
    }
}

impl From<ProtocolError> for AgentError {
    fn from(err: ProtocolError) -> Self {
        AgentError::Protocol(err.to_string())
    }
}

/// Command line of an agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path or name of the executable.
    pub command: String,

    /// Arguments to pass to the executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to set.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the process.
    pub working_directory: Option<PathBuf>,
}

impl AgentConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_directory(mut self, dir: PathBuf) -> Self {
        self.working_directory = Some(dir);
        self
    }

    /// Native agent: `<bin> agent`.
    pub fn native(bin: impl Into<String>) -> Self {
        Self::new(bin).with_args(vec!["agent".to_string()])
    }

    /// JVM agent: `<java> -jar <jar> agent`.
    pub fn java(java: impl Into<String>, jar: impl Into<String>) -> Self {
        Self::new(java).with_args(vec!["-jar".to_string(), jar.into(), "agent".to_string()])
    }
}
