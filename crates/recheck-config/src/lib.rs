//! Configuration for recheck.
//!
//! Settings are layered, later layers winning:
//!
//! 1. built-in defaults
//! 2. a TOML file: an explicit path, else `<config_dir>/recheck/config.toml` if it exists
//! 3. `RECHECK_*` environment variables
//!
//! Nested keys use a double underscore in the environment, for example
//! `RECHECK_POOL__SIZE=4`. The short forms `RECHECK_BIN` and `RECHECK_JAR`
//! set `agent.bin` and `agent.jar`.
//!
//! ```toml
//! backend = "thread-worker"
//!
//! [agent]
//! bin = "~/.local/bin/recheck-linux-x64"
//!
//! [pool]
//! size = 4
//! ```

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Prefix of every environment variable read by [`Config::load`].
pub const ENV_PREFIX: &str = "RECHECK";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid path {path:?}: {message}")]
    InvalidPath { path: String, message: String },

    #[error("Unknown backend '{0}' (expected native, java, worker, thread-worker or web-worker)")]
    UnknownBackend(String),
}

/// Which execution backend checks are dispatched to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// The platform-specific native agent executable.
    #[default]
    Native,
    /// The agent packaged as a jar, run on a JVM.
    Java,
    /// A pool of worker processes.
    Worker,
    /// A pool of in-process worker threads.
    ThreadWorker,
    /// Browser web workers. Recognised so that it can be rejected clearly.
    WebWorker,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Java => "java",
            BackendKind::Worker => "worker",
            BackendKind::ThreadWorker => "thread-worker",
            BackendKind::WebWorker => "web-worker",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(BackendKind::Native),
            "java" => Ok(BackendKind::Java),
            "worker" => Ok(BackendKind::Worker),
            "thread-worker" => Ok(BackendKind::ThreadWorker),
            "web-worker" => Ok(BackendKind::WebWorker),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

/// Agent process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Native agent executable. Looked up on `PATH` when unset.
    pub bin: Option<PathBuf>,
    /// Agent jar for the `java` backend.
    pub jar: Option<PathBuf>,
    /// Java launcher.
    pub java: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            bin: None,
            jar: None,
            java: "java".to_string(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum number of live workers.
    pub size: usize,
    /// Worker executable for the `worker` backend.
    pub worker_command: Option<String>,
    pub worker_args: Vec<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 1,
            worker_command: None,
            worker_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default `tracing` filter when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,
    pub agent: AgentSettings,
    pub pool: PoolSettings,
    pub logging: LoggingSettings,
}

impl Config {
    /// Load configuration from the default layers, reading the process environment.
    ///
    /// An explicit `path` must exist; the default file location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Like [`Config::load`], but with `env` standing in for the process
    /// environment when given.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                debug!(path = %path.display(), "Loading configuration file");
                builder = builder.add_source(File::from(path).format(FileFormat::Toml));
            }
            None => {
                if let Some(path) = default_config_path().filter(|p| p.exists()) {
                    debug!(path = %path.display(), "Loading configuration file");
                    builder = builder.add_source(File::from(path).format(FileFormat::Toml));
                }
            }
        }

        let lookup = |key: &str| {
            let value = match &env {
                Some(env) => env.get(key).cloned(),
                None => std::env::var(key).ok(),
            };
            value.filter(|v| !v.is_empty())
        };
        let bin = lookup("RECHECK_BIN");
        let jar = lookup("RECHECK_JAR");

        builder = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("pool.worker_args")
                    .try_parsing(true)
                    .source(env),
            )
            .set_override_option("agent.bin", bin)?
            .set_override_option("agent.jar", jar)?;

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.expand_paths()?;
        Ok(config)
    }

    /// Expand `~` and environment variables in path-like settings.
    fn expand_paths(&mut self) -> Result<(), ConfigError> {
        if let Some(bin) = &self.agent.bin {
            self.agent.bin = Some(expand_path(bin)?);
        }
        if let Some(jar) = &self.agent.jar {
            self.agent.jar = Some(expand_path(jar)?);
        }
        if let Some(command) = &self.pool.worker_command {
            self.pool.worker_command = Some(expand(command)?);
        }
        Ok(())
    }
}

/// `<config_dir>/recheck/config.toml`, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("recheck").join("config.toml"))
}

fn expand(value: &str) -> Result<String, ConfigError> {
    shellexpand::full(value)
        .map(|expanded| expanded.into_owned())
        .map_err(|e| ConfigError::InvalidPath {
            path: value.to_string(),
            message: e.to_string(),
        })
}

fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
    expand(&path.to_string_lossy()).map(PathBuf::from)
}
