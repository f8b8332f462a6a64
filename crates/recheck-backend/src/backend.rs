//! Backend description and the dispatcher built from it.

use crate::error::BackendError;
use recheck_agent::{Agent, AgentConfig};
use recheck_config::{BackendKind, Config};
use recheck_core::{CheckOptions, Diagnostics, KeepAlive};
use recheck_pool::{
    Checker, ProcessWorkerFactory, ThreadWorkerFactory, WorkerFactory, WorkerPool,
    WorkerPoolConfig,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// An agent process to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentBackend {
    /// `<bin> agent`
    Native { bin: PathBuf },
    /// `<java> -jar <jar> agent`
    Java { java: String, jar: PathBuf },
}

impl AgentBackend {
    pub fn agent_config(&self) -> AgentConfig {
        match self {
            AgentBackend::Native { bin } => AgentConfig::native(bin.to_string_lossy()),
            AgentBackend::Java { java, jar } => {
                AgentConfig::java(java.as_str(), jar.to_string_lossy())
            }
        }
    }
}

/// A worker pool to build.
#[derive(Clone)]
pub struct WorkerPoolBackend {
    pub factory: Arc<dyn WorkerFactory>,
    pub size: usize,
}

impl fmt::Debug for WorkerPoolBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolBackend")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// How checks are executed.
#[derive(Debug, Clone)]
pub enum Backend {
    Agent(AgentBackend),
    WorkerPool(WorkerPoolBackend),
}

impl Backend {
    /// Select the backend named by `config`.
    ///
    /// `checker` is the in-process checking capability used by thread workers.
    pub fn from_config(
        config: &Config,
        checker: Option<Arc<dyn Checker>>,
    ) -> Result<Self, BackendError> {
        let kind = config.backend;
        let backend = match kind {
            BackendKind::Native => {
                let bin = match &config.agent.bin {
                    Some(bin) => bin.clone(),
                    None => resolve_native_bin()?,
                };
                Backend::Agent(AgentBackend::Native { bin })
            }
            BackendKind::Java => {
                let jar = config.agent.jar.clone().ok_or(BackendError::MissingSetting {
                    backend: kind,
                    setting: "agent.jar (RECHECK_JAR)",
                })?;
                Backend::Agent(AgentBackend::Java {
                    java: config.agent.java.clone(),
                    jar,
                })
            }
            BackendKind::ThreadWorker => {
                let checker = checker.ok_or(BackendError::MissingSetting {
                    backend: kind,
                    setting: "an in-process checker",
                })?;
                thread_pool(checker, config.pool.size)
            }
            BackendKind::Worker => match (&config.pool.worker_command, checker) {
                (Some(command), _) => Backend::WorkerPool(WorkerPoolBackend {
                    factory: Arc::new(ProcessWorkerFactory::new(
                        command.clone(),
                        config.pool.worker_args.clone(),
                    )),
                    size: config.pool.size,
                }),
                (None, Some(checker)) => thread_pool(checker, config.pool.size),
                (None, None) => {
                    return Err(BackendError::MissingSetting {
                        backend: kind,
                        setting: "pool.worker_command or an in-process checker",
                    })
                }
            },
            BackendKind::WebWorker => return Err(BackendError::UnsupportedBackend(kind)),
        };
        debug!(backend = %kind, "Selected backend");
        Ok(backend)
    }
}

fn thread_pool(checker: Arc<dyn Checker>, size: usize) -> Backend {
    Backend::WorkerPool(WorkerPoolBackend {
        factory: Arc::new(ThreadWorkerFactory::new(checker)),
        size,
    })
}

/// Executable name of the native agent for a platform, as reported by
/// `std::env::consts::{OS, ARCH}`.
pub fn native_bin_name(os: &str, arch: &str) -> Result<String, BackendError> {
    let os_name = match os {
        "macos" => "macos",
        "linux" => "linux",
        "windows" => "windows",
        _ => return Err(unsupported_platform(os, arch)),
    };
    let cpu_name = match arch {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        _ => return Err(unsupported_platform(os, arch)),
    };
    Ok(format!("recheck-{}-{}", os_name, cpu_name))
}

fn unsupported_platform(os: &str, arch: &str) -> BackendError {
    BackendError::UnsupportedPlatform {
        os: os.to_string(),
        arch: arch.to_string(),
    }
}

/// Find the native agent for the running platform on `PATH`.
fn resolve_native_bin() -> Result<PathBuf, BackendError> {
    let name = native_bin_name(std::env::consts::OS, std::env::consts::ARCH)?;
    which::which(&name).map_err(|_| {
        BackendError::Agent(recheck_agent::AgentError::ExecutableNotFound(name))
    })
}

/// A live backend accepting checks.
pub enum Dispatcher {
    Agent(Agent),
    Pool(WorkerPool),
}

impl Dispatcher {
    pub async fn check(
        &self,
        source: &str,
        flags: &str,
        options: CheckOptions,
    ) -> Result<Diagnostics, BackendError> {
        match self {
            Dispatcher::Agent(agent) => Ok(agent.check(source, flags, options).await?),
            Dispatcher::Pool(pool) => Ok(pool.check(source, flags, options).await?),
        }
    }

    /// Kill the agent or shut the pool down.
    pub async fn dispose(&self) -> Result<(), BackendError> {
        match self {
            Dispatcher::Agent(agent) => agent.kill().await?,
            Dispatcher::Pool(pool) => pool.shutdown().await,
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Dispatcher::Agent(_) => "agent",
            Dispatcher::Pool(_) => "pool",
        }
    }
}

/// Start the backend: spawn the agent (waiting for its handshake) or build the pool.
pub async fn create_check(
    backend: Backend,
    keep_alive: KeepAlive,
) -> Result<Dispatcher, BackendError> {
    match backend {
        Backend::Agent(agent) => {
            let config = agent.agent_config();
            info!(command = %config.command, "Starting agent backend");
            let agent = Agent::spawn(config, keep_alive).await?;
            Ok(Dispatcher::Agent(agent))
        }
        Backend::WorkerPool(pool) => {
            info!(size = pool.size, "Starting worker pool backend");
            let pool = WorkerPool::new(pool.factory, WorkerPoolConfig::new(pool.size), keep_alive)?;
            Ok(Dispatcher::Pool(pool))
        }
    }
}
