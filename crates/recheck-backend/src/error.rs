use recheck_agent::AgentError;
use recheck_config::{BackendKind, ConfigError};
use recheck_pool::PoolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("The '{0}' backend is not available in this build")]
    UnsupportedBackend(BackendKind),

    #[error("The '{backend}' backend requires {setting}")]
    MissingSetting {
        backend: BackendKind,
        setting: &'static str,
    },

    #[error("No native agent for this platform (os={os}, arch={arch})")]
    UnsupportedPlatform { os: String, arch: String },
}
