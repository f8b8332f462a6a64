//! Per-process dispatch context.

use crate::backend::{create_check, Backend, Dispatcher};
use crate::error::BackendError;
use recheck_config::Config;
use recheck_core::{CheckOptions, Diagnostics, KeepAlive};
use recheck_pool::Checker;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Holds the configuration and the one dispatcher a process uses.
///
/// The dispatcher is started on first use; concurrent first calls share a
/// single start-up. Pass the context by reference to whatever needs to check.
pub struct Context {
    config: Config,
    checker: Option<Arc<dyn Checker>>,
    keep_alive: KeepAlive,
    dispatcher: OnceCell<Dispatcher>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            checker: None,
            keep_alive: KeepAlive::new(),
            dispatcher: OnceCell::new(),
        }
    }

    /// Supply the in-process checker used by thread workers.
    pub fn with_checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Counts outstanding work across the dispatcher.
    pub fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }

    /// The dispatcher, starting it if this is the first call.
    pub async fn dispatcher(&self) -> Result<&Dispatcher, BackendError> {
        self.dispatcher
            .get_or_try_init(|| async {
                let backend = Backend::from_config(&self.config, self.checker.clone())?;
                let dispatcher = create_check(backend, self.keep_alive.clone()).await?;
                info!(backend = %self.config.backend, kind = dispatcher.kind(), "Dispatcher ready");
                Ok::<_, BackendError>(dispatcher)
            })
            .await
    }

    pub async fn check(
        &self,
        source: &str,
        flags: &str,
        options: CheckOptions,
    ) -> Result<Diagnostics, BackendError> {
        self.dispatcher().await?.check(source, flags, options).await
    }

    /// Dispose of the dispatcher if one was started.
    pub async fn shutdown(&self) -> Result<(), BackendError> {
        match self.dispatcher.get() {
            Some(dispatcher) => dispatcher.dispose().await,
            None => {
                debug!("No dispatcher to shut down");
                Ok(())
            }
        }
    }
}
