//! Per-call options shared by every backend.

use crate::diagnostics::Parameters;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Receives log lines streamed back for a single check.
pub type LogFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Options for one check call.
#[derive(Clone, Default)]
pub struct CheckOptions {
    /// Options forwarded to the checking capability.
    pub params: Parameters,
    /// Log line subscriber. Its presence enables streaming on the executing side.
    pub logger: Option<LogFn>,
    /// Caller-driven cancellation signal.
    pub cancel: Option<CancellationToken>,
}

impl CheckOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(mut self, params: Parameters) -> Self {
        self.params = params;
        self
    }

    pub fn with_logger(mut self, logger: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Split into the serialisable parameters and the local-only parts.
    ///
    /// The returned parameters carry the logging marker exactly when a
    /// logger is present.
    pub fn into_parts(self) -> (Parameters, Option<LogFn>, Option<CancellationToken>) {
        let mut params = self.params;
        params.set_logging(self.logger.is_some());
        (params, self.logger, self.cancel)
    }
}

impl fmt::Debug for CheckOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckOptions")
            .field("params", &self.params)
            .field("logger", &self.logger.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::LOGGER_KEY;
    use serde_json::json;

    #[test]
    fn test_logger_sets_marker() {
        let (params, logger, cancel) = CheckOptions::new().with_logger(|_| {}).into_parts();
        assert!(params.requests_logging());
        assert!(logger.is_some());
        assert!(cancel.is_none());
    }

    #[test]
    fn test_stale_marker_is_removed_without_logger() {
        let params = Parameters::new().with(LOGGER_KEY, json!({})).with("timeout", 5);
        let (params, logger, _) = CheckOptions::new().with_params(params).into_parts();
        assert!(logger.is_none());
        assert!(!params.requests_logging());
        assert_eq!(params.get("timeout"), Some(&json!(5)));
    }
}
