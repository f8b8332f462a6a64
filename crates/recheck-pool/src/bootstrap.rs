//! Worker-side task loop.
//!
//! Each worker receives one task message at a time, runs the checker on it
//! synchronously, and replies with a single result. When the task asked for
//! logging, log lines are streamed back as push messages before the result.

use crate::error::PoolError;
use crate::port::{LinePort, MessagePort};
use recheck_core::{Diagnostics, Parameters, RequestId, Response, TaskMessage};
use tracing::{debug, trace, warn};

/// The checking capability run inside a worker.
pub trait Checker: Send + Sync {
    /// Check one pattern. Blocks the worker for the duration of the check.
    ///
    /// `logger` is present when the caller asked for log lines.
    fn check(
        &self,
        source: &str,
        flags: &str,
        params: &Parameters,
        logger: Option<&Logger<'_>>,
    ) -> Diagnostics;
}

/// Emits push messages for the task a worker currently holds.
pub struct Logger<'a> {
    id: RequestId,
    port: &'a dyn MessagePort,
}

impl Logger<'_> {
    /// Id of the task these log lines belong to.
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn log(&self, message: &str) {
        let line = match Response::push(self.id, message).to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(id = self.id, error = %e, "Failed to encode log line");
                return;
            }
        };
        if let Err(e) = self.port.post(&line) {
            warn!(id = self.id, error = %e, "Failed to send log line");
        }
    }
}

/// Serve tasks from `port` until it closes.
///
/// A message that is not a task is fatal for the worker.
pub fn bootstrap_worker<P: MessagePort>(port: &mut P, checker: &dyn Checker) -> Result<(), PoolError> {
    while let Some(line) = port.recv()? {
        let task = TaskMessage::from_line(&line)?;
        handle_task(port, checker, task)?;
    }
    debug!("Task port closed, worker exiting");
    Ok(())
}

fn handle_task<P: MessagePort>(
    port: &P,
    checker: &dyn Checker,
    task: TaskMessage,
) -> Result<(), PoolError> {
    let TaskMessage {
        id,
        source,
        flags,
        mut params,
    } = task;
    trace!(id = id, source = %source, "Worker received task");

    // The marker only tells us to stream; the checker sees the caller's options.
    let wants_logs = params.requests_logging();
    params.set_logging(false);
    let logger = wants_logs.then_some(Logger { id, port });

    let diagnostics = checker.check(&source, &flags, &params, logger.as_ref());
    port.post(&Response::result(id, diagnostics).to_line()?)?;
    Ok(())
}

/// Entry point for worker processes: serve tasks over stdin/stdout.
pub fn run_stdio_worker(checker: &dyn Checker) -> Result<(), PoolError> {
    bootstrap_worker(&mut LinePort::stdio(), checker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChecker {
        seen: Mutex<Vec<Parameters>>,
    }

    impl Checker for RecordingChecker {
        fn check(
            &self,
            source: &str,
            flags: &str,
            params: &Parameters,
            logger: Option<&Logger<'_>>,
        ) -> Diagnostics {
            self.seen.lock().unwrap().push(params.clone());
            if let Some(logger) = logger {
                logger.log(&format!("checking {}", source));
            }
            json!({ "source": source, "flags": flags, "status": "safe" }).into()
        }
    }

    fn task_line(id: RequestId, source: &str, params: Parameters) -> String {
        TaskMessage {
            id,
            source: source.to_string(),
            flags: String::new(),
            params,
        }
        .to_line()
        .unwrap()
    }

    #[test]
    fn test_streams_logs_only_when_requested() {
        let mut logged = Parameters::new().with("timeout", 10);
        logged.set_logging(true);
        let input = task_line(1, "a+", logged) + &task_line(2, "b+", Parameters::new());

        let checker = RecordingChecker::default();
        let mut port = LinePort::new(Cursor::new(input), Vec::new());
        bootstrap_worker(&mut port, &checker).unwrap();

        let output = String::from_utf8(port.into_writer()).unwrap();
        let responses: Vec<Response> = output
            .lines()
            .map(|line| Response::from_line(line).unwrap())
            .collect();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0], Response::push(1, "checking a+"));
        assert!(matches!(&responses[1], Response::Result(r) if r.id == 1));
        assert!(matches!(&responses[2], Response::Result(r) if r.id == 2));

        // The checker never sees the logging marker.
        let seen = checker.seen.lock().unwrap();
        assert!(seen.iter().all(|params| !params.requests_logging()));
        assert_eq!(seen[0].get("timeout"), Some(&json!(10)));
    }

    #[test]
    fn test_malformed_task_is_fatal() {
        let checker = RecordingChecker::default();
        let mut port = LinePort::new(Cursor::new("{\"id\":1}\n"), Vec::new());

        let err = bootstrap_worker(&mut port, &checker).unwrap_err();
        assert!(matches!(err, PoolError::Protocol(_)));
        assert!(checker.seen.lock().unwrap().is_empty());
    }
}
