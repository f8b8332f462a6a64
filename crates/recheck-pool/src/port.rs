//! Worker-side message transports.
//!
//! A port carries whole protocol documents in order. Inbound documents are
//! task messages from the pool; outbound documents are push and result
//! responses.

use crate::worker::WorkerEvents;
use std::io::{self, BufRead, Write};
use std::sync::{mpsc, Mutex};

/// Bidirectional, order-preserving message transport seen from inside a worker.
pub trait MessagePort {
    /// Next inbound message, or `None` once the pool side has closed.
    fn recv(&mut self) -> io::Result<Option<String>>;

    /// Send one outbound message.
    fn post(&self, message: &str) -> io::Result<()>;
}

/// Port of a thread worker: an in-memory channel in, pool events out.
pub struct ChannelPort {
    inbox: mpsc::Receiver<String>,
    events: WorkerEvents,
}

impl ChannelPort {
    pub fn new(inbox: mpsc::Receiver<String>, events: WorkerEvents) -> Self {
        Self { inbox, events }
    }
}

impl MessagePort for ChannelPort {
    fn recv(&mut self) -> io::Result<Option<String>> {
        Ok(self.inbox.recv().ok())
    }

    fn post(&self, message: &str) -> io::Result<()> {
        if self.events.message(message) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker pool is gone"))
        }
    }
}

/// Port over a line-oriented byte stream, one document per line.
pub struct LinePort<R, W> {
    reader: R,
    writer: Mutex<W>,
}

impl<R: BufRead, W: Write> LinePort<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer: Mutex::new(writer),
        }
    }

    /// Consume the port and return its writer.
    pub fn into_writer(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LinePort<io::StdinLock<'static>, io::Stdout> {
    /// Port over the current process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> MessagePort for LinePort<R, W> {
    fn recv(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    fn post(&self, message: &str) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writer.write_all(message.as_bytes())?;
        if !message.ends_with('\n') {
            writer.write_all(b"\n")?;
        }
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_line_port_skips_blank_lines() {
        let input = Cursor::new("\n{\"id\":1}\r\n\n{\"id\":2}");
        let mut port = LinePort::new(input, Vec::new());

        assert_eq!(port.recv().unwrap().as_deref(), Some("{\"id\":1}"));
        assert_eq!(port.recv().unwrap().as_deref(), Some("{\"id\":2}"));
        assert_eq!(port.recv().unwrap(), None);
    }

    #[test]
    fn test_line_port_terminates_each_message() {
        let port = LinePort::new(Cursor::new(""), Vec::new());
        port.post("{\"id\":1,\"message\":\"a\"}").unwrap();
        port.post("{\"id\":1,\"result\":null}\n").unwrap();

        let written = String::from_utf8(port.into_writer()).unwrap();
        assert_eq!(
            written,
            "{\"id\":1,\"message\":\"a\"}\n{\"id\":1,\"result\":null}\n"
        );
    }
}
