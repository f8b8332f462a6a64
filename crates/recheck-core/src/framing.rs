//! Newline-delimited framing for stream transports.
//!
//! A read from a pipe may end in the middle of a document or contain several
//! documents at once. `LineFramer` keeps the unterminated tail of the last
//! chunk and prepends it to the next one.

use crate::protocol::ProtocolError;

const NEWLINE: u8 = b'\n';

/// Reassembles complete lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct LineFramer {
    carry: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound chunk and return every line it completes, in order.
    ///
    /// Empty lines are dropped. A trailing `\r` is stripped so CRLF peers work.
    /// A line that is not valid UTF-8 is returned as an error in its place.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<String, ProtocolError>> {
        let mut fragments: Vec<&[u8]> = chunk.split(|&b| b == NEWLINE).collect();
        // split() always yields at least one fragment; the last one is unterminated.
        let tail = fragments.pop().unwrap_or(&[]);

        let mut lines = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            self.carry.extend_from_slice(fragment);
            let mut line = std::mem::take(&mut self.carry);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(String::from_utf8(line).map_err(ProtocolError::from));
            }
        }

        self.carry.extend_from_slice(tail);
        lines
    }

    /// Bytes of an incomplete line waiting for its terminator.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}
