//! Line framing
//!
//! Splits the controller's byte stream into newline-delimited lines and
//! frames outbound commands. One codec instance is used per connection.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Command, ProtocolError, MAX_LINE_LENGTH};

/// Newline-delimited ASCII line codec
#[derive(Debug, Clone)]
pub struct LineCodec {
    /// Bytes already scanned for a delimiter
    next_index: usize,
    /// Longest line accepted before it is dropped
    max_length: usize,
    /// Skipping the remainder of an overlong line
    discarding: bool,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    /// Create a codec with the default [`MAX_LINE_LENGTH`]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    /// Create a codec that drops lines longer than `max_length` bytes
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
            discarding: false,
        }
    }

    /// Turn one raw record into a line; `None` when it is blank
    fn finish_line(raw: &[u8]) -> Option<String> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        loop {
            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    // End of the overlong line: drop it and resume
                    buf.advance(self.next_index + offset + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let record = buf.split_to(end + 1);
                    if end > self.max_length {
                        tracing::warn!("dropping overlong line ({} bytes)", end);
                        continue;
                    }
                    if let Some(line) = Self::finish_line(&record[..end]) {
                        return Ok(Some(line));
                    }
                }
                (false, None) if buf.len() > self.max_length => {
                    tracing::warn!(
                        "line exceeds {} bytes without delimiter, discarding",
                        self.max_length
                    );
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if self.discarding || buf.is_empty() {
            buf.clear();
            self.next_index = 0;
            return Ok(None);
        }
        let record = buf.split();
        self.next_index = 0;
        Ok(Self::finish_line(&record))
    }
}

impl Encoder<Command> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, cmd: Command, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let line = cmd.to_line();
        buf.reserve(line.len() + 1);
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
        Ok(())
    }
}
