//! Transport layer for client ↔ server communication.
//!
//! Records are newline-delimited JSON. `LineFramer` turns arbitrary read
//! chunks into complete records; `write_record` puts one response line on
//! the wire.

pub mod protocol;

pub use protocol::{Command, DecodeError, RequestEnvelope, ResponseEnvelope};

use std::mem;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Default maximum record size (64 MB). Safety valve against runaway input.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// One unit produced by the framer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete record, without its line terminator.
    Record(Vec<u8>),
    /// A record that exceeded the size limit; its bytes were discarded.
    Oversized(usize),
}

/// Splits a byte stream into `\n`-terminated records.
///
/// Partial records are buffered across `push` calls. A trailing `\r` is
/// stripped so CRLF clients work too. Records longer than `max_len` are
/// dropped up to the next newline and reported once as [`Frame::Oversized`].
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_len: usize,
    /// Length of the oversized record currently being skipped.
    discarding: Option<usize>,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(MAX_RECORD_SIZE)
    }
}

impl LineFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
            discarding: None,
        }
    }

    /// Feed a chunk and collect every record it completes, in order.
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();

        while !chunk.is_empty() {
            let newline = chunk.iter().position(|&b| b == b'\n');
            let (head, rest) = match newline {
                Some(i) => (&chunk[..i], Some(&chunk[i + 1..])),
                None => (chunk, None),
            };

            if let Some(skipped) = self.discarding.as_mut() {
                *skipped += head.len();
            } else if self.buf.len() + head.len() > self.max_len {
                self.discarding = Some(self.buf.len() + head.len());
                self.buf.clear();
            } else {
                self.buf.extend_from_slice(head);
            }

            match rest {
                Some(rest) => {
                    frames.push(self.take_frame());
                    chunk = rest;
                }
                None => break,
            }
        }

        frames
    }

    /// Flush the unterminated tail at end of stream, if there is one.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.discarding.is_none() && self.buf.is_empty() {
            return None;
        }
        Some(self.take_frame())
    }

    /// Number of bytes buffered for the record in progress.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn take_frame(&mut self) -> Frame {
        if let Some(len) = self.discarding.take() {
            return Frame::Oversized(len);
        }
        let mut record = mem::take(&mut self.buf);
        if record.last() == Some(&b'\r') {
            record.pop();
        }
        Frame::Record(record)
    }
}

/// Write one response as a newline-terminated record and flush it.
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &ResponseEnvelope,
) -> std::io::Result<()> {
    let mut line = response.encode();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
