//! Line and batch splitting over the raw append-log byte stream.
//!
//! Lines are decoded only once their terminating `\n` has been seen, so a
//! multi-byte character split across two reads is reassembled before UTF-8
//! decoding. Bytes after the last `\n` at end of stream are discarded.

use std::io::{ErrorKind, Read};

use crate::{CorruptionError, Result};

pub const DEFAULT_READ_BUFFER: usize = 8192;

pub struct LineReader<R> {
    inner: R,
    buffer: Vec<u8>,
    start: usize,
    end: usize,
    pending: Vec<u8>,
    consumed: u64,
    eof: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(DEFAULT_READ_BUFFER, inner)
    }

    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        Self {
            inner,
            buffer: vec![0; capacity.max(1)],
            start: 0,
            end: 0,
            pending: Vec::new(),
            consumed: 0,
            eof: false,
        }
    }

    /// Returns the next complete line (without its `\n`) and the byte offset
    /// just past it.
    pub fn next_line(&mut self) -> Result<Option<(String, u64)>> {
        loop {
            if self.start < self.end {
                let window = &self.buffer[self.start..self.end];
                if let Some(pos) = window.iter().position(|b| *b == b'\n') {
                    self.pending.extend_from_slice(&window[..pos]);
                    self.start += pos + 1;
                    self.consumed += pos as u64 + 1;

                    let bytes = std::mem::take(&mut self.pending);
                    let line = String::from_utf8(bytes).map_err(|_| CorruptionError::InvalidUtf8 {
                        offset: self.consumed,
                    })?;
                    return Ok(Some((line, self.consumed)));
                }

                self.pending.extend_from_slice(window);
                self.consumed += window.len() as u64;
                self.start = self.end;
            }

            if self.eof || !self.fill()? {
                if !self.pending.is_empty() {
                    tracing::trace!(
                        "Discarding {} trailing bytes without newline",
                        self.pending.len()
                    );
                    self.pending.clear();
                }
                return Ok(None);
            }
        }
    }

    fn fill(&mut self) -> Result<bool> {
        loop {
            match self.inner.read(&mut self.buffer) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.start = 0;
                    self.end = n;
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// One logical record: the lines between two blank-line sentinels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub lines: Vec<String>,
    pub start_offset: u64,
    pub end_offset: u64,
}

pub struct BatchReader<R> {
    lines: LineReader<R>,
    position: u64,
}

impl<R: Read> BatchReader<R> {
    pub fn new(lines: LineReader<R>) -> Self {
        Self { lines, position: 0 }
    }

    /// Returns the next batch terminated by a blank line. A trailing batch
    /// that never reached its sentinel is dropped.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        let start_offset = self.position;
        let mut lines = Vec::new();

        while let Some((line, end)) = self.lines.next_line()? {
            if line.is_empty() {
                self.position = end;
                return Ok(Some(Batch {
                    lines,
                    start_offset,
                    end_offset: end,
                }));
            }
            lines.push(line);
        }

        if !lines.is_empty() {
            tracing::debug!(
                "Dropping unterminated batch of {} lines at offset {}",
                lines.len(),
                start_offset
            );
        }
        Ok(None)
    }

    /// Offset just past the last complete batch returned.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl<R: Read> Iterator for BatchReader<R> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}
