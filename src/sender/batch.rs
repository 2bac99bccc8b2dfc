// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON-array batch buffer, optionally gzip-compressed.
//!
//! The size bound is always checked against the uncompressed envelope,
//! brackets and separators included.

use super::Compression;
use flate2::write::GzEncoder;
use std::io::{self, Write};

enum Output {
    Plain(Vec<u8>),
    Gzip(GzEncoder<Vec<u8>>),
}

impl Output {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Output::Plain(buf) => buf.write_all(bytes),
            Output::Gzip(encoder) => encoder.write_all(bytes),
        }
    }
}

/// One open batch: `[` already written, items appended as they fit.
pub(crate) struct BatchBuffer {
    output: Output,
    uncompressed_len: usize,
    items: usize,
}

impl BatchBuffer {
    pub(crate) fn open(compression: Compression) -> io::Result<Self> {
        let output = match compression {
            Compression::None => Output::Plain(Vec::new()),
            Compression::Gzip => Output::Gzip(GzEncoder::new(Vec::new(), flate2::Compression::default())),
        };
        let mut buffer = Self {
            output,
            uncompressed_len: 0,
            items: 0,
        };
        buffer.output.write_all(b"[")?;
        buffer.uncompressed_len = 1;
        Ok(buffer)
    }

    /// Whether an item of `len` bytes still fits, leaving room for `]`.
    pub(crate) fn fits(&self, len: usize, limit: usize) -> bool {
        let separator = usize::from(self.items > 0);
        self.uncompressed_len + separator + len + 1 <= limit
    }

    pub(crate) fn push(&mut self, item: &[u8]) -> io::Result<()> {
        if self.items > 0 {
            self.output.write_all(b",")?;
            self.uncompressed_len += 1;
        }
        self.output.write_all(item)?;
        self.uncompressed_len += item.len();
        self.items += 1;
        Ok(())
    }

    pub(crate) fn items(&self) -> usize {
        self.items
    }

    /// Close the array and return the bytes to send plus the uncompressed
    /// length.
    pub(crate) fn close(mut self) -> io::Result<(Vec<u8>, usize)> {
        self.output.write_all(b"]")?;
        let len = self.uncompressed_len + 1;
        let body = match self.output {
            Output::Plain(buf) => buf,
            Output::Gzip(encoder) => encoder.finish()?,
        };
        Ok((body, len))
    }
}
