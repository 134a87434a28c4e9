//! Incremental line splitting over a chunked response body.
//!
//! Only the current partial line is buffered, so peak memory is one line regardless of how
//! many cells the backend returns.

use bytes::{Buf, BytesMut};

#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: BytesMut,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every line it completes (without the `\n` / `\r\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let pos = self.scanned + offset;
            self.scanned = 0;
            let mut line = self.buf.split_to(pos).to_vec();
            self.buf.advance(1);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(line);
        }
        self.scanned = self.buf.len();
        lines
    }

    /// Remaining bytes after the stream ends, if the body lacked a trailing newline.
    pub fn finish(self) -> Option<Vec<u8>> {
        let mut rest = self.buf.to_vec();
        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        (!rest.is_empty()).then_some(rest)
    }
}
