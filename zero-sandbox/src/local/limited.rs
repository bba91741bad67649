//! Size-capped output sink.

use std::io::{self, Write};

/// Forwards at most `limit` bytes to `inner` and silently drops the rest.
///
/// `write` always reports the full length so a producer never sees a short
/// write and keeps draining the pipe.
#[derive(Debug)]
pub struct LimitedWriter<W> {
    inner: W,
    limit: usize,
    written: usize,
    truncated: bool,
}

impl<W: Write> LimitedWriter<W> {
    pub fn new(inner: W, limit: usize) -> Self {
        Self {
            inner,
            limit,
            written: 0,
            truncated: false,
        }
    }

    /// Bytes actually forwarded.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Whether any bytes were dropped.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.limit - self.written;
        let take = remaining.min(buf.len());
        if take > 0 {
            self.inner.write_all(&buf[..take])?;
            self.written += take;
        }
        if take < buf.len() {
            self.truncated = true;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
