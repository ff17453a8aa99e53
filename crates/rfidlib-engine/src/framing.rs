//! Line framing for reader byte streams.
//!
//! Both reader dialects are line oriented. The legacy ASCII dialect starts
//! out splitting on `\r` and switches to `\n` once end-of-frame mode is
//! enabled; the AT dialect always splits on `\n`. [`LineFramer`] accumulates
//! raw bytes and yields every complete line, separator removed.

/// Maximum number of buffered bytes without a separator before the buffer is
/// discarded.
pub const MAX_BUF: usize = 8192;

/// Carriage return, the legacy dialect's initial separator.
pub const CR: u8 = b'\r';

/// Line feed.
pub const LF: u8 = b'\n';

/// Splits a byte stream into text lines on a configurable separator.
#[derive(Debug)]
pub struct LineFramer {
    separator: u8,
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new(separator: u8) -> Self {
        Self {
            separator,
            buf: Vec::new(),
        }
    }

    pub fn separator(&self) -> u8 {
        self.separator
    }

    /// Change the separator. Already buffered bytes are re-scanned on the
    /// next [`push`](Self::push).
    pub fn set_separator(&mut self, separator: u8) {
        self.separator = separator;
    }

    /// Append received bytes and return every line completed by them.
    ///
    /// Non UTF-8 bytes are replaced rather than rejected; the readers only
    /// ever send ASCII.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == self.separator) {
            let line: Vec<u8> = self.buf.drain(..=pos).take(pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if self.buf.len() > MAX_BUF {
            tracing::warn!(len = self.buf.len(), "line buffer overflow, resetting");
            self.buf.clear();
        }
        lines
    }

    /// Bytes received after the last separator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Remove one trailing carriage return, as left over by `\r\n` line ends.
pub fn trim_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}
