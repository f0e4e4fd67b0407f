//! Newline framer for the text protocols spoken on both serial links.
//!
//! Bytes are fed in whatever chunks the port hands us; complete lines come out,
//! and any trailing partial line is kept for the next read. The buffer is
//! unbounded: memory only grows while the device keeps sending without a newline.
use bytes::BytesMut;

pub struct LineFramer {
    buf: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append `data` and drain every complete line it finishes, trimmed of
    /// surrounding whitespace (including the `\r` of CRLF endings).
    pub fn feed(&mut self, data: &[u8]) -> Lines<'_> {
        self.push(data);
        Lines { framer: self }
    }

    /// Next complete line with its terminator kept, or None while only a partial
    /// line is buffered.
    pub fn next_raw_line(&mut self) -> Option<String> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        let line = self.buf.split_to(end + 1);
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    pub fn next_line(&mut self) -> Option<String> {
        self.next_raw_line().map(|l| l.trim().to_string())
    }

    /// Bytes currently held waiting for a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Drop any partial line (used when the port is reopened).
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the complete lines available after a [`LineFramer::feed`].
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.framer.next_line()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_split_chunks() {
        let mut f = LineFramer::new();
        assert_eq!(f.feed(b"AB").count(), 0);
        let lines: Vec<String> = f.feed(b"C\nDEF\nG").collect();
        assert_eq!(lines, vec!["ABC", "DEF"]);
        assert_eq!(f.pending(), b"G");
    }

    #[test]
    fn many_terminators_in_one_read() {
        let mut f = LineFramer::new();
        let input = "x\n".repeat(10_000);
        assert_eq!(f.feed(input.as_bytes()).count(), 10_000);
        assert!(f.pending().is_empty());
    }

    #[test]
    fn trims_crlf_but_raw_keeps_it() {
        let mut f = LineFramer::new();
        f.push(b"OK\r\n+CMGS: 4\r\n");
        assert_eq!(f.next_raw_line().as_deref(), Some("OK\r\n"));
        assert_eq!(f.next_line().as_deref(), Some("+CMGS: 4"));
        assert_eq!(f.next_line(), None);
    }

    #[test]
    fn reset_discards_partial_line() {
        let mut f = LineFramer::new();
        f.push(b"0;255;3");
        f.reset();
        let lines: Vec<String> = f.feed(b";0;9;x\n").collect();
        assert_eq!(lines, vec![";0;9;x"]);
    }
}
