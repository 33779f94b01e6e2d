//! Bounded stderr scanner.
//!
//! Tools like pg_restore can emit gigabytes of notices. Lines are scanned
//! from a fixed buffer; only error lines are kept and only the most recent
//! few of those.

use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub const SCAN_BUFFER_SIZE: usize = 64 * 1024;
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;
pub const MAX_RETAINED_LINES: usize = 10;

/// Error lines captured from one process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StderrCapture {
    lines: VecDeque<String>,
    pub discarded: u64,
}

impl StderrCapture {
    fn push(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);
        if !is_error_line(line) {
            self.discarded += 1;
            return;
        }
        if self.lines.len() == MAX_RETAINED_LINES {
            self.lines.pop_front();
            self.discarded += 1;
        }
        self.lines.push_back(line.to_string());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn last_line(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn retained_bytes(&self) -> usize {
        self.lines.iter().map(String::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

pub fn is_error_line(line: &str) -> bool {
    line.contains("ERROR") || line.contains("FATAL") || line.contains("error:")
}

/// Read `reader` to EOF, keeping at most [`MAX_RETAINED_LINES`] error lines
/// of at most [`MAX_LINE_LENGTH`] bytes each. Read errors end the scan.
pub async fn drain_stderr<R: AsyncRead + Unpin>(reader: R) -> StderrCapture {
    let mut reader = BufReader::with_capacity(SCAN_BUFFER_SIZE, reader);
    let mut capture = StderrCapture::default();
    let mut line: Vec<u8> = Vec::new();

    loop {
        let buf = match reader.fill_buf().await {
            Ok(buf) => buf,
            Err(_) => break,
        };
        if buf.is_empty() {
            break;
        }

        let (chunk, consumed, complete) = match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => (&buf[..pos], pos + 1, true),
            None => (buf, buf.len(), false),
        };
        let room = MAX_LINE_LENGTH.saturating_sub(line.len());
        line.extend_from_slice(&chunk[..chunk.len().min(room)]);
        reader.consume(consumed);

        if complete {
            capture.push(&line);
            line.clear();
        }
    }

    if !line.is_empty() {
        capture.push(&line);
    }
    capture
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keeps_only_error_lines() {
        let input = b"pg_dump: dumping contents of table\nNOTICE: something\npg_dump: error: connection refused\nFATAL: role \"x\" does not exist\n";
        let capture = drain_stderr(&input[..]).await;
        let lines: Vec<&str> = capture.lines().collect();
        assert_eq!(lines, vec!["pg_dump: error: connection refused", "FATAL: role \"x\" does not exist"]);
        assert_eq!(capture.last_line(), Some("FATAL: role \"x\" does not exist"));
    }

    #[tokio::test]
    async fn test_retains_last_ten() {
        let mut input = String::new();
        for i in 0..25 {
            input.push_str(&format!("ERROR: failure {}\n", i));
        }
        let capture = drain_stderr(input.as_bytes()).await;
        let lines: Vec<&str> = capture.lines().collect();
        assert_eq!(lines.len(), MAX_RETAINED_LINES);
        assert_eq!(lines[0], "ERROR: failure 15");
        assert_eq!(capture.last_line(), Some("ERROR: failure 24"));
    }

    #[tokio::test]
    async fn test_unterminated_final_line() {
        let capture = drain_stderr(&b"ERROR: no newline"[..]).await;
        assert_eq!(capture.last_line(), Some("ERROR: no newline"));
    }

    #[tokio::test]
    async fn test_ten_mib_of_errors_stays_bounded() {
        let line = format!("ERROR: {}\n", "x".repeat(1000));
        let input = line.repeat(10 * 1024 * 1024 / line.len() + 1);
        let capture = drain_stderr(input.as_bytes()).await;
        assert_eq!(capture.lines().count(), MAX_RETAINED_LINES);
        assert!(capture.retained_bytes() <= MAX_RETAINED_LINES * MAX_LINE_LENGTH);
    }

    #[tokio::test]
    async fn test_overlong_line_is_truncated() {
        let mut input = b"ERROR: ".to_vec();
        input.extend(std::iter::repeat(b'y').take(3 * MAX_LINE_LENGTH));
        input.push(b'\n');
        let capture = drain_stderr(&input[..]).await;
        assert_eq!(capture.retained_bytes(), MAX_LINE_LENGTH);
    }
}
