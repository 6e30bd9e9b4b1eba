//! Encoder output draining.
//!
//! ffmpeg writes diagnostics to both pipes and blocks once a pipe buffer is
//! full, so each pipe gets its own task that reads until EOF. Progress stats
//! are terminated with `\r` rather than `\n`; both count as line breaks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Number of recent lines retained per session.
pub const TAIL_CAPACITY: usize = 50;

const READ_CHUNK: usize = 4096;

/// Log severity assigned to one encoder line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSeverity {
    Error,
    Info,
}

/// Lines mentioning "error" or "failed" (any case) are errors.
pub fn classify_line(line: &str) -> LineSeverity {
    let lower = line.to_lowercase();
    if lower.contains("error") || lower.contains("failed") {
        LineSeverity::Error
    } else {
        LineSeverity::Info
    }
}

/// Bounded ring of the most recent lines from both pipes.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        // A poisoned lock only means a drain panicked mid-push; the data is still usable.
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(TAIL_CAPACITY)
    }
}

/// Totals reported when a drain finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub lines: u64,
    pub error_lines: u64,
}

/// Per-drain context carried into every log record.
#[derive(Debug, Clone)]
pub struct DrainContext {
    pub stream: &'static str,
    pub session_id: String,
    pub tail: OutputTail,
}

impl DrainContext {
    fn emit(&self, raw: &[u8], stats: &mut DrainStats) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        if line.is_empty() {
            return;
        }

        stats.lines += 1;
        match classify_line(line) {
            LineSeverity::Error => {
                stats.error_lines += 1;
                tracing::error!(stream = self.stream, session_id = %self.session_id, "{}", line);
            }
            LineSeverity::Info => {
                tracing::info!(stream = self.stream, session_id = %self.session_id, "{}", line);
            }
        }
        self.tail.push(line.to_string());
    }
}

/// Read `reader` to EOF, logging every line.
///
/// A read error is logged and ends the drain; it never propagates.
pub async fn drain_lines<R>(mut reader: R, ctx: DrainContext) -> DrainStats
where
    R: AsyncRead + Unpin,
{
    let mut stats = DrainStats::default();
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let mut start = 0;
                for (i, &b) in chunk[..n].iter().enumerate() {
                    if b == b'\n' || b == b'\r' {
                        pending.extend_from_slice(&chunk[start..i]);
                        ctx.emit(&pending, &mut stats);
                        pending.clear();
                        start = i + 1;
                    }
                }
                pending.extend_from_slice(&chunk[start..n]);
            }
            Err(e) => {
                tracing::warn!(
                    stream = ctx.stream,
                    session_id = %ctx.session_id,
                    error = %e,
                    "Error reading encoder output"
                );
                break;
            }
        }
    }

    // Final line without a terminator
    ctx.emit(&pending, &mut stats);

    tracing::debug!(
        stream = ctx.stream,
        session_id = %ctx.session_id,
        lines = stats.lines,
        error_lines = stats.error_lines,
        "Output drain finished"
    );
    stats
}

/// Spawn a drain task for one pipe.
pub fn spawn_drain<R>(reader: R, ctx: DrainContext) -> JoinHandle<DrainStats>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(drain_lines(reader, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    fn ctx(tail: &OutputTail) -> DrainContext {
        DrainContext {
            stream: "stderr",
            session_id: "test-session".to_string(),
            tail: tail.clone(),
        }
    }

    /// Yields its data once, then fails.
    struct FailingReader {
        data: Option<&'static [u8]>,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone"))),
            }
        }
    }

    #[test]
    fn test_classify_line() {
        assert_eq!(classify_line("[flv @ 0x1] Error writing trailer"), LineSeverity::Error);
        assert_eq!(classify_line("Connection to tcp://x FAILED"), LineSeverity::Error);
        assert_eq!(classify_line("ERROR: broken"), LineSeverity::Error);
        assert_eq!(
            classify_line("frame= 120 fps= 30 q=23.0 size= 512kB time=00:00:04.00"),
            LineSeverity::Info
        );
        assert_eq!(classify_line("Input #0, concat, from 'list.txt':"), LineSeverity::Info);
    }

    #[test]
    fn test_tail_keeps_most_recent() {
        let tail = OutputTail::new(3);
        for i in 0..5 {
            tail.push(format!("line {}", i));
        }
        assert_eq!(tail.snapshot(), vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_drain_splits_on_cr_and_lf() {
        let tail = OutputTail::default();
        let input: &[u8] = b"Input #0\nframe=  1\rframe=  2\r\nStream mapping error\n\n   \nlast";

        let stats = drain_lines(input, ctx(&tail)).await;

        assert_eq!(stats.lines, 5);
        assert_eq!(stats.error_lines, 1);
        assert_eq!(
            tail.snapshot(),
            vec!["Input #0", "frame=  1", "frame=  2", "Stream mapping error", "last"]
        );
    }

    #[tokio::test]
    async fn test_drain_tolerates_invalid_utf8() {
        let tail = OutputTail::default();
        let input: &[u8] = b"caf\xe9 failed\n";

        let stats = drain_lines(input, ctx(&tail)).await;

        assert_eq!(stats.error_lines, 1);
        assert!(tail.snapshot()[0].ends_with("failed"));
    }

    #[tokio::test]
    async fn test_drain_read_error_ends_quietly() {
        let tail = OutputTail::default();
        let reader = FailingReader {
            data: Some(b"one\ntwo"),
        };

        let stats = drain_lines(reader, ctx(&tail)).await;

        // The partial line read before the failure is still flushed.
        assert_eq!(stats.lines, 2);
        assert_eq!(tail.snapshot(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_drain_does_not_stall_large_output() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let tail = OutputTail::new(5);
        let handle = spawn_drain(reader, ctx(&tail));

        use tokio::io::AsyncWriteExt;
        for i in 0..2000 {
            writer
                .write_all(format!("frame={}\r", i).as_bytes())
                .await
                .unwrap();
        }
        drop(writer);

        let stats = handle.await.unwrap();
        assert_eq!(stats.lines, 2000);
        assert_eq!(tail.snapshot().last().map(String::as_str), Some("frame=1999"));
    }

    // Property: line count is independent of how the bytes are chunked on the pipe.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_line_count_matches_non_blank_lines(
            lines in prop::collection::vec("[a-z =0-9]{0,20}", 0..40),
            use_cr in any::<bool>(),
        ) {
            let sep = if use_cr { "\r" } else { "\n" };
            let input = lines.join(sep);
            let expected = lines.iter().filter(|l| !l.trim().is_empty()).count() as u64;

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let tail = OutputTail::new(0);
            let stats = rt.block_on(drain_lines(input.as_bytes(), ctx(&tail)));

            prop_assert_eq!(stats.lines, expected);
            prop_assert_eq!(stats.error_lines, 0);
        }
    }
}
