//! Cancellable child-process runner.
//!
//! Spawns a command with stderr piped, streams stderr line by line to a
//! callback, keeps the last few lines for error reporting and kills the child
//! as soon as the cancellation token fires.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 4096;

/// How a child process run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited on its own.
    Exited {
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
        /// The last stderr lines, oldest first.
        stderr_tail: Vec<String>,
    },
    /// The token fired and the process was killed.
    Cancelled,
}

impl RunOutcome {
    /// Whether the process exited with code 0.
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0), .. })
    }
}

/// Splits a byte stream on `\n` and `\r`.
///
/// ffmpeg rewrites its progress line in place with carriage returns, so both
/// separators terminate a line.
#[derive(Default)]
struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = self.take_line() {
                    lines.push(line);
                }
            } else {
                self.buf.push(byte);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).trim_end().to_string();
        self.buf.clear();
        (!line.is_empty()).then_some(line)
    }
}

struct Tail {
    lines: VecDeque<String>,
    cap: usize,
}

impl Tail {
    fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(cap),
            cap,
        }
    }

    fn push(&mut self, line: String) {
        if self.cap == 0 {
            return;
        }
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

/// Whether [`drain_stderr`] hit end of stream or saw the token fire.
#[derive(Debug, PartialEq, Eq)]
enum Drained {
    Eof,
    Cancelled,
}

/// Read `reader` to the end, feeding complete lines to `on_line` and `tail`.
///
/// Read errors are returned to the caller.
async fn drain_stderr<R, F>(
    reader: &mut R,
    cancel: &CancellationToken,
    tail: &mut Tail,
    on_line: &mut F,
) -> io::Result<Drained>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut splitter = LineSplitter::default();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Drained::Cancelled),
            read = reader.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                for line in splitter.push(&chunk[..n]) {
                    on_line(&line);
                    tail.push(line);
                }
            }
        }
    }

    if let Some(line) = splitter.finish() {
        on_line(&line);
        tail.push(line);
    }
    Ok(Drained::Eof)
}

/// Run `command` to completion unless `cancel` fires first.
///
/// stdin and stdout are discarded, stderr is read line by line and every line
/// is passed to `on_line`. At most `tail_lines` trailing lines are kept in the
/// returned [`RunOutcome::Exited`].
///
/// The child is spawned with `kill_on_drop`, so dropping the returned future
/// also terminates it. A failure reading stderr is returned as an error
/// after the child has been killed.
pub async fn run_cancellable<F>(
    mut command: Command,
    cancel: &CancellationToken,
    tail_lines: usize,
    mut on_line: F,
) -> io::Result<RunOutcome>
where
    F: FnMut(&str),
{
    if cancel.is_cancelled() {
        return Ok(RunOutcome::Cancelled);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr was not captured"))?;

    let mut tail = Tail::new(tail_lines);
    match drain_stderr(&mut stderr, cancel, &mut tail, &mut on_line).await {
        Ok(Drained::Eof) => {}
        Ok(Drained::Cancelled) => {
            let _ = child.kill().await;
            return Ok(RunOutcome::Cancelled);
        }
        Err(e) => {
            let _ = child.kill().await;
            return Err(e);
        }
    }

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Ok(RunOutcome::Cancelled);
        }
        status = child.wait() => status?,
    };

    Ok(RunOutcome::Exited {
        code: status.code(),
        stderr_tail: tail.lines.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_handles_carriage_returns() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.push(b"frame=1 time=00:00:01.00\rframe=2 time=00:00:02.00\r\nDone");
        assert_eq!(
            lines,
            vec!["frame=1 time=00:00:01.00", "frame=2 time=00:00:02.00"]
        );
        assert_eq!(splitter.finish(), Some("Done".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_joins_partial_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"hel").is_empty());
        assert_eq!(splitter.push(b"lo\n"), vec!["hello"]);
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let mut tail = Tail::new(2);
        for line in ["a", "b", "c"] {
            tail.push(line.to_string());
        }
        assert_eq!(tail.lines, VecDeque::from(vec!["b".to_string(), "c".to_string()]));

        let mut empty = Tail::new(0);
        empty.push("x".to_string());
        assert!(empty.lines.is_empty());
    }

    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")))
        }
    }

    #[tokio::test]
    async fn test_drain_returns_read_errors() {
        let mut tail = Tail::new(5);
        let mut lines = 0;
        let err = drain_stderr(&mut BrokenPipe, &CancellationToken::new(), &mut tail, &mut |_| {
            lines += 1
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(lines, 0);
    }

    #[tokio::test]
    async fn test_drain_reads_until_eof() {
        let mut reader: &[u8] = b"one\ntwo\rthree";
        let mut tail = Tail::new(2);
        let mut seen = Vec::new();
        let drained = drain_stderr(&mut reader, &CancellationToken::new(), &mut tail, &mut |l| {
            seen.push(l.to_string())
        })
        .await
        .unwrap();
        assert_eq!(drained, Drained::Eof);
        assert_eq!(seen, vec!["one", "two", "three"]);
        assert_eq!(tail.lines, VecDeque::from(vec!["two".to_string(), "three".to_string()]));
    }

    #[test]
    fn test_outcome_success() {
        let ok = RunOutcome::Exited {
            code: Some(0),
            stderr_tail: vec![],
        };
        assert!(ok.success());
        assert!(!RunOutcome::Cancelled.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_exit_code_and_tail() {
        let mut cmd = crate::tokio_command("sh");
        cmd.args(["-c", "echo one >&2; echo two >&2; echo three >&2; exit 3"]);

        let mut seen = Vec::new();
        let outcome = run_cancellable(cmd, &CancellationToken::new(), 2, |line| {
            seen.push(line.to_string())
        })
        .await
        .unwrap();

        assert_eq!(seen, vec!["one", "two", "three"]);
        assert_eq!(
            outcome,
            RunOutcome::Exited {
                code: Some(3),
                stderr_tail: vec!["two".to_string(), "three".to_string()],
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");

        let mut cmd = crate::tokio_command("sh");
        cmd.arg("-c")
            .arg(format!("sleep 1; touch '{}'", marker.display()));

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = run_cancellable(cmd, &token, 10, |_| {}).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_spawn() {
        let token = CancellationToken::new();
        token.cancel();
        let cmd = crate::tokio_command("definitely-not-a-real-binary");
        let outcome = run_cancellable(cmd, &token, 10, |_| {}).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let cmd = crate::tokio_command("definitely-not-a-real-binary");
        let err = run_cancellable(cmd, &CancellationToken::new(), 10, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
