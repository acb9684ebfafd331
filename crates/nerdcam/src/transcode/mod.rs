//! Transcode process wrapper
//!
//! Every external transcoding job (shared MJPEG source, per-client audio or A/V
//! stream, recording) runs as one [`TranscodeProcess`]. A watcher task owns the
//! child for its whole life and publishes a [`ProcessExit`] when it ends, so a
//! process can never outlive its handle unobserved.
//!
//! Two invocation shapes exist:
//! - [`Sink::Pipe`]: continuous output on stdout, taken by the caller
//! - [`Sink::File`]: the process writes a file; `q` on stdin finalizes it

pub mod ffmpeg;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;

pub use ffmpeg::{Ffmpeg, TranscodeTask, Transcoder, VideoEncoding};

/// Lines of stderr kept per process
pub const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Lines of stderr quoted in error reports
pub const DIAGNOSTIC_REPORT_LINES: usize = 5;

/// Upper bound on waiting for a killed process to be reaped
pub const KILL_WAIT: Duration = Duration::from_secs(5);

/// Longest stderr line kept (ffmpeg progress lines can be huge)
const MAX_LINE_BYTES: usize = 1024;

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Where the process sends its output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    /// Continuous byte stream on stdout
    Pipe,
    /// File written by the process itself
    File(PathBuf),
}

/// A fully-resolved external command
#[derive(Debug, Clone)]
pub struct TranscodeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub sink: Sink,
}

/// How a transcode process ended
#[derive(Debug, Clone, Default)]
pub struct ProcessExit {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// True when the exit followed a `stop`/`kill` from our side
    pub requested: bool,
    /// Tail of the process's stderr
    pub diagnostics: Vec<String>,
}

impl ProcessExit {
    /// The process ended without anyone asking it to
    pub fn is_unexpected(&self) -> bool {
        !self.requested
    }

    /// Last few diagnostic lines joined for a log line or error message
    pub fn summary(&self) -> String {
        let start = self.diagnostics.len().saturating_sub(DIAGNOSTIC_REPORT_LINES);
        let tail = &self.diagnostics[start..];
        if tail.is_empty() {
            "no diagnostic output".to_string()
        } else {
            tail.join(" | ")
        }
    }

    pub fn into_error(self, task: &str) -> Error {
        let diagnostics = self.summary();
        Error::ProcessFailed {
            task: task.to_string(),
            code: self.code,
            diagnostics,
        }
    }
}

/// Bounded ring of the most recent stderr lines
#[derive(Debug)]
struct DiagnosticTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DiagnosticTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Handle to one running external process
pub struct TranscodeProcess {
    id: u64,
    task: String,
    pid: Option<u32>,
    sink: Sink,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    kill: CancellationToken,
    stop_requested: Arc<AtomicBool>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl TranscodeProcess {
    /// Spawn the command and start watching it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(task: &str, command: TranscodeCommand) -> Result<Self, Error> {
        let stdout = match command.sink {
            Sink::Pipe => Stdio::piped(),
            Sink::File(_) => Stdio::null(),
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProcessFailed {
                task: task.to_string(),
                code: None,
                diagnostics: format!("failed to spawn {}: {}", command.program, e),
            })?;

        let id = NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let tail = Arc::new(Mutex::new(DiagnosticTail::new(DIAGNOSTIC_TAIL_LINES)));

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_diagnostics(stderr, Arc::clone(&tail), task.to_string())));

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let stop_requested = Arc::new(AtomicBool::new(false));

        let watcher_kill = kill.clone();
        let watcher_stop = Arc::clone(&stop_requested);
        let watcher_task = task.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = watcher_kill.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            // Let stderr drain so the tail includes the final error
            if let Some(handle) = stderr_task {
                let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
            }

            let code = status.ok().and_then(|s| s.code());
            let requested = watcher_stop.load(Ordering::SeqCst);
            let diagnostics = tail
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .snapshot();
            let exit = ProcessExit {
                code,
                requested,
                diagnostics,
            };

            if requested {
                debug!(task = %watcher_task, pid, ?code, "Transcode process stopped");
            } else {
                warn!(
                    task = %watcher_task,
                    pid,
                    ?code,
                    diagnostics = %exit.summary(),
                    "Transcode process exited unexpectedly"
                );
            }
            exit_tx.send_replace(Some(exit));
        });

        info!(task, pid, id, program = %command.program, "Transcode process started");

        Ok(Self {
            id,
            task: task.to_string(),
            pid,
            sink: command.sink,
            stdin: tokio::sync::Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            kill,
            stop_requested,
            exit: exit_rx,
        })
    }

    /// Process-unique handle id (not the OS pid)
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn sink(&self) -> &Sink {
        &self.sink
    }

    /// Take the stdout stream. `None` for file sinks or if already taken.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// The exit record, once the process has ended
    pub fn exit(&self) -> Option<ProcessExit> {
        self.exit.borrow().clone()
    }

    /// Wait for the process to end.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        exit.unwrap_or_else(|| ProcessExit {
            code: None,
            requested: self.stop_requested.load(Ordering::SeqCst),
            diagnostics: Vec::new(),
        })
    }

    /// Force-terminate without waiting.
    pub fn kill(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.kill.cancel();
    }

    /// Force-terminate and wait (bounded) for the process to be reaped.
    ///
    /// Returns whether the process is confirmed gone.
    pub async fn terminate(&self) -> bool {
        self.kill();
        tokio::time::timeout(KILL_WAIT, self.wait()).await.is_ok()
    }

    /// Graceful stop: send `q` on stdin and close it, wait up to `grace`,
    /// then force-kill.
    ///
    /// For file sinks `q` makes ffmpeg write the trailer so the container is
    /// playable.
    pub async fn stop(&self, grace: Duration) -> ProcessExit {
        self.stop_requested.store(true, Ordering::SeqCst);

        let graceful = async {
            if let Some(mut stdin) = self.stdin.lock().await.take() {
                let _ = stdin.write_all(b"q").await;
                let _ = stdin.flush().await;
            }
            self.wait().await
        };

        match tokio::time::timeout(grace, graceful).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    task = %self.task,
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Transcode process ignored graceful stop, killing"
                );
                self.kill();
                match tokio::time::timeout(KILL_WAIT, self.wait()).await {
                    Ok(exit) => exit,
                    Err(_) => ProcessExit {
                        code: None,
                        requested: true,
                        diagnostics: vec!["process did not exit after kill".to_string()],
                    },
                }
            }
        }
    }
}

impl Drop for TranscodeProcess {
    fn drop(&mut self) {
        if self.is_running() {
            self.kill();
        }
    }
}

/// Read stderr into the tail, splitting on `\n` and `\r`.
async fn collect_diagnostics(mut stderr: ChildStderr, tail: Arc<Mutex<DiagnosticTail>>, task: String) {
    let mut buf = [0u8; 1024];
    let mut line: Vec<u8> = Vec::with_capacity(256);

    let flush = |line: &mut Vec<u8>| {
        if line.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(line).trim().to_string();
        line.clear();
        if text.is_empty() {
            return;
        }
        debug!(task = %task, "{}", text);
        tail.lock().unwrap_or_else(PoisonError::into_inner).push(text);
    };

    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                flush(&mut line);
            } else if line.len() < MAX_LINE_BYTES {
                line.push(b);
            }
        }
    }
    flush(&mut line);
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, sink: Sink) -> TranscodeCommand {
        TranscodeCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            sink,
        }
    }

    #[tokio::test]
    async fn pipe_output_is_readable() {
        let process = TranscodeProcess::spawn("test", sh("printf hello", Sink::Pipe)).unwrap();
        let mut stdout = process.take_stdout().unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");

        let exit = process.wait().await;
        assert_eq!(exit.code, Some(0));
        assert!(exit.is_unexpected(), "exit was not requested by us");
    }

    #[tokio::test]
    async fn unexpected_exit_captures_diagnostic_tail() {
        let script = "for i in 1 2 3 4 5 6 7; do echo \"line $i\" >&2; done; exit 3";
        let process = TranscodeProcess::spawn("test", sh(script, Sink::Pipe)).unwrap();
        let exit = process.wait().await;

        assert_eq!(exit.code, Some(3));
        assert!(exit.is_unexpected());
        assert_eq!(exit.diagnostics.last().map(String::as_str), Some("line 7"));

        let summary = exit.summary();
        assert!(summary.contains("line 3"));
        assert!(summary.contains("line 7"));
        assert!(!summary.contains("line 2"), "only the last lines are reported");

        match exit.into_error("test") {
            Error::ProcessFailed { code, .. } => assert_eq!(code, Some(3)),
            e => panic!("unexpected error: {:?}", e),
        }
    }

    #[tokio::test]
    async fn graceful_stop_finalizes_through_stdin() {
        let script = "read -r _line; exit 0";
        let process =
            TranscodeProcess::spawn("test", sh(script, Sink::File("/dev/null".into()))).unwrap();

        let exit = process.stop(Duration::from_secs(5)).await;
        assert_eq!(exit.code, Some(0), "exited on its own after q");
        assert!(exit.requested);
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_after_grace() {
        // Ignores stdin entirely
        let process = TranscodeProcess::spawn("test", sh("exec sleep 30", Sink::Pipe)).unwrap();

        let started = std::time::Instant::now();
        let exit = process.stop(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(exit.requested);
        assert_eq!(exit.code, None, "killed by signal");
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn terminate_reports_exit() {
        let process = TranscodeProcess::spawn("test", sh("exec sleep 30", Sink::Pipe)).unwrap();
        assert!(process.is_running());
        assert!(process.terminate().await);
        assert!(!process.is_running());
        assert!(!process.exit().unwrap().is_unexpected());
    }

    #[tokio::test]
    async fn missing_program_is_a_process_failure() {
        let command = TranscodeCommand {
            program: "/nonexistent/ffmpeg".to_string(),
            args: vec![],
            sink: Sink::Pipe,
        };
        match TranscodeProcess::spawn("test", command) {
            Err(Error::ProcessFailed { diagnostics, .. }) => {
                assert!(diagnostics.contains("failed to spawn"))
            }
            Err(e) => panic!("unexpected error: {:?}", e),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[test]
    fn diagnostic_tail_is_bounded() {
        let mut tail = DiagnosticTail::new(3);
        for i in 0..10 {
            tail.push(format!("l{}", i));
        }
        assert_eq!(tail.snapshot(), vec!["l7", "l8", "l9"]);
    }
}
