//! Shared MJPEG frame source
//!
//! One transcode process decodes the camera's stream into JPEG frames; any
//! number of viewers read the latest frame through a `watch` channel. Restarts
//! (quality or transport change, dead or stalled process) are serialized by an
//! async mutex so concurrent viewers never launch duplicate processes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::settings::Transport;
use crate::transcode::{TranscodeProcess, TranscodeTask, Transcoder};

/// A source with no frame for this long is restarted
pub const STALE_AFTER: Duration = Duration::from_secs(2);

/// Pause between stopping and relaunching
pub const RESTART_SETTLE: Duration = Duration::from_millis(500);

/// Partial frames larger than this are discarded
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// One published JPEG
#[derive(Debug, Clone)]
pub struct SourceFrame {
    /// Strictly increasing across restarts
    pub sequence: u64,
    pub data: Bytes,
    pub captured_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub running: bool,
    pub quality: Option<u8>,
    pub transport: Option<Transport>,
    pub sequence: u64,
    pub launches: u64,
    /// Milliseconds since the last frame, if any
    pub last_frame_age_ms: Option<u64>,
}

struct RunningSource {
    process: Arc<TranscodeProcess>,
    quality: u8,
    transport: Transport,
    started_at: Instant,
}

struct SourceInner {
    transcoder: Arc<dyn Transcoder>,
    control: Mutex<Option<RunningSource>>,
    frames: watch::Sender<Option<SourceFrame>>,
    sequence: AtomicU64,
    /// Bumped on every launch and stop; readers of older generations go quiet
    generation: AtomicU64,
    launches: AtomicU64,
    stale_after: Duration,
    settle: Duration,
}

impl SourceInner {
    /// Publish a frame unless the reader's generation has been superseded.
    ///
    /// The generation check runs under the channel's lock, so a `stop` that
    /// bumped the generation and cleared the slot can never be overwritten by
    /// a late frame.
    fn publish(&self, generation: u64, data: Bytes) -> bool {
        let mut published = false;
        self.frames.send_if_modified(|slot| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            *slot = Some(SourceFrame {
                sequence,
                data,
                captured_at: Instant::now(),
            });
            published = true;
            true
        });
        published
    }

    fn invalidate(&self) {
        self.frames.send_modify(|slot| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *slot = None;
        });
    }
}

/// Cheaply clonable handle to the shared source
#[derive(Clone)]
pub struct FrameSource {
    inner: Arc<SourceInner>,
}

impl FrameSource {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self::with_timing(transcoder, STALE_AFTER, RESTART_SETTLE)
    }

    pub fn with_timing(transcoder: Arc<dyn Transcoder>, stale_after: Duration, settle: Duration) -> Self {
        let (frames, _) = watch::channel(None);
        Self {
            inner: Arc::new(SourceInner {
                transcoder,
                control: Mutex::new(None),
                frames,
                sequence: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                launches: AtomicU64::new(0),
                stale_after,
                settle,
            }),
        }
    }

    /// Make sure a healthy process with these parameters is running.
    ///
    /// Callers queued behind an in-flight restart find the fresh process and
    /// return without launching another.
    pub async fn ensure_running(&self, quality: u8, transport: Transport) -> Result<()> {
        let mut control = self.inner.control.lock().await;

        if let Some(running) = control.as_ref() {
            let reason = if !running.process.is_running() {
                "process exited"
            } else if running.quality != quality || running.transport != transport {
                "parameters changed"
            } else if self.idle_for(running) > self.inner.stale_after {
                "no frames"
            } else {
                return Ok(());
            };

            info!(
                reason,
                quality,
                transport = %transport,
                "Restarting MJPEG source"
            );
            if let Some(old) = control.take() {
                self.inner.invalidate();
                old.process.terminate().await;
            }
            tokio::time::sleep(self.inner.settle).await;
        }

        *control = Some(self.launch(quality, transport)?);
        Ok(())
    }

    fn launch(&self, quality: u8, transport: Transport) -> Result<RunningSource> {
        let command = self
            .inner
            .transcoder
            .command(&TranscodeTask::Mjpeg { quality, transport })?;
        let process = Arc::new(TranscodeProcess::spawn("mjpeg", command)?);
        let stdout = process.take_stdout().ok_or_else(|| Error::ProcessFailed {
            task: "mjpeg".to_string(),
            code: None,
            diagnostics: "no stdout pipe".to_string(),
        })?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let launches = self.inner.launches.fetch_add(1, Ordering::SeqCst) + 1;
        info!(quality, transport = %transport, generation, launches, "MJPEG source started");

        tokio::spawn(read_frames(
            Arc::clone(&self.inner),
            stdout,
            generation,
            Arc::clone(&process),
        ));

        Ok(RunningSource {
            process,
            quality,
            transport,
            started_at: Instant::now(),
        })
    }

    /// Time since the last frame, or since launch before the first one
    fn idle_for(&self, running: &RunningSource) -> Duration {
        let since = match self.inner.frames.borrow().as_ref() {
            Some(frame) if frame.captured_at > running.started_at => frame.captured_at,
            _ => running.started_at,
        };
        since.elapsed()
    }

    /// Terminate the process and publish "no frame".
    pub async fn stop(&self) {
        let mut control = self.inner.control.lock().await;
        self.inner.invalidate();
        if let Some(running) = control.take() {
            info!("Stopping MJPEG source");
            running.process.terminate().await;
        }
    }

    /// Receiver of the latest frame; `None` while nothing is available.
    pub fn subscribe(&self) -> watch::Receiver<Option<SourceFrame>> {
        self.inner.frames.subscribe()
    }

    pub fn latest(&self) -> Option<SourceFrame> {
        self.inner.frames.borrow().clone()
    }

    pub fn launches(&self) -> u64 {
        self.inner.launches.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> SourceStatus {
        let control = self.inner.control.lock().await;
        let running = control.as_ref().filter(|r| r.process.is_running());
        SourceStatus {
            running: running.is_some(),
            quality: running.map(|r| r.quality),
            transport: running.map(|r| r.transport),
            sequence: self.inner.sequence.load(Ordering::SeqCst),
            launches: self.launches(),
            last_frame_age_ms: self
                .latest()
                .map(|f| f.captured_at.elapsed().as_millis() as u64),
        }
    }
}

async fn read_frames(
    inner: Arc<SourceInner>,
    mut stdout: ChildStdout,
    generation: u64,
    process: Arc<TranscodeProcess>,
) {
    let mut scanner = JpegScanner::new(MAX_FRAME_BYTES);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut count: u64 = 0;

    'read: loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, generation, "MJPEG read error");
                break;
            }
        };

        for frame in scanner.push(&chunk[..n]) {
            let size = frame.len();
            if !inner.publish(generation, frame) {
                debug!(generation, "MJPEG reader superseded");
                break 'read;
            }
            count += 1;
            if count == 1 {
                info!(bytes = size, generation, "First MJPEG frame received");
            }
        }
    }

    info!(frames = count, generation, "MJPEG reader stopped");
    if let Ok(exit) = tokio::time::timeout(Duration::from_secs(2), process.wait()).await {
        if exit.is_unexpected() {
            warn!(code = ?exit.code, diagnostics = %exit.summary(), "MJPEG source died");
        }
    }
}

/// Splits a byte stream into complete JPEG images on SOI/EOI markers.
#[derive(Debug)]
pub struct JpegScanner {
    buf: BytesMut,
    max_frame: usize,
}

impl JpegScanner {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK * 4),
            max_frame,
        }
    }

    /// Feed a chunk; returns every frame it completed.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buf, SOI, 0) else {
                // Keep a trailing 0xFF; it may be the first half of an SOI
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let discard = self.buf.len() - keep;
                self.buf.advance(discard);
                break;
            };
            self.buf.advance(start);

            match find_marker(&self.buf, EOI, SOI.len()) {
                Some(end) => frames.push(self.buf.split_to(end + EOI.len()).freeze()),
                None => {
                    if self.buf.len() > self.max_frame {
                        warn!(bytes = self.buf.len(), "Dropping oversize partial frame");
                        self.buf.clear();
                    }
                    break;
                }
            }
        }
        frames
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|p| p + from)
}
