//! Recording to local MP4 files
//!
//! At most one recording at a time. The session moves Idle → Starting →
//! Active; the `Starting` phase covers the startup grace period so a racing
//! second `start` is rejected instead of launching a duplicate.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::capabilities::Capabilities;
use crate::error::{Error, Result};
use crate::settings::Transport;
use crate::transcode::{TranscodeProcess, TranscodeTask, Transcoder, VideoEncoding};

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub output_dir: PathBuf,
    /// Passed to ffmpeg as `-t`
    pub max_duration: Duration,
    /// A process that exits within this window failed to start
    pub startup_grace: Duration,
    /// Finalize wait on `stop`
    pub stop_grace: Duration,
    /// Finalize wait on `cleanup`
    pub cleanup_grace: Duration,
}

impl RecorderConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            max_duration: Duration::from_secs(3600),
            startup_grace: Duration::from_millis(1500),
            stop_grace: Duration::from_secs(10),
            cleanup_grace: Duration::from_secs(5),
        }
    }
}

/// Everything needed to start one recording
#[derive(Debug, Clone)]
pub struct RecordingRequest {
    pub transport: Transport,
    pub codec: String,
    pub compression: u8,
    pub gpu: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordingStatus {
    pub recording: bool,
    pub filename: String,
    /// Whole seconds since start
    pub elapsed: u64,
}

/// A finished recording
#[derive(Debug, Clone)]
pub struct FinishedRecording {
    pub filename: String,
    pub path: PathBuf,
    pub elapsed: Duration,
    /// False when the process had to be killed
    pub finalized: bool,
}

struct ActiveRecording {
    process: Arc<TranscodeProcess>,
    filename: String,
    path: PathBuf,
    started: Instant,
    codec: String,
    compression: u8,
}

impl ActiveRecording {
    fn status(&self) -> RecordingStatus {
        RecordingStatus {
            recording: true,
            filename: self.filename.clone(),
            elapsed: self.started.elapsed().as_secs(),
        }
    }
}

enum Session {
    Idle,
    Starting,
    Active(ActiveRecording),
}

pub struct Recorder {
    transcoder: Arc<dyn Transcoder>,
    capabilities: Arc<Capabilities>,
    config: RecorderConfig,
    session: Mutex<Session>,
}

impl Recorder {
    pub fn new(transcoder: Arc<dyn Transcoder>, capabilities: Arc<Capabilities>, config: RecorderConfig) -> Self {
        Self {
            transcoder,
            capabilities,
            config,
            session: Mutex::new(Session::Idle),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a recording. Fails with `Conflict` while one is active or
    /// starting, and with `ProcessFailed` if ffmpeg dies during the startup
    /// grace period.
    pub async fn start(&self, request: &RecordingRequest) -> Result<RecordingStatus> {
        let video = self
            .capabilities
            .video_encoding(&request.codec, request.compression, &request.gpu)?;

        {
            let mut session = self.session();
            match &*session {
                Session::Starting => return Err(Error::conflict("Recording is already starting")),
                Session::Active(rec) if rec.process.is_running() => {
                    return Err(Error::conflict(format!("Already recording to {}", rec.filename)))
                }
                _ => {}
            }
            *session = Session::Starting;
        }

        // The caller may drop this future mid-grace; the guard then puts the
        // session back to Idle.
        let pending = PendingStart { recorder: self };
        let rec = self.launch(request, video).await?;
        let status = rec.status();
        pending.commit(rec);
        Ok(status)
    }

    async fn launch(&self, request: &RecordingRequest, video: VideoEncoding) -> Result<ActiveRecording> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let filename = recording_filename(Local::now());
        let path = self.config.output_dir.join(&filename);

        let command = self.transcoder.command(&TranscodeTask::Recording {
            transport: request.transport,
            video,
            max_duration: self.config.max_duration,
            output: path.clone(),
        })?;
        let process = TranscodeProcess::spawn("recording", command)?;

        if let Ok(exit) = tokio::time::timeout(self.config.startup_grace, process.wait()).await {
            remove_if_empty(&path).await;
            error!(
                filename = %filename,
                code = ?exit.code,
                diagnostics = %exit.summary(),
                "Recording exited immediately"
            );
            return Err(exit.into_error("recording"));
        }

        info!(
            filename = %filename,
            codec = %request.codec,
            compression = request.compression,
            "Recording started"
        );
        Ok(ActiveRecording {
            process: Arc::new(process),
            filename,
            path,
            started: Instant::now(),
            codec: request.codec.clone(),
            compression: request.compression,
        })
    }

    /// Finalize the active recording.
    pub async fn stop(&self) -> Result<FinishedRecording> {
        let rec = {
            let mut session = self.session();
            match std::mem::replace(&mut *session, Session::Idle) {
                Session::Active(rec) if rec.process.is_running() => rec,
                Session::Starting => {
                    *session = Session::Starting;
                    return Err(Error::conflict("Recording is still starting"));
                }
                _ => return Err(Error::conflict("Not recording")),
            }
        };

        let elapsed = rec.started.elapsed();
        let exit = rec.process.stop(self.config.stop_grace).await;
        let finalized = exit.code.is_some();
        if finalized {
            info!(
                filename = %rec.filename,
                elapsed_secs = elapsed.as_secs(),
                codec = %rec.codec,
                compression = rec.compression,
                "Recording stopped"
            );
        } else {
            warn!(filename = %rec.filename, "Recording killed before finalize; file may be unplayable");
        }

        Ok(FinishedRecording {
            filename: rec.filename,
            path: rec.path,
            elapsed,
            finalized,
        })
    }

    /// Current state; `recording` turns false as soon as the process is gone.
    pub fn status(&self) -> RecordingStatus {
        match &*self.session() {
            Session::Active(rec) if rec.process.is_running() => rec.status(),
            _ => RecordingStatus::default(),
        }
    }

    /// Best-effort finalize on process exit.
    pub async fn cleanup(&self) {
        let rec = match std::mem::replace(&mut *self.session(), Session::Idle) {
            Session::Active(rec) => rec,
            _ => return,
        };
        if rec.process.is_running() {
            info!(filename = %rec.filename, "Finalizing recording before exit");
            rec.process.stop(self.config.cleanup_grace).await;
        }
    }
}

/// Owns the `Starting` phase until a recording is committed.
struct PendingStart<'a> {
    recorder: &'a Recorder,
}

impl PendingStart<'_> {
    fn commit(self, rec: ActiveRecording) {
        *self.recorder.session() = Session::Active(rec);
        std::mem::forget(self);
    }
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        let mut session = self.recorder.session();
        if matches!(*session, Session::Starting) {
            *session = Session::Idle;
        }
    }
}

/// `nerdcam_YYYYMMDD_HHMMSS.mp4`
pub fn recording_filename(now: DateTime<Local>) -> String {
    format!("nerdcam_{}.mp4", now.format("%Y%m%d_%H%M%S"))
}

async fn remove_if_empty(path: &Path) {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        if meta.len() == 0 {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}
