//! Streaming endpoints
//!
//! Each response body is fed by a producer task through a small mpsc channel.
//! The producer ends when the client goes away (`tx.closed()`), when the
//! server shuts down, or when its source ends.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{AppState, RegisteredProcess};
use crate::error::{Error, Result};
use crate::transcode::{TranscodeProcess, TranscodeTask, KILL_WAIT};

/// Multipart boundary of the MJPEG stream
pub const MJPEG_BOUNDARY: &str = "frame";

/// A viewer that sees no new frame for this long asks for a restart
const FRAME_STALL: Duration = Duration::from_secs(2);

/// Per-client streams must produce their first bytes within this window
const FIRST_OUTPUT_TIMEOUT: Duration = Duration::from_secs(20);

const CHUNK_SIZE: usize = 4096;

fn channel_body(rx: mpsc::Receiver<Bytes>) -> Body {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, std::io::Error>(chunk), rx))
    });
    Body::from_stream(stream)
}

fn streaming_response(content_type: String, body: Body) -> Response {
    (
        [(CONTENT_TYPE, content_type), (CACHE_CONTROL, "no-cache".to_string())],
        body,
    )
        .into_response()
}

/// Send unless the server is shutting down. False means stop producing.
async fn forward(state: &AppState, tx: &mpsc::Sender<Bytes>, chunk: Bytes) -> bool {
    tokio::select! {
        _ = state.shutdown.cancelled() => false,
        sent = tx.send(chunk) => sent.is_ok(),
    }
}

// ========== Shared MJPEG ==========

/// GET /api/mjpeg — one multipart part per new frame
pub(super) async fn mjpeg(State(state): State<Arc<AppState>>) -> Result<Response> {
    if state.is_shutting_down() {
        return Err(Error::conflict("server is shutting down"));
    }
    let settings = state.settings.snapshot();
    state
        .frames
        .ensure_running(settings.stream_quality, settings.rtsp_transport)
        .await?;

    let (tx, rx) = mpsc::channel(2);
    state.tasks.spawn(pump_frames(Arc::clone(&state), tx));

    Ok(streaming_response(
        format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
        channel_body(rx),
    ))
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

async fn pump_frames(state: Arc<AppState>, tx: mpsc::Sender<Bytes>) {
    let mut frames = state.frames.subscribe();
    let mut last_sequence = 0u64;
    let mut sent = 0u64;
    info!("MJPEG client connected");

    loop {
        let latest = frames.borrow_and_update().clone();
        if let Some(frame) = latest {
            if frame.sequence > last_sequence {
                last_sequence = frame.sequence;
                if !forward(&state, &tx, multipart_part(&frame.data)).await {
                    break;
                }
                sent += 1;
            }
        }

        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tx.closed() => break,
            changed = tokio::time::timeout(FRAME_STALL, frames.changed()) => match changed {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    if state.is_shutting_down() {
                        break;
                    }
                    warn!(stall_secs = FRAME_STALL.as_secs(), "MJPEG client: no frames, requesting source restart");
                    let settings = state.settings.snapshot();
                    if let Err(e) = state
                        .frames
                        .ensure_running(settings.stream_quality, settings.rtsp_transport)
                        .await
                    {
                        warn!(error = %e, "MJPEG source restart failed");
                    }
                }
            },
        }
    }

    info!(frames = sent, "MJPEG client disconnected");
}

// ========== Per-client transcodes ==========

/// GET /api/audio — MP3 audio
pub(super) async fn audio(State(state): State<Arc<AppState>>) -> Result<Response> {
    let s = state.settings.snapshot();
    transcode_stream(
        state,
        TranscodeTask::Audio {
            transport: s.rtsp_transport,
            gain: s.mic_gain,
        },
    )
    .await
}

/// GET /api/fmp4 — fragmented MP4 for browsers
pub(super) async fn fmp4(State(state): State<Arc<AppState>>) -> Result<Response> {
    let s = state.settings.snapshot();
    transcode_stream(
        state,
        TranscodeTask::Fmp4 {
            transport: s.rtsp_transport,
            gain: s.mic_gain,
        },
    )
    .await
}

/// GET /api/stream — MPEG-TS for VLC/ffplay
pub(super) async fn mpegts(State(state): State<Arc<AppState>>) -> Result<Response> {
    let s = state.settings.snapshot();
    transcode_stream(
        state,
        TranscodeTask::MpegTs {
            transport: s.rtsp_transport,
            gain: s.mic_gain,
        },
    )
    .await
}

/// Launch a dedicated process for this client and stream its stdout.
///
/// The response is only committed once the process produced output, so an
/// unreachable camera surfaces as an HTTP error instead of an empty stream.
async fn transcode_stream(state: Arc<AppState>, task: TranscodeTask) -> Result<Response> {
    if state.is_shutting_down() {
        return Err(Error::conflict("server is shutting down"));
    }

    let name = task.name();
    let command = state.transcoder.command(&task)?;
    let process = Arc::new(TranscodeProcess::spawn(name, command)?);
    let mut stdout = process.take_stdout().ok_or_else(|| Error::ProcessFailed {
        task: name.to_string(),
        code: None,
        diagnostics: "no stdout pipe".to_string(),
    })?;
    let guard = state.processes.register(Arc::clone(&process));

    let mut buf = vec![0u8; CHUNK_SIZE];
    let first = tokio::select! {
        _ = state.shutdown.cancelled() => return Err(Error::conflict("server is shutting down")),
        read = tokio::time::timeout(FIRST_OUTPUT_TIMEOUT, stdout.read(&mut buf)) => read,
    };
    let n = match first {
        Ok(Ok(n)) if n > 0 => n,
        Ok(Ok(_)) | Ok(Err(_)) => {
            let Ok(exit) = tokio::time::timeout(KILL_WAIT, process.wait()).await else {
                return Err(Error::ProcessFailed {
                    task: name.to_string(),
                    code: None,
                    diagnostics: "closed its output without exiting".to_string(),
                });
            };
            warn!(task = name, code = ?exit.code, diagnostics = %exit.summary(), "Stream process ended before output");
            return Err(exit.into_error(name));
        }
        Err(_) => {
            return Err(Error::Upstream(format!(
                "no {} output within {}s",
                name,
                FIRST_OUTPUT_TIMEOUT.as_secs()
            )))
        }
    };

    info!(task = name, pid = process.pid(), "Stream client connected");
    let (tx, rx) = mpsc::channel(8);
    if tx.try_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
        return Err(Error::conflict("stream channel closed"));
    }
    state
        .tasks
        .spawn(pump_process(Arc::clone(&state), stdout, guard, buf, tx));

    Ok(streaming_response(task.content_type().to_string(), channel_body(rx)))
}

async fn pump_process(
    state: Arc<AppState>,
    mut stdout: ChildStdout,
    guard: RegisteredProcess,
    mut buf: Vec<u8>,
    tx: mpsc::Sender<Bytes>,
) {
    let task = guard.process().task().to_string();

    loop {
        let read = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tx.closed() => {
                info!(task = %task, "Stream client disconnected");
                break;
            }
            read = stdout.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                if let Ok(exit) = tokio::time::timeout(Duration::from_secs(1), guard.process().wait()).await {
                    if exit.is_unexpected() {
                        warn!(task = %task, code = ?exit.code, diagnostics = %exit.summary(), "Stream process exited");
                    }
                }
                break;
            }
            Ok(n) => {
                if !forward(&state, &tx, Bytes::copy_from_slice(&buf[..n])).await {
                    break;
                }
            }
            Err(e) => {
                warn!(task = %task, error = %e, "Stream read error");
                break;
            }
        }
    }
    // Dropping the guard kills and unregisters the process
    drop(guard);
}
