//! ffmpeg command construction
//!
//! Each [`TranscodeTask`] maps to one invocation. Live tasks read the camera's
//! RTSP stream with low-latency input flags and write to stdout; recordings
//! write a file and are finalized with `q` on stdin.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{Sink, TranscodeCommand};
use crate::camera::CameraEndpoint;
use crate::error::Result;
use crate::settings::Transport;

/// Builds the concrete command for a task.
///
/// Implemented by [`Ffmpeg`]; tests substitute scripted stand-ins.
pub trait Transcoder: Send + Sync {
    fn command(&self, task: &TranscodeTask) -> Result<TranscodeCommand>;
}

/// How recording video is encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoEncoding {
    /// Stream copy, no re-encode
    Copy,
    /// NVIDIA hardware encoder, constant quality
    Nvenc {
        encoder: String,
        quality: u32,
        gpu: Option<String>,
    },
    /// CPU encoder, constant rate factor
    Software { encoder: String, quality: u32 },
}

impl VideoEncoding {
    pub fn args(&self) -> Vec<String> {
        match self {
            VideoEncoding::Copy => strings(&["-c:v", "copy"]),
            VideoEncoding::Nvenc {
                encoder,
                quality,
                gpu,
            } => {
                let mut args = strings(&["-c:v", encoder.as_str(), "-cq"]);
                args.push(quality.to_string());
                args.extend(strings(&["-preset", "p4"]));
                if let Some(gpu) = gpu {
                    args.extend(strings(&["-gpu", gpu.as_str()]));
                }
                args
            }
            VideoEncoding::Software { encoder, quality } => {
                let mut args = strings(&["-c:v", encoder.as_str(), "-crf"]);
                args.push(quality.to_string());
                args.extend(strings(&["-preset", "fast"]));
                args
            }
        }
    }
}

/// One logical transcoding job
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeTask {
    /// Shared JPEG frame source, no audio
    Mjpeg { quality: u8, transport: Transport },
    /// Per-client MP3 audio
    Audio { transport: Transport, gain: f64 },
    /// Per-client fragmented MP4 (browser playback)
    Fmp4 { transport: Transport, gain: f64 },
    /// Per-client MPEG-TS (VLC/ffplay)
    MpegTs { transport: Transport, gain: f64 },
    /// Recording to a file
    Recording {
        transport: Transport,
        video: VideoEncoding,
        max_duration: Duration,
        output: PathBuf,
    },
}

impl TranscodeTask {
    pub fn name(&self) -> &'static str {
        match self {
            TranscodeTask::Mjpeg { .. } => "mjpeg",
            TranscodeTask::Audio { .. } => "audio",
            TranscodeTask::Fmp4 { .. } => "fmp4",
            TranscodeTask::MpegTs { .. } => "mpegts",
            TranscodeTask::Recording { .. } => "recording",
        }
    }

    /// MIME type of the task's output
    pub fn content_type(&self) -> &'static str {
        match self {
            TranscodeTask::Mjpeg { .. } => "image/jpeg",
            TranscodeTask::Audio { .. } => "audio/mpeg",
            TranscodeTask::Fmp4 { .. } | TranscodeTask::Recording { .. } => "video/mp4",
            TranscodeTask::MpegTs { .. } => "video/mp2t",
        }
    }

    pub fn sink(&self) -> Sink {
        match self {
            TranscodeTask::Recording { output, .. } => Sink::File(output.clone()),
            _ => Sink::Pipe,
        }
    }
}

/// MJPEG `-q:v` for a 1..=10 quality (10 = best = qscale 2, 1 = qscale 31)
pub fn mjpeg_qscale(quality: u8) -> u32 {
    let q = u32::from(quality.clamp(1, 10));
    2 + (10 - q) * 29 / 9
}

/// The real ffmpeg binary reading the camera's RTSP stream
pub struct Ffmpeg {
    binary: String,
    endpoint: Arc<CameraEndpoint>,
}

impl Ffmpeg {
    pub fn new(binary: impl Into<String>, endpoint: Arc<CameraEndpoint>) -> Self {
        Self {
            binary: binary.into(),
            endpoint,
        }
    }

    /// Low-latency RTSP input, used by every live task
    fn live_input(&self, transport: Transport, genpts: bool) -> Result<Vec<String>> {
        let fflags = if genpts {
            "+nobuffer+flush_packets+genpts"
        } else {
            "+nobuffer+flush_packets"
        };
        let mut args = strings(&["-hide_banner", "-nostats", "-loglevel", "warning"]);
        args.extend(strings(&["-fflags", fflags, "-flags", "low_delay"]));
        args.extend(strings(&["-rtsp_transport", transport.as_str()]));
        args.push("-probesize".to_string());
        args.push(transport.probe_size().to_string());
        args.push("-analyzeduration".to_string());
        args.push(transport.analyze_duration().to_string());
        args.push("-i".to_string());
        args.push(self.endpoint.rtsp_url()?);
        Ok(args)
    }
}

impl Transcoder for Ffmpeg {
    fn command(&self, task: &TranscodeTask) -> Result<TranscodeCommand> {
        let args = match task {
            TranscodeTask::Mjpeg { quality, transport } => {
                let mut args = self.live_input(*transport, false)?;
                args.extend(strings(&["-an", "-c:v", "mjpeg", "-q:v"]));
                args.push(mjpeg_qscale(*quality).to_string());
                args.extend(strings(&[
                    "-r",
                    "25",
                    "-f",
                    "mjpeg",
                    "-threads",
                    "1",
                    "-flush_packets",
                    "1",
                    "pipe:1",
                ]));
                args
            }
            TranscodeTask::Audio { transport, gain } => {
                let mut args = self.live_input(*transport, false)?;
                args.extend(strings(&["-vn", "-af"]));
                args.push(volume_filter(*gain));
                args.extend(strings(&[
                    "-c:a",
                    "libmp3lame",
                    "-b:a",
                    "128k",
                    "-f",
                    "mp3",
                    "-flush_packets",
                    "1",
                    "pipe:1",
                ]));
                args
            }
            TranscodeTask::Fmp4 { transport, gain } => {
                let mut args = self.live_input(*transport, true)?;
                args.extend(strings(&["-c:v", "copy", "-af"]));
                args.push(volume_filter(*gain));
                args.extend(strings(&[
                    "-c:a",
                    "aac",
                    "-b:a",
                    "128k",
                    "-f",
                    "mp4",
                    "-movflags",
                    "frag_keyframe+empty_moov+default_base_moof",
                    "-frag_duration",
                    "500000",
                    "-min_frag_duration",
                    "250000",
                    "-flush_packets",
                    "1",
                    "pipe:1",
                ]));
                args
            }
            TranscodeTask::MpegTs { transport, gain } => {
                let mut args = self.live_input(*transport, true)?;
                args.extend(strings(&["-c:v", "copy", "-af"]));
                args.push(volume_filter(*gain));
                args.extend(strings(&[
                    "-c:a",
                    "aac",
                    "-b:a",
                    "128k",
                    "-f",
                    "mpegts",
                    "-muxdelay",
                    "0",
                    "-muxpreload",
                    "0",
                    "-flush_packets",
                    "1",
                    "pipe:1",
                ]));
                args
            }
            TranscodeTask::Recording {
                transport,
                video,
                max_duration,
                output,
            } => {
                let mut args = strings(&["-hide_banner", "-nostats", "-loglevel", "warning", "-y"]);
                args.extend(strings(&["-rtsp_transport", transport.as_str(), "-i"]));
                args.push(self.endpoint.rtsp_url()?);
                args.extend(video.args());
                args.extend(strings(&["-c:a", "aac", "-b:a", "128k", "-t"]));
                args.push(max_duration.as_secs().to_string());
                args.push(output.to_string_lossy().into_owned());
                args
            }
        };

        Ok(TranscodeCommand {
            program: self.binary.clone(),
            args,
            sink: task.sink(),
        })
    }
}

fn volume_filter(gain: f64) -> String {
    format!("volume={:.1}", gain)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
