//! Recording codec catalog and host capability probe
//!
//! Probed once at startup: which encoders the local ffmpeg build offers and
//! which NVIDIA GPUs are present. A failed probe degrades to "no hardware
//! codecs"; stream copy (`original`) is always available.

use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transcode::VideoEncoding;

/// Upper bound on each probe command
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Codec key for stream copy
pub const ORIGINAL: &str = "original";

/// GPU selection meaning "let the driver pick"
pub const GPU_AUTO: &str = "auto";

/// One recording codec choice
#[derive(Debug, Clone, Copy)]
pub struct CodecSpec {
    pub key: &'static str,
    /// ffmpeg encoder name, `None` for stream copy
    pub encoder: Option<&'static str>,
    pub description: &'static str,
    /// Native quality scale (best, smallest) for `-cq`/`-crf`
    pub quality_range: (u32, u32),
}

impl CodecSpec {
    fn is_nvenc(&self) -> bool {
        self.encoder.is_some_and(|e| e.ends_with("_nvenc"))
    }
}

pub const CODEC_CATALOG: &[CodecSpec] = &[
    CodecSpec {
        key: "nvenc_av1",
        encoder: Some("av1_nvenc"),
        description: "AV1 (NVIDIA GPU)",
        quality_range: (22, 48),
    },
    CodecSpec {
        key: "nvenc_h265",
        encoder: Some("hevc_nvenc"),
        description: "H.265 (NVIDIA GPU)",
        quality_range: (18, 42),
    },
    CodecSpec {
        key: "nvenc_h264",
        encoder: Some("h264_nvenc"),
        description: "H.264 (NVIDIA GPU)",
        quality_range: (16, 38),
    },
    CodecSpec {
        key: "sw_h265",
        encoder: Some("libx265"),
        description: "H.265 (CPU)",
        quality_range: (18, 40),
    },
    CodecSpec {
        key: "sw_h264",
        encoder: Some("libx264"),
        description: "H.264 (CPU)",
        quality_range: (16, 38),
    },
    CodecSpec {
        key: ORIGINAL,
        encoder: None,
        description: "Original (stream copy)",
        quality_range: (0, 0),
    },
];

/// Preferred default codec, first available wins
const DEFAULT_PREFERENCE: &[&str] = &["nvenc_h265", "nvenc_h264", "sw_h265", "sw_h264", ORIGINAL];

/// Encoder quality for a 1..=10 compression level (1 = best, 10 = smallest)
pub fn quality_value(range: (u32, u32), compression: u8) -> u32 {
    let (lo, hi) = range;
    let c = u32::from(compression.clamp(1, 10));
    lo + (c - 1) * hi.saturating_sub(lo) / 9
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gpu {
    pub index: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Available codec keys, in catalog order
    codecs: Vec<&'static CodecSpec>,
    gpus: Vec<Gpu>,
    ffmpeg_version: Option<String>,
}

impl Default for Capabilities {
    /// Stream copy only
    fn default() -> Self {
        Self::from_listing("", "")
    }
}

impl Capabilities {
    /// Build from `ffmpeg -encoders` and `nvidia-smi` output.
    pub fn from_listing(encoders: &str, gpus: &str) -> Self {
        let encoders = parse_encoders(encoders);
        let gpus = parse_gpus(gpus);
        let codecs = CODEC_CATALOG
            .iter()
            .filter(|c| match c.encoder {
                None => true,
                Some(enc) => encoders.iter().any(|e| e == enc),
            })
            .collect();
        Self {
            codecs,
            gpus,
            ffmpeg_version: None,
        }
    }

    /// Run the probes against the local system.
    pub async fn probe(ffmpeg: &str) -> Self {
        let encoders = run_probe(ffmpeg, &["-hide_banner", "-encoders"])
            .await
            .unwrap_or_default();
        let gpus = run_probe(
            "nvidia-smi",
            &["--query-gpu=index,name", "--format=csv,noheader"],
        )
        .await
        .unwrap_or_default();

        let mut caps = Self::from_listing(&encoders, &gpus);
        caps.ffmpeg_version = run_probe(ffmpeg, &["-version"])
            .await
            .and_then(|out| out.lines().next().map(str::to_string));

        info!(
            codecs = ?caps.codec_keys(),
            gpus = caps.gpus.len(),
            default = caps.default_codec(),
            "Recording capabilities probed"
        );
        caps
    }

    pub fn ffmpeg_version(&self) -> Option<&str> {
        self.ffmpeg_version.as_deref()
    }

    pub fn codec_keys(&self) -> Vec<&'static str> {
        self.codecs.iter().map(|c| c.key).collect()
    }

    pub fn codecs(&self) -> &[&'static CodecSpec] {
        &self.codecs
    }

    pub fn gpus(&self) -> &[Gpu] {
        &self.gpus
    }

    pub fn has_codec(&self, key: &str) -> bool {
        self.codecs.iter().any(|c| c.key == key)
    }

    pub fn is_valid_gpu(&self, gpu: &str) -> bool {
        gpu == GPU_AUTO || self.gpus.iter().any(|g| g.index == gpu)
    }

    pub fn default_codec(&self) -> &'static str {
        DEFAULT_PREFERENCE
            .iter()
            .copied()
            .find(|k| self.has_codec(k))
            .unwrap_or(ORIGINAL)
    }

    /// Resolve a codec choice into encoder arguments.
    pub fn video_encoding(&self, codec: &str, compression: u8, gpu: &str) -> Result<VideoEncoding> {
        let spec = self
            .codecs
            .iter()
            .find(|c| c.key == codec)
            .ok_or_else(|| Error::invalid(format!("codec {} is not available", codec)))?;

        let Some(encoder) = spec.encoder else {
            return Ok(VideoEncoding::Copy);
        };
        let quality = quality_value(spec.quality_range, compression);

        if spec.is_nvenc() {
            // Pinning only matters with more than one card
            let gpu = (gpu != GPU_AUTO && self.gpus.len() > 1 && self.is_valid_gpu(gpu))
                .then(|| gpu.to_string());
            Ok(VideoEncoding::Nvenc {
                encoder: encoder.to_string(),
                quality,
                gpu,
            })
        } else {
            Ok(VideoEncoding::Software {
                encoder: encoder.to_string(),
                quality,
            })
        }
    }
}

/// Encoder names: second column of each `ffmpeg -encoders` line
fn parse_encoders(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// `index, name` CSV rows
fn parse_gpus(listing: &str) -> Vec<Gpu> {
    listing
        .lines()
        .filter_map(|line| line.split_once(','))
        .map(|(index, name)| Gpu {
            index: index.trim().to_string(),
            name: name.trim().to_string(),
        })
        .filter(|g| !g.index.is_empty())
        .collect()
}

async fn run_probe(program: &str, args: &[&str]) -> Option<String> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    match tokio::time::timeout(PROBE_TIMEOUT, command.output()).await {
        Ok(Ok(out)) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(Ok(out)) => {
            debug!(program, code = ?out.status.code(), "Probe exited with failure");
            None
        }
        Ok(Err(e)) => {
            debug!(program, error = %e, "Probe could not run");
            None
        }
        Err(_) => {
            warn!(program, "Probe timed out");
            None
        }
    }
}
