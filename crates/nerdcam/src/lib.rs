//! NerdCam - local streaming and control proxy for Foscam-style cameras
//!
//! One upstream RTSP connection, many local viewers, no credentials handed
//! to clients:
//!
//! - **Camera** (`camera`): CGI control client, response parsing, credential handling
//! - **Transcode** (`transcode`): ffmpeg command building and process lifecycle
//! - **Source** (`source`): shared MJPEG frame source with restart coordination
//! - **Patrol** (`patrol`): background preset cycling
//! - **Recorder** (`recorder`): one-at-a-time MP4 recording
//! - **Web** (`web`): axum proxy server tying it all together

// Core types
mod error;

pub use error::{Error, Result};

// Camera control protocol
pub mod camera;

// Host probe and recording codec catalog
pub mod capabilities;

// Persisted tunables
pub mod settings;

// External process wrapper and ffmpeg invocations
pub mod transcode;

// Shared MJPEG source
pub mod source;

// Preset patrol
pub mod patrol;

// Recording
pub mod recorder;

// HTTP proxy server
pub mod web;

pub use camera::{CameraClient, CameraEndpoint};
pub use capabilities::Capabilities;
pub use settings::{JsonFileStore, MemoryStore, Settings, SettingsHandle, SettingsStore, Transport};
pub use web::{AppState, ProxyServer, ShutdownReport};
