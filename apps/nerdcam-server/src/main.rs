//! NerdCam Server — local streaming and control proxy
//!
//! Holds the camera credentials, keeps one shared MJPEG connection to the
//! camera and fans it out to local viewers, alongside per-client audio and
//! video streams, recording and preset patrol.
//!
//! ## Usage
//!
//! ```bash
//! # Start with ./nerdcam.json on http://127.0.0.1:8088
//! nerdcam-server
//!
//! # Listen on every interface, custom config
//! NERDCAM_BIND=0.0.0.0 NERDCAM_CONFIG=/etc/nerdcam.json nerdcam-server
//!
//! # Also serve the web viewer
//! NERDCAM_UI=./web nerdcam-server
//! ```
//!
//! The config file holds the camera endpoint and the persisted settings:
//!
//! ```json
//! { "camera": { "ip": "192.168.1.20", "port": 88, "username": "admin", "password": "..." } }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::interval;
use tracing::{info, warn};

use nerdcam::recorder::RecorderConfig;
use nerdcam::transcode::Ffmpeg;
use nerdcam::{AppState, CameraClient, Capabilities, JsonFileStore, ProxyServer, SettingsHandle};

/// Server configuration from environment
struct Config {
    config_path: PathBuf,
    bind: IpAddr,
    port: u16,
    recordings: PathBuf,
    ffmpeg: String,
    max_record_secs: u64,
    /// Web viewer directory, served for non-API paths
    ui_path: Option<PathBuf>,
}

impl Config {
    fn from_env() -> Result<Self> {
        let config_path = std::env::var("NERDCAM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./nerdcam.json"));

        let bind = match std::env::var("NERDCAM_BIND") {
            Ok(s) => s.parse().context(format!("NERDCAM_BIND is not an IP address: {}", s))?,
            Err(_) => IpAddr::from([127, 0, 0, 1]),
        };

        let port: u16 = std::env::var("NERDCAM_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8088);

        let recordings = std::env::var("NERDCAM_RECORDINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./recordings"));

        let ffmpeg = std::env::var("NERDCAM_FFMPEG").unwrap_or_else(|_| "ffmpeg".to_string());

        let max_record_secs: u64 = std::env::var("NERDCAM_MAX_RECORD_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&secs| secs > 0)
            .unwrap_or(3600);

        let ui_path = std::env::var("NERDCAM_UI").ok().map(PathBuf::from);

        Ok(Self {
            config_path,
            bind,
            port,
            recordings,
            ffmpeg,
            max_record_secs,
            ui_path,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env()?;

    info!("NerdCam Server starting");
    info!("  Config: {:?}", config.config_path);
    info!("  Recordings: {:?}", config.recordings);
    info!("  Max recording: {}s", config.max_record_secs);
    if let Some(ref ui) = config.ui_path {
        info!("  Viewer: {:?}", ui);
    }

    let store = Arc::new(JsonFileStore::new(&config.config_path));
    let endpoint = store
        .load_camera()
        .context(format!("Failed to load camera from {:?}", config.config_path))?;
    info!("  Camera: {}:{} as {}", endpoint.host, endpoint.port, endpoint.username);

    let capabilities = Capabilities::probe(&config.ffmpeg).await;
    match capabilities.ffmpeg_version() {
        Some(version) => info!("  ffmpeg: {}", version),
        None => warn!(
            "ffmpeg not found at {:?}; streaming and recording will fail",
            config.ffmpeg
        ),
    }
    info!("  Recording codecs: {}", capabilities.codec_keys().join(", "));
    let capabilities = Arc::new(capabilities);

    let settings =
        SettingsHandle::load(store, &capabilities).context("Failed to load settings")?;

    let endpoint = Arc::new(endpoint);
    let camera = CameraClient::new(Arc::clone(&endpoint)).context("Failed to build camera client")?;
    let transcoder = Arc::new(Ffmpeg::new(config.ffmpeg.clone(), endpoint));

    let mut recorder = RecorderConfig::new(config.recordings.clone());
    recorder.max_duration = Duration::from_secs(config.max_record_secs);

    let state = AppState::new(camera, transcoder, capabilities, settings, recorder);
    let server = ProxyServer::start_with_ui(
        state,
        SocketAddr::new(config.bind, config.port),
        config.ui_path.clone(),
    )
    .await?;

    run(&server).await;

    let report = server.stop().await;
    if !report.all_exited {
        warn!("Some stream processes did not exit");
    }

    info!("Server stopped");
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nerdcam=info".parse().unwrap()),
        )
        .init();
}

/// Log a status line periodically until SIGINT
async fn run(server: &ProxyServer) {
    let state = server.state();
    let mut stats_interval = interval(Duration::from_secs(60));
    stats_interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            _ = stats_interval.tick() => {
                let source = state.frames.status().await;
                let recording = state.recorder.status();
                info!(
                    "Stats: source {}, {} stream processes, recording {}, patrol {}",
                    if source.running { "running" } else { "idle" },
                    state.processes.len(),
                    if recording.recording { recording.filename.as_str() } else { "off" },
                    if state.patrol.is_running() { "on" } else { "off" },
                );
            }
        }
    }
}
