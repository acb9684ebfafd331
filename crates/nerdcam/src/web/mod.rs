//! Proxy HTTP server: axum routes for camera control and local streaming.
//!
//! - `GET /api/cam` — camera command relay (credentials attached here)
//! - `GET /api/snap` — single JPEG
//! - `GET /api/mjpeg` — shared MJPEG stream
//! - `GET /api/audio`, `/api/fmp4`, `/api/stream` — per-client ffmpeg streams
//! - `GET /api/settings`, `/api/record`, `/api/patrol`, `/api/status`
//! - anything else — static files from the optional viewer directory
//!
//! Every per-client process is tracked in a [`ProcessRegistry`] so `stop`
//! can terminate all of them.

pub mod registry;
mod routes;
mod stream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::camera::CameraClient;
use crate::capabilities::Capabilities;
use crate::error::Error;
use crate::patrol::PatrolController;
use crate::recorder::{Recorder, RecorderConfig};
use crate::settings::SettingsHandle;
use crate::source::FrameSource;
use crate::transcode::Transcoder;

pub use registry::{ProcessRegistry, RegisteredProcess};

/// How long `stop` waits for the listener and stream tasks
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Everything the handlers need, shared as `Arc<AppState>`.
pub struct AppState {
    pub camera: CameraClient,
    pub transcoder: Arc<dyn Transcoder>,
    pub capabilities: Arc<Capabilities>,
    pub settings: SettingsHandle,
    pub frames: FrameSource,
    pub recorder: Recorder,
    pub patrol: PatrolController,
    pub processes: ProcessRegistry,
    /// Cancelled first on shutdown; every streaming loop selects on it
    pub shutdown: CancellationToken,
    tasks: TaskTracker,
    start_time: Instant,
}

impl AppState {
    pub fn new(
        camera: CameraClient,
        transcoder: Arc<dyn Transcoder>,
        capabilities: Arc<Capabilities>,
        settings: SettingsHandle,
        recorder: RecorderConfig,
    ) -> Arc<Self> {
        Self::with_frame_source(
            camera,
            Arc::clone(&transcoder),
            capabilities,
            settings,
            recorder,
            FrameSource::new(transcoder),
        )
    }

    /// Like [`AppState::new`] with a preconfigured frame source.
    pub fn with_frame_source(
        camera: CameraClient,
        transcoder: Arc<dyn Transcoder>,
        capabilities: Arc<Capabilities>,
        settings: SettingsHandle,
        recorder: RecorderConfig,
        frames: FrameSource,
    ) -> Arc<Self> {
        Arc::new(Self {
            patrol: PatrolController::new(Arc::new(camera.clone())),
            recorder: Recorder::new(Arc::clone(&transcoder), Arc::clone(&capabilities), recorder),
            camera,
            transcoder,
            capabilities,
            settings,
            frames,
            processes: ProcessRegistry::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            start_time: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Outcome of [`ProxyServer::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Per-client processes that were terminated
    pub terminated: usize,
    /// Whether every one of them is confirmed gone
    pub all_exited: bool,
}

/// A running proxy listener
pub struct ProxyServer {
    state: Arc<AppState>,
    local_addr: SocketAddr,
    serve: JoinHandle<()>,
}

impl ProxyServer {
    /// Bind and start serving the API in the background.
    pub async fn start(state: Arc<AppState>, bind: SocketAddr) -> anyhow::Result<Self> {
        Self::start_with_ui(state, bind, None).await
    }

    /// Like [`ProxyServer::start`], also serving the web viewer from
    /// `ui_path` for every non-API path.
    pub async fn start_with_ui(
        state: Arc<AppState>,
        bind: SocketAddr,
        ui_path: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .context(format!("Failed to bind to {}", bind))?;
        let local_addr = listener.local_addr().context("Failed to read bound address")?;

        let app = routes::router(Arc::clone(&state), ui_path.as_deref());
        let shutdown = state.shutdown.clone();
        let serve = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(error = %e, "Proxy server error");
            }
        });

        info!("Proxy server listening on http://{}", local_addr);
        Ok(Self {
            state,
            local_addr,
            serve,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Stop everything the server owns: streaming loops, the patrol, the
    /// active recording, the shared source, every per-client process, then
    /// the listener.
    pub async fn stop(self) -> ShutdownReport {
        info!("Stopping proxy server");
        // Cancelled pumps unregister their own processes on the way out, so
        // remember what was live before the flag goes up.
        let mut processes = self.state.processes.active();
        self.state.shutdown.cancel();

        // Patrol first so it cannot move the camera mid-shutdown; the
        // recording finalizes before the shared source goes away.
        self.state.patrol.shutdown().await;
        self.state.recorder.cleanup().await;
        self.state.frames.stop().await;
        for process in self.state.processes.drain() {
            if !processes.iter().any(|p| p.id() == process.id()) {
                processes.push(process);
            }
        }
        let report = registry::terminate(processes).await;

        let mut serve = self.serve;
        if tokio::time::timeout(SHUTDOWN_WAIT, &mut serve).await.is_err() {
            warn!("Listener did not drain in time, aborting");
            serve.abort();
        }

        self.state.tasks.close();
        if tokio::time::timeout(SHUTDOWN_WAIT, self.state.tasks.wait())
            .await
            .is_err()
        {
            warn!("Stream tasks did not finish in time");
        }

        info!(
            terminated = report.terminated,
            all_exited = report.all_exited,
            "Proxy server stopped"
        );
        report
    }
}

// ========== Error responses ==========

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Upstream(_)
            | Error::BadCredentials
            | Error::CameraResult(_)
            | Error::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::ProcessFailed { .. } | Error::Settings(_) | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}
