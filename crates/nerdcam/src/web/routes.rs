//! Control and JSON endpoints

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use super::{stream, AppState};
use crate::camera::{is_movement_command, parse_cgi_response, CgiResponse};
use crate::error::{Error, Result};
use crate::recorder::RecordingRequest;
use crate::settings::{PatrolPosition, SettingsUpdate};

pub(super) fn router(state: Arc<AppState>, ui_path: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/api/cam", get(api_cam))
        .route("/api/snap", get(api_snap))
        .route("/api/mjpeg", get(stream::mjpeg))
        .route("/api/audio", get(stream::audio))
        .route("/api/fmp4", get(stream::fmp4))
        .route("/api/stream", get(stream::mpegts))
        .route("/api/settings", get(api_settings))
        .route("/api/record", get(api_record))
        .route("/api/patrol", get(api_patrol))
        .route("/api/status", get(api_status))
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Everything outside /api comes from the viewer directory
    if let Some(path) = ui_path {
        if path.exists() {
            info!("Serving viewer from {:?}", path);
            app = app.fallback_service(
                ServeDir::new(path).fallback(
                    ServeDir::new(path).append_index_html_on_directories(true),
                ),
            );
        } else {
            warn!("Viewer path {:?} does not exist, skipping static file serving", path);
        }
    }
    app
}

#[derive(Debug, Deserialize)]
struct ActionQuery {
    action: Option<String>,
    positions: Option<String>,
    repeat: Option<String>,
}

/// GET /api/cam?cmd=X&... — forward a command with credentials attached
async fn api_cam(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response> {
    let cmd = params
        .iter()
        .find(|(k, _)| k == "cmd")
        .map(|(_, v)| v.clone())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::invalid("missing cmd parameter"))?;

    if is_movement_command(&cmd) && state.patrol.stop() {
        info!(cmd = %cmd, "Patrol stopped for manual move");
    }

    let extra: Vec<(&str, &str)> = params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .filter(|(k, _)| !matches!(*k, "cmd" | "usr" | "pwd"))
        .collect();

    let body = state.camera.send_raw(&cmd, &extra).await.map_err(|e| {
        error!(cmd = %cmd, error = %e, "Camera command failed");
        e
    })?;

    match parse_cgi_response(&String::from_utf8_lossy(&body)).map(CgiResponse::check) {
        Ok(Err(Error::BadCredentials)) => warn!(cmd = %cmd, "Camera rejected credentials"),
        Ok(Err(e)) => warn!(cmd = %cmd, error = %e, "Camera command returned failure"),
        Ok(Ok(_)) if cmd.starts_with("ptz") => info!(cmd = %cmd, "PTZ command ok"),
        _ => {}
    }

    Ok((
        [(CONTENT_TYPE, "text/xml"), (CACHE_CONTROL, "no-cache")],
        body,
    )
        .into_response())
}

/// GET /api/snap — one JPEG straight from the camera
async fn api_snap(State(state): State<Arc<AppState>>) -> Result<Response> {
    let body = state.camera.snapshot().await?;
    if !body.starts_with(&[0xFF, 0xD8]) {
        // The camera answers with a CGI document when it refuses
        parse_cgi_response(&String::from_utf8_lossy(&body))?.check()?;
        return Err(Error::InvalidResponse("snapshot is not a JPEG".into()));
    }
    Ok((
        [(CONTENT_TYPE, "image/jpeg"), (CACHE_CONTROL, "no-cache")],
        body,
    )
        .into_response())
}

/// GET /api/settings?... — validate, apply, persist, echo
async fn api_settings(
    State(state): State<Arc<AppState>>,
    Query(update): Query<SettingsUpdate>,
) -> Result<Json<Value>> {
    let changes = state.settings.apply(&update, &state.capabilities).await?;
    if changes.transport {
        state.frames.stop().await;
        info!("RTSP transport changed, MJPEG source will restart on next request");
    }
    Ok(Json(settings_body(&state)))
}

fn settings_body(state: &AppState) -> Value {
    let s = state.settings.snapshot();
    let codecs: Map<String, Value> = state
        .capabilities
        .codecs()
        .iter()
        .map(|c| (c.key.to_string(), json!({ "desc": c.description })))
        .collect();
    json!({
        "mic_gain": s.mic_gain,
        "stream_quality": s.stream_quality,
        "rec_codec": s.rec_codec,
        "rec_compression": s.rec_compression,
        "rec_gpu": s.rec_gpu,
        "rtsp_transport": s.rtsp_transport,
        "rec_codecs": codecs,
        "gpus": state.capabilities.gpus(),
    })
}

/// GET /api/record?action=start|stop|status
async fn api_record(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActionQuery>,
) -> Result<Json<Value>> {
    match query.action.as_deref().unwrap_or("status") {
        "start" => {
            let s = state.settings.snapshot();
            let request = RecordingRequest {
                transport: s.rtsp_transport,
                codec: s.rec_codec,
                compression: s.rec_compression,
                gpu: s.rec_gpu,
            };
            let status = state.recorder.start(&request).await?;
            Ok(Json(serde_json::to_value(status)?))
        }
        "stop" => {
            let finished = state.recorder.stop().await?;
            let mut body = serde_json::to_value(state.recorder.status())?;
            body["stopped"] = json!(finished.filename);
            body["duration"] = json!(finished.elapsed.as_secs());
            Ok(Json(body))
        }
        "status" => Ok(Json(serde_json::to_value(state.recorder.status())?)),
        other => Err(Error::invalid(format!("unknown action {}", other))),
    }
}

/// GET /api/patrol?action=start|stop|config|status
async fn api_patrol(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActionQuery>,
) -> Result<Json<Value>> {
    let action = query.action.as_deref().unwrap_or("status");
    let mut extra = Map::new();

    match action {
        "start" => {
            let plan = state.settings.snapshot().patrol;
            state.patrol.start(&plan)?;
            extra.insert("ok".into(), json!(true));
        }
        "stop" => {
            if !state.patrol.stop() {
                return Err(Error::conflict("Patrol not running"));
            }
            extra.insert("ok".into(), json!(true));
        }
        "config" => {
            let positions = query
                .positions
                .as_deref()
                .map(|raw| serde_json::from_str::<Vec<PatrolPosition>>(raw))
                .transpose()
                .map_err(|e| Error::invalid(format!("positions: {}", e)))?;
            let repeat = match query.repeat.as_deref() {
                None => None,
                Some("true") => Some(true),
                Some("false") => Some(false),
                Some(other) => return Err(Error::invalid(format!("repeat must be true or false, got {}", other))),
            };
            let plan = state.settings.update(|s| {
                if let Some(positions) = positions {
                    s.patrol.positions = positions;
                }
                if let Some(repeat) = repeat {
                    s.patrol.repeat = repeat;
                }
                Ok(s.patrol.clone())
            })
            .await?;
            extra.insert("config".into(), serde_json::to_value(plan)?);
        }
        "status" => {}
        other => return Err(Error::invalid(format!("unknown action {}", other))),
    }

    let mut body = match serde_json::to_value(state.patrol.status())? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    body.extend(extra);
    Ok(Json(Value::Object(body)))
}

/// GET /api/status — server status
async fn api_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let source = state.frames.status().await;
    let recording = state.recorder.status();
    let patrol = state.patrol.status();

    Ok(Json(json!({
        "uptime_secs": state.uptime().as_secs(),
        "shutting_down": state.is_shutting_down(),
        "stream_processes": state.processes.len(),
        "source_running": source.running,
        "source_quality": source.quality,
        "source_transport": source.transport,
        "source_sequence": source.sequence,
        "source_launches": source.launches,
        "source_frame_age_ms": source.last_frame_age_ms,
        "recording": recording.recording,
        "recording_file": recording.filename,
        "recording_elapsed": recording.elapsed,
        "patrol_running": patrol.running,
        "patrol_position": patrol.current_pos,
        "patrol_cycle": patrol.cycle,
    })))
}
