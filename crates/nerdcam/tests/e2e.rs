//! End-to-end tests for the proxy server
//!
//! A fake camera (axum) answers the CGI protocol and shell scripts stand in
//! for ffmpeg, so the whole HTTP surface runs without hardware:
//!
//! - client → proxy → fake camera (control relay, snapshots)
//! - scripted transcodes → proxy → client (MJPEG, per-client streams)
//! - settings, recording and patrol endpoints
//!
//! Run: `cargo test -p nerdcam --test e2e`

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use nerdcam::recorder::RecorderConfig;
use nerdcam::transcode::{TranscodeCommand, TranscodeTask, Transcoder};
use nerdcam::{
    AppState, CameraClient, CameraEndpoint, Capabilities, MemoryStore, ProxyServer, SettingsHandle,
    SettingsStore,
};

const USERNAME: &str = "admin";
const PASSWORD: &str = "s3cret";
const JPEG: &[u8] = &[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];

// ── Fake camera ──────────────────────────────────────────────────────

#[derive(Default)]
struct FakeCamera {
    requests: Mutex<Vec<HashMap<String, String>>>,
}

impl FakeCamera {
    fn commands(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|q| q.get("cmd").cloned())
            .collect()
    }

    fn last_request(&self) -> HashMap<String, String> {
        self.requests.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

async fn fake_cgi(
    State(camera): State<Arc<FakeCamera>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    camera.requests.lock().unwrap().push(query.clone());

    let authorized = query.get("usr").map(String::as_str) == Some(USERNAME)
        && query.get("pwd").map(String::as_str) == Some(PASSWORD);
    if !authorized {
        return "<CGI_Result><result>-2</result></CGI_Result>".into_response();
    }

    match query.get("cmd").map(String::as_str) {
        Some("snapPicture2") => ([(CONTENT_TYPE, "image/jpeg")], JPEG).into_response(),
        Some("getDevInfo") => {
            "<CGI_Result><result>0</result><devName>nerdcam</devName></CGI_Result>".into_response()
        }
        _ => "<CGI_Result><result>0</result></CGI_Result>".into_response(),
    }
}

async fn start_fake_camera() -> (Arc<FakeCamera>, SocketAddr) {
    let camera = Arc::new(FakeCamera::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = axum::Router::new()
        .route("/cgi-bin/CGIProxy.fcgi", axum::routing::get(fake_cgi))
        .with_state(Arc::clone(&camera));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (camera, addr)
}

// ── Scripted ffmpeg ──────────────────────────────────────────────────

struct ScriptedFfmpeg;

impl Transcoder for ScriptedFfmpeg {
    fn command(&self, task: &TranscodeTask) -> nerdcam::Result<TranscodeCommand> {
        let script = match task {
            TranscodeTask::Mjpeg { .. } => {
                "while :; do printf '\\377\\330frame\\377\\331'; sleep 0.05; done"
            }
            TranscodeTask::Recording { .. } => "read -r _line; exit 0",
            _ => "while :; do printf 'chunk'; sleep 0.05; done",
        };
        Ok(TranscodeCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            sink: task.sink(),
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    server: ProxyServer,
    camera: Arc<FakeCamera>,
    store: Arc<MemoryStore>,
    client: reqwest::Client,
    base: String,
    _recordings: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with_ui(None).await
    }

    async fn start_with_ui(ui_path: Option<PathBuf>) -> Self {
        let (camera, camera_addr) = start_fake_camera().await;
        let endpoint = Arc::new(CameraEndpoint::new(
            "127.0.0.1",
            camera_addr.port(),
            USERNAME,
            PASSWORD,
        ));

        let capabilities = Arc::new(Capabilities::from_listing(" V....D libx264  H.264\n", ""));
        let store = Arc::new(MemoryStore::new());
        let settings = SettingsHandle::load(store.clone(), &capabilities).unwrap();

        let recordings = tempfile::tempdir().unwrap();
        let mut recorder = RecorderConfig::new(recordings.path());
        recorder.startup_grace = Duration::from_millis(200);
        recorder.stop_grace = Duration::from_secs(2);

        let state = AppState::new(
            CameraClient::new(endpoint).unwrap(),
            Arc::new(ScriptedFfmpeg),
            capabilities,
            settings,
            recorder,
        );
        let server = ProxyServer::start_with_ui(state, "127.0.0.1:0".parse().unwrap(), ui_path)
            .await
            .unwrap();
        let base = format!("http://{}", server.local_addr());

        Self {
            server,
            camera,
            store,
            client: reqwest::Client::new(),
            base,
            _recordings: recordings,
        }
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
    }

    async fn json(&self, path: &str) -> (u16, Value) {
        let resp = self.get(path).await;
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}

/// Read a streaming body until `needle` appears `count` times.
async fn read_until(resp: &mut reqwest::Response, needle: &[u8], count: usize) -> Vec<u8> {
    let mut body = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let seen = body.windows(needle.len()).filter(|w| *w == needle).count();
            if seen >= count {
                break;
            }
            match resp.chunk().await.unwrap() {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => break,
            }
        }
    })
    .await
    .expect("stream produced data in time");
    body
}

// ── Control relay ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn cam_relay_attaches_stored_credentials() {
    let h = Harness::start().await;

    let resp = h.get("/api/cam?cmd=getDevInfo&usr=intruder&pwd=guess").await;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()[CONTENT_TYPE.as_str()], "text/xml");
    let body = resp.text().await.unwrap();
    assert!(body.contains("<devName>nerdcam</devName>"));

    let seen = h.camera.last_request();
    assert_eq!(seen.get("usr").map(String::as_str), Some(USERNAME));
    assert_eq!(seen.get("pwd").map(String::as_str), Some(PASSWORD));

    h.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cam_without_command_is_rejected_locally() {
    let h = Harness::start().await;

    let (status, body) = h.json("/api/cam?speed=2").await;
    assert_eq!(status, 400);
    assert_eq!(body["status"], 400);
    assert!(body["error"].as_str().unwrap().contains("cmd"));
    assert!(h.camera.commands().is_empty(), "nothing forwarded");

    h.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_is_relayed_as_jpeg() {
    let h = Harness::start().await;

    let resp = h.get("/api/snap").await;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()[CONTENT_TYPE.as_str()], "image/jpeg");
    assert_eq!(resp.headers()["cache-control"], "no-cache");
    assert_eq!(&resp.bytes().await.unwrap()[..], JPEG);

    h.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_camera_is_bad_gateway() {
    let endpoint = Arc::new(CameraEndpoint::new("127.0.0.1", 1, USERNAME, PASSWORD));
    let capabilities = Arc::new(Capabilities::default());
    let settings = SettingsHandle::load(Arc::new(MemoryStore::new()), &capabilities).unwrap();
    let recordings = tempfile::tempdir().unwrap();
    let state = AppState::new(
        CameraClient::new(endpoint).unwrap(),
        Arc::new(ScriptedFfmpeg),
        capabilities,
        settings,
        RecorderConfig::new(recordings.path()),
    );
    let server = ProxyServer::start(state, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let resp = reqwest::get(format!("http://{}/api/cam?cmd=getDevInfo", server.local_addr()))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 502);
    let body: Value = resp.json().await.unwrap();
    assert!(!body["error"].as_str().unwrap().contains(PASSWORD));

    server.stop().await;
}

// ── Settings ─────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn settings_round_trip() {
    let h = Harness::start().await;

    let (status, body) = h
        .json("/api/settings?mic_gain=2.3&rec_compression=8&rtsp_transport=udp")
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["mic_gain"], 2.3);
    assert_eq!(body["rec_compression"], 8);
    assert_eq!(body["rtsp_transport"], "udp");
    assert_eq!(body["rec_codec"], "sw_h264");
    assert!(body["rec_codecs"]["original"]["desc"].is_string());
    assert_eq!(h.store.save_count(), 1);

    let (_, again) = h.json("/api/settings").await;
    assert_eq!(again, body);
    assert_eq!(h.store.save_count(), 1, "reading does not persist");

    let saved = h.store.load().unwrap().unwrap();
    assert_eq!(saved.rec_compression, 8);
    assert_eq!(saved.mic_gain, 2.3);

    let (status, _) = h.json("/api/settings?rec_codec=nvenc_av1").await;
    assert_eq!(status, 400);
    let (_, unchanged) = h.json("/api/settings").await;
    assert_eq!(unchanged, body);

    h.server.stop().await;
}

// ── Streaming ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn mjpeg_stream_delivers_multipart_frames() {
    let h = Harness::start().await;

    let mut resp = h.get("/api/mjpeg").await;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers()[CONTENT_TYPE.as_str()],
        "multipart/x-mixed-replace; boundary=frame"
    );

    let body = read_until(&mut resp, b"--frame\r\n", 2).await;
    assert!(body.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));

    // A second viewer shares the same process
    let mut second = h.get("/api/mjpeg").await;
    read_until(&mut second, b"--frame\r\n", 1).await;
    let (_, status) = h.json("/api/status").await;
    assert_eq!(status["source_launches"], 1);
    assert_eq!(status["source_running"], true);

    h.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_terminates_every_stream_process() {
    let h = Harness::start().await;

    let mut audio = h.get("/api/audio").await;
    assert_eq!(audio.headers()[CONTENT_TYPE.as_str()], "audio/mpeg");
    read_until(&mut audio, b"chunk", 1).await;

    let mut ts = h.get("/api/stream").await;
    assert_eq!(ts.headers()[CONTENT_TYPE.as_str()], "video/mp2t");
    read_until(&mut ts, b"chunk", 1).await;

    let mut mjpeg = h.get("/api/mjpeg").await;
    read_until(&mut mjpeg, b"--frame", 1).await;

    let state = Arc::clone(h.server.state());
    let processes = state.processes.active();
    assert_eq!(processes.len(), 2);

    let report = h.server.stop().await;
    assert_eq!(report.terminated, 2);
    assert!(report.all_exited);
    assert!(processes.iter().all(|p| !p.is_running()));
    assert!(state.processes.is_empty());
    assert!(!state.frames.status().await.running);
}

#[tokio::test(flavor = "multi_thread")]
async fn client_disconnect_kills_its_process() {
    let h = Harness::start().await;

    let mut fmp4 = h.get("/api/fmp4").await;
    assert_eq!(fmp4.headers()[CONTENT_TYPE.as_str()], "video/mp4");
    read_until(&mut fmp4, b"chunk", 1).await;

    let state = Arc::clone(h.server.state());
    let process = state.processes.active().pop().unwrap();
    drop(fmp4);

    tokio::time::timeout(Duration::from_secs(5), process.wait())
        .await
        .expect("process ends after client leaves");
    assert!(state.processes.is_empty());

    h.server.stop().await;
}

// ── Recording ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn recording_start_conflict_and_stop() {
    let h = Harness::start().await;

    let (status, body) = h.json("/api/record?action=start").await;
    assert_eq!(status, 200);
    assert_eq!(body["recording"], true);
    let filename = body["filename"].as_str().unwrap().to_string();
    assert!(filename.starts_with("nerdcam_") && filename.ends_with(".mp4"));

    let (status, body) = h.json("/api/record?action=start").await;
    assert_eq!(status, 409);
    assert_eq!(body["status"], 409);

    let (_, body) = h.json("/api/record").await;
    assert_eq!(body["recording"], true);

    let (status, body) = h.json("/api/record?action=stop").await;
    assert_eq!(status, 200);
    assert_eq!(body["recording"], false);
    assert_eq!(body["stopped"], filename.as_str());

    let (status, _) = h.json("/api/record?action=stop").await;
    assert_eq!(status, 409);

    h.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_record_start_does_not_wedge_the_recorder() {
    let h = Harness::start().await;

    // Gives up well inside the 200 ms startup grace
    let impatient = reqwest::Client::builder()
        .timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let abandoned = impatient
        .get(format!("{}/api/record?action=start", h.base))
        .send()
        .await;
    assert!(abandoned.is_err());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (status, body) = h.json("/api/record?action=start").await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["recording"], true);

    let (status, _) = h.json("/api/record?action=stop").await;
    assert_eq!(status, 200);

    h.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn server_stop_finalizes_recording_and_patrol() {
    let h = Harness::start().await;

    let positions = r#"[{"name":"A","dwell":30},{"name":"B","dwell":30}]"#;
    h.client
        .get(format!("{}/api/patrol", h.base))
        .query(&[("action", "config"), ("positions", positions)])
        .send()
        .await
        .unwrap();
    let (status, _) = h.json("/api/patrol?action=start").await;
    assert_eq!(status, 200);
    let (status, _) = h.json("/api/record?action=start").await;
    assert_eq!(status, 200);

    let state = Arc::clone(h.server.state());
    assert!(state.recorder.status().recording);

    h.server.stop().await;
    assert!(!state.recorder.status().recording);
    assert!(!state.patrol.is_running());
}

// ── Patrol ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn patrol_config_start_and_manual_override() {
    let h = Harness::start().await;

    let (status, _) = h.json("/api/patrol?action=start").await;
    assert_eq!(status, 400, "default plan has no active positions");

    let positions = r#"[{"name":"A","dwell":30},{"name":"B","dwell":30},{"name":"C","dwell":0}]"#;
    let resp = h
        .client
        .get(format!("{}/api/patrol", h.base))
        .query(&[("action", "config"), ("positions", positions), ("repeat", "true")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["config"]["positions"][1]["name"], "B");
    assert_eq!(body["running"], false);

    let (status, body) = h.json("/api/patrol?action=start").await;
    assert_eq!(status, 200);
    assert_eq!(body["ok"], true);
    assert_eq!(body["running"], true);

    let (status, _) = h.json("/api/patrol?action=start").await;
    assert_eq!(status, 409);

    // Manual move takes over from the patrol
    let resp = h.get("/api/cam?cmd=ptzMoveUp").await;
    assert_eq!(resp.status().as_u16(), 200);
    let (_, body) = h.json("/api/patrol").await;
    assert_eq!(body["running"], false);
    assert!(h.camera.commands().contains(&"ptzMoveUp".to_string()));

    let (status, _) = h.json("/api/patrol?action=stop").await;
    assert_eq!(status, 409);

    h.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn patrol_config_rejects_malformed_positions() {
    let h = Harness::start().await;

    let (status, body) = h.json("/api/patrol?action=config&positions=not-json").await;
    assert_eq!(status, 400);
    assert_eq!(body["status"], 400);

    h.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn patrol_config_accepts_fractional_dwell() {
    let h = Harness::start().await;

    let positions = r#"[{"name":"A","dwell":2.5},{"name":"B","dwell":0.5}]"#;
    let resp = h
        .client
        .get(format!("{}/api/patrol", h.base))
        .query(&[("action", "config"), ("positions", positions)])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["config"]["positions"][0]["dwell"], 2.5);

    let saved = h.store.load().unwrap().unwrap();
    assert_eq!(saved.patrol.positions[1].dwell, 0.5);
    assert_eq!(saved.patrol.active_positions().len(), 2);

    h.server.stop().await;
}

// ── Viewer ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn viewer_files_are_served_beside_the_api() {
    let ui = tempfile::tempdir().unwrap();
    std::fs::write(ui.path().join("index.html"), "<h1>nerdcam</h1>").unwrap();
    std::fs::write(ui.path().join("app.js"), "start();").unwrap();
    let h = Harness::start_with_ui(Some(ui.path().to_path_buf())).await;

    let resp = h.get("/").await;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "<h1>nerdcam</h1>");

    let resp = h.get("/app.js").await;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "start();");

    assert_eq!(h.get("/missing.css").await.status().as_u16(), 404);
    let (status, _) = h.json("/api/status").await;
    assert_eq!(status, 200);

    h.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn without_viewer_only_the_api_is_served() {
    let h = Harness::start().await;
    assert_eq!(h.get("/").await.status().as_u16(), 404);
    h.server.stop().await;
}
