//! Runtime tunables and their persistence
//!
//! The config file is a JSON object with a `camera` object (the endpoint) and a
//! `settings` object (everything below). Other top-level keys belong to other
//! tools and are preserved when settings are written back.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::camera::CameraEndpoint;
use crate::capabilities::{Capabilities, GPU_AUTO};
use crate::error::{Error, Result};

/// RTSP lower transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }

    /// ffmpeg `-probesize` for this transport
    pub fn probe_size(&self) -> u32 {
        match self {
            Transport::Tcp => 500_000,
            Transport::Udp => 32_768,
        }
    }

    /// ffmpeg `-analyzeduration` (microseconds)
    pub fn analyze_duration(&self) -> u32 {
        match self {
            Transport::Tcp => 500_000,
            Transport::Udp => 0,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(Error::invalid(format!(
                "rtsp_transport must be udp or tcp, got {:?}",
                other
            ))),
        }
    }
}

/// One preset stop in a patrol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatrolPosition {
    /// Camera preset name
    pub name: String,
    /// Seconds to stay, fractions allowed; zero or negative disables the
    /// position
    #[serde(default)]
    pub dwell: f64,
}

impl PatrolPosition {
    pub fn new(name: &str, dwell: f64) -> Self {
        Self {
            name: name.to_string(),
            dwell,
        }
    }

    pub fn is_active(&self) -> bool {
        self.dwell > 0.0
    }

    pub fn dwell_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.dwell).unwrap_or_default()
    }
}

/// Ordered preset positions to cycle through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatrolPlan {
    pub positions: Vec<PatrolPosition>,
    #[serde(default = "default_true")]
    pub repeat: bool,
}

impl Default for PatrolPlan {
    fn default() -> Self {
        Self {
            positions: (1..=4)
                .map(|i| PatrolPosition::new(&format!("pos{}", i), 0.0))
                .collect(),
            repeat: true,
        }
    }
}

impl PatrolPlan {
    pub fn active_positions(&self) -> Vec<PatrolPosition> {
        self.positions.iter().filter(|p| p.is_active()).cloned().collect()
    }
}

fn default_true() -> bool {
    true
}

/// Persisted tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// MJPEG quality, 1..=10 (10 = best)
    pub stream_quality: u8,
    /// Microphone gain applied to audio streams, 1.0..=5.0
    pub mic_gain: f64,
    pub rtsp_transport: Transport,
    /// Recording codec key; empty means "use the host default"
    pub rec_codec: String,
    /// Recording compression, 1..=10 (1 = best quality)
    pub rec_compression: u8,
    /// GPU index or `auto`
    pub rec_gpu: String,
    pub patrol: PatrolPlan,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stream_quality: 7,
            mic_gain: 3.0,
            rtsp_transport: Transport::Tcp,
            rec_codec: String::new(),
            rec_compression: 5,
            rec_gpu: GPU_AUTO.to_string(),
            patrol: PatrolPlan::default(),
        }
    }
}

impl Settings {
    /// Clamp loaded values into range and drop choices this host cannot honor.
    pub fn normalize(&mut self, caps: &Capabilities) {
        self.stream_quality = self.stream_quality.clamp(1, 10);
        self.mic_gain = round_gain(self.mic_gain.clamp(1.0, 5.0));
        self.rec_compression = self.rec_compression.clamp(1, 10);
        if !caps.has_codec(&self.rec_codec) {
            if !self.rec_codec.is_empty() {
                info!(codec = %self.rec_codec, "Saved recording codec unavailable, using default");
            }
            self.rec_codec = caps.default_codec().to_string();
        }
        if !caps.is_valid_gpu(&self.rec_gpu) {
            self.rec_gpu = GPU_AUTO.to_string();
        }
    }

    /// Validate every field of `update`, then apply all of them.
    ///
    /// Nothing is applied when any field is invalid.
    pub fn apply(&mut self, update: &SettingsUpdate, caps: &Capabilities) -> Result<SettingsChanges> {
        let mut next = self.clone();

        if let Some(raw) = &update.mic_gain {
            let gain: f64 = parse_field("mic_gain", raw)?;
            if !(1.0..=5.0).contains(&gain) {
                return Err(Error::invalid("mic_gain must be between 1.0 and 5.0"));
            }
            next.mic_gain = round_gain(gain);
        }
        if let Some(raw) = &update.stream_quality {
            next.stream_quality = parse_level("stream_quality", raw)?;
        }
        if let Some(raw) = &update.rec_codec {
            if !caps.has_codec(raw) {
                return Err(Error::invalid(format!("codec {} is not available", raw)));
            }
            next.rec_codec = raw.clone();
        }
        if let Some(raw) = &update.rec_compression {
            next.rec_compression = parse_level("rec_compression", raw)?;
        }
        if let Some(raw) = &update.rec_gpu {
            if !caps.is_valid_gpu(raw) {
                return Err(Error::invalid(format!("unknown GPU {}", raw)));
            }
            next.rec_gpu = raw.clone();
        }
        if let Some(raw) = &update.rtsp_transport {
            next.rtsp_transport = raw.parse()?;
        }

        let changes = SettingsChanges {
            any: next != *self,
            transport: next.rtsp_transport != self.rtsp_transport,
        };
        *self = next;
        Ok(changes)
    }
}

fn round_gain(gain: f64) -> f64 {
    (gain * 10.0).round() / 10.0
}

fn parse_field<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::invalid(format!("{} is not a valid number: {:?}", name, raw)))
}

fn parse_level(name: &str, raw: &str) -> Result<u8> {
    let value: i64 = parse_field(name, raw)?;
    if !(1..=10).contains(&value) {
        return Err(Error::invalid(format!("{} must be between 1 and 10", name)));
    }
    Ok(value as u8)
}

/// Raw query-string update; every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub mic_gain: Option<String>,
    pub stream_quality: Option<String>,
    pub rec_codec: Option<String>,
    pub rec_compression: Option<String>,
    pub rec_gpu: Option<String>,
    pub rtsp_transport: Option<String>,
}

/// What an applied update touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsChanges {
    pub any: bool,
    pub transport: bool,
}

// ========== Persistence ==========

/// Where settings live between runs.
pub trait SettingsStore: Send + Sync {
    /// Saved settings, `None` when nothing was saved yet
    fn load(&self) -> Result<Option<Settings>>;

    fn save(&self, settings: &Settings) -> Result<()>;
}

/// The `settings` key of the JSON config file
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Map<String, Value>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text)? {
                Value::Object(map) => Ok(map),
                _ => Err(Error::Settings(format!(
                    "{} is not a JSON object",
                    self.path.display()
                ))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// The camera endpoint stored alongside the settings.
    pub fn load_camera(&self) -> Result<CameraEndpoint> {
        let mut doc = self.read_document()?;
        let camera = doc.remove("camera").ok_or_else(|| {
            Error::Settings(format!("{} has no camera section", self.path.display()))
        })?;
        Ok(serde_json::from_value(camera)?)
    }
}

impl SettingsStore for JsonFileStore {
    fn load(&self) -> Result<Option<Settings>> {
        let mut doc = self.read_document()?;
        match doc.remove("settings") {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let mut doc = self.read_document()?;
        doc.insert("settings".to_string(), serde_json::to_value(settings)?);

        // Write-then-rename so a crash never leaves a truncated config
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&Value::Object(doc))?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Settings saved");
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Option<Settings>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<Option<Settings>> {
        Ok(self.saved.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(settings.clone());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}

// ========== Shared handle ==========

/// Current settings plus the store they are persisted to.
pub struct SettingsHandle {
    current: RwLock<Settings>,
    store: Arc<dyn SettingsStore>,
    /// Serializes writers across the blocking save
    writer: tokio::sync::Mutex<()>,
}

impl SettingsHandle {
    /// Load from the store (falling back to defaults) and normalize against
    /// the host's capabilities.
    pub fn load(store: Arc<dyn SettingsStore>, caps: &Capabilities) -> Result<Self> {
        let mut settings = store.load()?.unwrap_or_default();
        settings.normalize(caps);
        Ok(Self {
            current: RwLock::new(settings),
            store,
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `f` on a copy; commit and persist only if it succeeds and changed
    /// something.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Settings) -> Result<R>) -> Result<R> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();
        let mut next = current.clone();
        let out = f(&mut next)?;
        if next != current {
            let store = Arc::clone(&self.store);
            let saved = next.clone();
            tokio::task::spawn_blocking(move || store.save(&saved))
                .await
                .map_err(|e| Error::Settings(format!("save task failed: {}", e)))??;
            *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        }
        Ok(out)
    }

    pub async fn apply(&self, update: &SettingsUpdate, caps: &Capabilities) -> Result<SettingsChanges> {
        let changes = self.update(|s| s.apply(update, caps)).await?;
        if changes.any {
            info!(?update, "Settings updated");
        }
        Ok(changes)
    }
}
