//! Camera control protocol client
//!
//! Foscam-style cameras expose every control operation as
//! `GET /cgi-bin/CGIProxy.fcgi?cmd=<name>&usr=<user>&pwd=<pass>&...` and answer
//! with a flat XML document:
//!
//! ```xml
//! <CGI_Result>
//!     <result>0</result>
//!     <speed>2</speed>
//! </CGI_Result>
//! ```
//!
//! Each child element maps to one key of a [`CgiResponse`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// Timeout for a single control request
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Path of the camera's CGI endpoint
pub const CGI_PATH: &str = "/cgi-bin/CGIProxy.fcgi";

/// Path of the main RTSP stream
pub const RTSP_PATH: &str = "/videoMain";

/// A string wrapper that redacts its contents in Debug output.
///
/// Serializes/deserializes transparently as a plain string.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedactedString(pub String);

impl RedactedString {
    /// Expose the secret. Only for building outbound requests.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RedactedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"***\"")
    }
}

impl From<&str> for RedactedString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn default_port() -> u16 {
    88
}

/// Where the camera lives and how to log in. Immutable for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraEndpoint {
    #[serde(alias = "ip")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: RedactedString,
}

impl CameraEndpoint {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.into(),
        }
    }

    /// Base URL of the control endpoint (no credentials)
    pub fn control_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, CGI_PATH)
    }

    /// RTSP URL with embedded, percent-encoded credentials.
    ///
    /// Only ever handed to the transcoding process.
    pub fn rtsp_url(&self) -> Result<String> {
        let mut url = Url::parse(&format!("rtsp://{}:{}{}", self.host, self.port, RTSP_PATH))
            .map_err(|e| Error::invalid(format!("camera address {}: {}", self.host, e)))?;
        url.set_username(&self.username)
            .and_then(|_| url.set_password(Some(self.password.expose())))
            .map_err(|_| Error::invalid("camera address cannot carry credentials"))?;
        Ok(url.to_string())
    }
}

/// Parsed camera response: element name → text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CgiResponse(pub BTreeMap<String, String>);

impl CgiResponse {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The `result` field, if present
    pub fn result(&self) -> Option<&str> {
        self.get("result")
    }

    pub fn is_ok(&self) -> bool {
        self.result() == Some("0")
    }

    /// Map the result code onto the error taxonomy.
    pub fn check(self) -> Result<Self> {
        match self.result() {
            Some("0") => Ok(self),
            Some("-2") => Err(Error::BadCredentials),
            Some(code) => Err(Error::CameraResult(code.to_string())),
            None => Err(Error::InvalidResponse("missing result field".into())),
        }
    }
}

/// Parse a flat CGI result document.
pub fn parse_cgi_response(xml: &str) -> Result<CgiResponse> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut fields = BTreeMap::new();
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 1 {
                    saw_root = true;
                } else if depth == 2 {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    fields.insert(name.clone(), String::new());
                    current = Some(name);
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 0 {
                    saw_root = true;
                } else if depth == 1 {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    fields.insert(name, String::new());
                }
            }
            Ok(Event::Text(t)) => {
                if let (2, Some(key)) = (depth, current.as_ref()) {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::InvalidResponse(e.to_string()))?;
                    if let Some(value) = fields.get_mut(key) {
                        value.push_str(&text);
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if let (2, Some(key)) = (depth, current.as_ref()) {
                    if let Some(value) = fields.get_mut(key) {
                        value.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    current = None;
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::InvalidResponse(e.to_string())),
        }
    }

    if !saw_root {
        return Err(Error::InvalidResponse("empty document".into()));
    }
    Ok(CgiResponse(fields))
}

/// Commands that physically move the device. A running patrol must be
/// stopped before one of these is forwarded.
pub fn is_movement_command(cmd: &str) -> bool {
    cmd.starts_with("ptzMove") || cmd == "ptzReset" || cmd == "ptzGotoPresetPoint"
}

/// Parsed command access to the camera.
#[async_trait::async_trait]
pub trait CameraControl: Send + Sync {
    /// Send a command and parse the result document. The result code is not
    /// checked; use [`CgiResponse::check`].
    async fn command(&self, cmd: &str, params: &[(&str, &str)]) -> Result<CgiResponse>;
}

/// HTTP client for the camera's control endpoint.
#[derive(Clone)]
pub struct CameraClient {
    http: reqwest::Client,
    endpoint: Arc<CameraEndpoint>,
}

impl CameraClient {
    pub fn new(endpoint: Arc<CameraEndpoint>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .build()?;
        Ok(Self { http, endpoint })
    }

    /// Send a command and return the raw response body.
    ///
    /// Caller-supplied `cmd`, `usr` and `pwd` keys in `params` are ignored;
    /// credentials always come from the endpoint.
    pub async fn send_raw(&self, cmd: &str, params: &[(&str, &str)]) -> Result<Bytes> {
        let mut query: Vec<(&str, &str)> = Vec::with_capacity(params.len() + 3);
        query.push(("cmd", cmd));
        query.extend(
            params
                .iter()
                .filter(|(k, _)| !matches!(*k, "cmd" | "usr" | "pwd"))
                .copied(),
        );
        query.push(("usr", &self.endpoint.username));
        query.push(("pwd", self.endpoint.password.expose()));

        debug!(cmd, params = params.len(), "Camera command");
        let resp = self
            .http
            .get(self.endpoint.control_url())
            .query(&query)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Upstream(format!("camera answered HTTP {}", status)));
        }
        Ok(resp.bytes().await?)
    }

    /// Fetch a single JPEG from the camera.
    pub async fn snapshot(&self) -> Result<Bytes> {
        self.send_raw("snapPicture2", &[]).await
    }
}

#[async_trait::async_trait]
impl CameraControl for CameraClient {
    async fn command(&self, cmd: &str, params: &[(&str, &str)]) -> Result<CgiResponse> {
        let raw = self.send_raw(cmd, params).await?;
        parse_cgi_response(&String::from_utf8_lossy(&raw))
    }
}
