//! Error taxonomy shared by every component.
//!
//! Background loops log these; the web layer converts them into JSON error
//! responses (see [`crate::web`]).

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Camera or media source could not be reached.
    #[error("camera unreachable: {0}")]
    Upstream(String),

    /// Camera answered with result code -2.
    #[error("camera rejected credentials")]
    BadCredentials,

    /// Camera answered with any other non-zero result code.
    #[error("camera returned result code {0}")]
    CameraResult(String),

    /// Camera answered with something that is not a CGI result document.
    #[error("invalid camera response: {0}")]
    InvalidResponse(String),

    /// A transcode process failed to spawn or exited on its own.
    #[error("{task} failed (exit code {code:?}): {diagnostics}")]
    ProcessFailed {
        task: String,
        code: Option<i32>,
        diagnostics: String,
    },

    /// Malformed caller input. Never forwarded upstream.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Start requested while running, or stop while idle.
    #[error("{0}")]
    Conflict(String),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }
}

// The request URL carries the camera password in its query string.
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Upstream(e.without_url().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Settings(e.to_string())
    }
}
