//! Error taxonomy and HTTP error responses for the agent

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading the agent configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Errors reading the project list maintained by the project tool
#[derive(Debug, Error)]
pub enum ProjectListError {
    #[error("Failed to read project list '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse project list '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors from the project state registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to open registry at '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Registry query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Unknown project status '{0}' in registry")]
    UnknownStatus(String),

    #[error("Registry is closed")]
    Closed,
}

/// Failures of the external project tool. Never fatal, always surfaced as a
/// failed operation.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' exited with {}: {stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Unexpected output from '{command}': {message}")]
    Output { command: String, message: String },
}

/// Error codes for front door errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentErrorCode {
    /// A required query parameter is missing
    MissingParameter,
    /// No project with that name or hostname
    UnknownProject,
    /// Method not supported on this route
    MethodNotAllowed,
    /// Internal agent error
    InternalError,
}

impl AgentErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentErrorCode::MissingParameter => StatusCode::BAD_REQUEST,
            AgentErrorCode::UnknownProject => StatusCode::NOT_FOUND,
            AgentErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AgentErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Trafic-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            AgentErrorCode::MissingParameter => "MISSING_PARAMETER",
            AgentErrorCode::UnknownProject => "UNKNOWN_PROJECT",
            AgentErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            AgentErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: AgentErrorCode,
    /// Human-readable error message
    pub error: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: AgentErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","error":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.error.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Trafic-Error header
pub fn json_error_response(code: AgentErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Trafic-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

/// Plain-text 500 used when a handler fails or panics
pub fn internal_error_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header("Content-Type", "text/plain")
        .header("X-Trafic-Error", AgentErrorCode::InternalError.as_header_value())
        .body(Full::new(Bytes::from_static(b"Internal Server Error")))
        .expect("valid response with StatusCode enum and static headers")
}
