//! # Error Handling
//!
//! Error taxonomy for the streaming core and the control API.
//!
//! ## Error Categories:
//! - **Initialization**: a device or the channel could not be acquired. Fatal to the
//!   current session; partial resources are released before this is returned.
//! - **Decode**: a malformed wire payload. Normally absorbed (counted and logged) so the
//!   render path keeps running; only surfaced when a caller asks for strict decoding.
//! - **Device**: the output or input device failed mid-session. Triggers full teardown.
//! - **Channel**: the transport failed or closed. Triggers teardown of capture and render.
//! - **UnsupportedContentType**: inbound audio that is not linear PCM at the playback rate.
//! - **InvalidState**: a command that the session state machine does not accept right now.
//!
//! Underflow is not an error. It is an expected transient state and only shows up as a
//! counter (see [`crate::audio::stats::StreamStats`]).
//!
//! ## HTTP mapping:
//! Every variant maps to a status code and a JSON body through [`ResponseError`], so
//! control handlers can simply return `AppResult<HttpResponse>`.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors produced by the streaming core and the control API.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Device or channel acquisition failed
    Initialization(String),

    /// Wire payload could not be decoded
    Decode(String),

    /// Audio device failure after the stream was running
    Device(String),

    /// Transport failure or the channel is gone
    Channel(String),

    /// Inbound audio with a content type the core cannot play
    UnsupportedContentType(String),

    /// Command not valid in the current session state
    InvalidState(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found (e.g. no active session)
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Anything else
    Internal(String),
}

impl AppError {
    /// Errors after which the session must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Initialization(_) | AppError::Device(_) | AppError::Channel(_)
        )
    }

    /// Machine-readable error type used in JSON bodies and wire `error` frames.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Initialization(_) => "initialization_error",
            AppError::Decode(_) => "decode_error",
            AppError::Device(_) => "device_error",
            AppError::Channel(_) => "channel_error",
            AppError::UnsupportedContentType(_) => "unsupported_content_type",
            AppError::InvalidState(_) => "invalid_state",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Initialization(msg)
            | AppError::Decode(msg)
            | AppError::Device(msg)
            | AppError::Channel(msg)
            | AppError::UnsupportedContentType(msg)
            | AppError::InvalidState(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::Internal(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Initialization(msg) => write!(f, "Initialization error: {}", msg),
            AppError::Decode(msg) => write!(f, "Decode error: {}", msg),
            AppError::Device(msg) => write!(f, "Device error: {}", msg),
            AppError::Channel(msg) => write!(f, "Channel error: {}", msg),
            AppError::UnsupportedContentType(msg) => write!(f, "Unsupported content type: {}", msg),
            AppError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into JSON responses for the control API.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "invalid_state",
///     "message": "Cannot start recording while processing",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::ValidationError(_) | AppError::Decode(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::UnsupportedContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Initialization(_) | AppError::Device(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Channel(_) => StatusCode::BAD_GATEWAY,
            AppError::ConfigError(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors almost always come from the client, so they map to BadRequest.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
