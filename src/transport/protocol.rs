//! # Wire Protocol
//!
//! JSON text frames exchanged with the conversational-audio service. Every message
//! carries a `type` tag; audio payloads are base64 16-bit PCM produced by the
//! [`crate::audio::SampleCodec`].
//!
//! ## Service → client:
//! - `audio`: synthesized speech, `is_final` marks the end of a response
//! - `text`: transcript or reply text, `is_final` marks the end of a response
//! - `status`, `tool`, `error`, `ping`
//!
//! ## Client → service:
//! - `audio`: one captured quantum
//! - `audio_end`: the user stopped talking
//! - `interrupt`: barge-in, discard the response in progress
//! - `session_end`, `pong`

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Content type sent with captured audio.
pub const PCM_CONTENT_TYPE: &str = "audio/pcm";

const LINEAR_PCM_TYPES: [&str; 3] = ["audio/pcm", "audio/l16", "audio/raw"];

/// Messages received from the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Audio {
        data: String,
        content_type: String,
        #[serde(default)]
        is_final: bool,
    },

    Text {
        text: String,
        #[serde(default)]
        is_final: bool,
    },

    Status {
        status: String,
        message: Option<String>,
    },

    /// A tool invocation the service performed; surfaced to observers only
    Tool {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },

    Error {
        code: String,
        message: String,
    },

    Ping {
        timestamp: u64,
    },
}

impl ServerMessage {
    /// Whether this message ends the response the session is waiting for.
    pub fn completes_response(&self) -> bool {
        matches!(
            self,
            ServerMessage::Audio { is_final: true, .. } | ServerMessage::Text { is_final: true, .. }
        )
    }
}

/// Messages sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Audio { data: String, content_type: String },
    AudioEnd,
    Interrupt,
    SessionEnd,
    Pong { timestamp: u64 },
}

impl ClientMessage {
    pub fn audio(data: String) -> Self {
        ClientMessage::Audio {
            data,
            content_type: PCM_CONTENT_TYPE.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Audio { .. } => "audio",
            ClientMessage::AudioEnd => "audio_end",
            ClientMessage::Interrupt => "interrupt",
            ClientMessage::SessionEnd => "session_end",
            ClientMessage::Pong { .. } => "pong",
        }
    }
}

/// What the transport reports to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The connection handshake completed
    Opened,
    Message(ServerMessage),
    /// The peer closed the connection
    Closed { reason: Option<String> },
    /// The transport failed
    Failed(String),
}

/// Accept only linear 16-bit PCM at the playback rate.
///
/// `audio/pcm`, `audio/l16` and `audio/raw` are accepted with optional parameters.
/// A `rate` parameter, when present, must equal `playback_rate`.
pub fn ensure_linear_pcm(content_type: &str, playback_rate: u32) -> AppResult<()> {
    let mut parts = content_type.split(';');
    let essence = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    if !LINEAR_PCM_TYPES.contains(&essence.as_str()) {
        return Err(AppError::UnsupportedContentType(format!(
            "'{}' is not linear PCM",
            content_type
        )));
    }

    for param in parts {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("rate") {
            let rate: u32 = value.trim().parse().map_err(|_| {
                AppError::UnsupportedContentType(format!("Invalid rate in '{}'", content_type))
            })?;
            if rate != playback_rate {
                return Err(AppError::UnsupportedContentType(format!(
                    "Audio at {} Hz cannot be played at {} Hz",
                    rate, playback_rate
                )));
            }
        }
    }
    Ok(())
}
