//! Observability events published by a running session.
//!
//! Delivered on a `broadcast` channel: publishing never blocks, and a slow subscriber
//! misses events instead of holding up the session.

use crate::session::state::SessionState;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },

    /// One captured quantum was handed to the channel
    EncodedFrame { data: String },

    /// Samples synthesized since the last report, plus the running total
    Underflow { samples: u64, total: u64 },

    BufferGrown { capacity: usize },

    /// Level of the audio rendered since the previous tick; only published when audible
    OutputLevel { peak: f32, rms: f32 },

    Transcript { text: String, is_final: bool },

    ServiceStatus {
        status: String,
        message: Option<String>,
    },

    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },

    Error {
        kind: String,
        message: String,
        fatal: bool,
    },
}
