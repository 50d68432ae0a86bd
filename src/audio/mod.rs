//! # Audio Module
//!
//! Both real-time halves of a speech stream and the pieces they share.
//!
//! ## Key Components:
//! - **Codec**: float samples to and from base64 little-endian 16-bit PCM text
//! - **Jitter Buffer**: pre-rolling, growable store that absorbs network jitter
//! - **Playback**: the render scheduler that drains one quantum per device tick
//! - **Analyser**: level and spectrum of the rendered output, computed off the device thread
//! - **Capture**: silence gate, re-chunking and the lock-free hand-off to the encoder
//! - **Device**: the backend trait that keeps hardware out of the session logic
//!
//! ## Audio Format:
//! - **Playback**: 24kHz mono, 512-sample quanta
//! - **Capture**: 16kHz mono, 4096-sample quanta
//! - **Wire**: base64 of 16-bit signed little-endian PCM
//!
//! Rates are fixed when a stream starts; a device that cannot run at them fails
//! to open instead of being resampled.

pub mod analyser;     // Output level and spectrum
pub mod buffer;       // Jitter buffer with pre-roll and growth
pub mod capture;      // Microphone path
pub mod codec;        // Wire sample codec
pub mod cpal_backend; // Hardware streams
pub mod device;       // Backend trait and stream handles
pub mod frame;        // Immutable audio frames
pub mod playback;     // Render path
pub mod stats;        // Counters shared with the real-time callbacks

pub use analyser::{OutputAnalyser, OutputAnalysis, OutputLevel, OutputTap};
pub use buffer::{AppendOutcome, DrainReport, JitterBuffer, JitterBufferConfig};
pub use capture::{CaptureEncoder, CapturePath, FrameDrain, PrefixMagnitudeGate, SilenceDetector};
pub use codec::{DecodeWarning, SampleCodec, ScaleMode};
pub use cpal_backend::CpalBackend;
pub use device::{AudioBackend, DeviceFault, DeviceStream, Direction, StreamSpec};
pub use frame::AudioFrame;
pub use playback::{BufferStatus, RenderPath, RenderScheduler};
pub use stats::{StatsSnapshot, StreamStats};
