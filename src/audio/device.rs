//! # Audio Device Boundary
//!
//! The session never talks to audio hardware directly. It asks an [`AudioBackend`] to open
//! an output stream driven by a render callback and an input stream driven by a capture
//! callback, both at a fixed [`StreamSpec`].
//!
//! ## Contract for backends:
//! - The stream runs at exactly the requested rate and channel count. A device that cannot
//!   do so fails `open_*` with [`AppError::Initialization`]; there is no resampling.
//! - Callbacks run on the device's real-time thread and must be invoked with blocks of
//!   `spec.quantum` samples where the hardware allows it.
//! - Failures after the stream started are reported through the [`DeviceErrorSink`],
//!   which never blocks.
//! - Dropping the returned [`DeviceStream`] stops the stream and releases the device.

use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Fixed stream parameters, decided when the stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub quantum: usize,
}

impl StreamSpec {
    pub fn mono(sample_rate: u32, quantum: usize) -> Self {
        Self {
            sample_rate,
            channels: 1,
            quantum,
        }
    }

    /// Fail unless a device's native configuration is exactly this spec's rate and layout.
    pub fn ensure_native(&self, direction: Direction, native_rate: u32, native_channels: u16) -> AppResult<()> {
        if native_rate != self.sample_rate || native_channels != self.channels {
            return Err(AppError::Initialization(format!(
                "{} device runs at {} Hz / {} ch, stream requires {} Hz / {} ch",
                direction, native_rate, native_channels, self.sample_rate, self.channels
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Output,
    Input,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Output => write!(f, "output"),
            Direction::Input => write!(f, "input"),
        }
    }
}

/// A device failure reported from a running stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFault {
    pub direction: Direction,
    pub message: String,
}

impl From<DeviceFault> for AppError {
    fn from(fault: DeviceFault) -> Self {
        AppError::Device(format!("{} device: {}", fault.direction, fault.message))
    }
}

/// Called once per output quantum with the buffer to fill.
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Called once per input quantum with the captured samples.
pub type CaptureCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Where running streams report failures. Unbounded so the device thread never waits.
pub type DeviceErrorSink = mpsc::UnboundedSender<DeviceFault>;

/// Opens real-time audio streams.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    fn open_output(
        &self,
        spec: StreamSpec,
        render: RenderCallback,
        errors: DeviceErrorSink,
    ) -> AppResult<DeviceStream>;

    fn open_input(
        &self,
        spec: StreamSpec,
        capture: CaptureCallback,
        errors: DeviceErrorSink,
    ) -> AppResult<DeviceStream>;
}

/// Handle to a running stream. Dropping it stops the stream.
pub struct DeviceStream {
    label: String,
    stop: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl DeviceStream {
    pub fn new(label: impl Into<String>, stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label: label.into(),
            stop: Some(Box::new(stop)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stop now instead of waiting for the drop.
    pub fn stop(mut self) {
        self.run_stop();
    }

    fn run_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
            tracing::debug!(stream = %self.label, "Audio stream stopped");
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.run_stop();
    }
}

impl fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceStream")
            .field("label", &self.label)
            .field("running", &self.stop.is_some())
            .finish()
    }
}
