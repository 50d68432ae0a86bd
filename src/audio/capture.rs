//! # Capture Path
//!
//! Microphone samples become outbound wire frames in two halves:
//!
//! - [`CaptureEncoder`] runs inside the input device callback. It re-chunks whatever block
//!   size the device delivers into exact quanta, applies the silence gate and copies each
//!   voiced quantum into a preallocated SPSC ring. Nothing here allocates or blocks; a full
//!   ring drops the quantum and counts an overrun.
//! - [`FrameDrain`] runs on the control context. It pops whole quanta from the ring and
//!   encodes them with the [`SampleCodec`].
//!
//! ## Flow:
//! ```text
//! device block -> accumulator -> gate -> ring -> FrameDrain -> wire text -> channel
//! ```

use crate::audio::codec::SampleCodec;
use crate::audio::device::{AudioBackend, CaptureCallback, DeviceErrorSink, DeviceStream, StreamSpec};
use crate::audio::frame::AudioFrame;
use crate::audio::stats::StreamStats;
use crate::config::CaptureConfig;
use crate::error::AppResult;
use rtrb::{Consumer, Producer, RingBuffer};
use std::sync::Arc;
use tracing::{debug, info};

/// Decides whether a captured quantum is worth sending.
pub trait SilenceDetector: Send {
    fn is_silent(&self, samples: &[f32]) -> bool;
}

/// Silent unless some sample in the first `prefix` samples exceeds `threshold` in magnitude.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefixMagnitudeGate {
    pub threshold: f32,
    pub prefix: usize,
}

impl SilenceDetector for PrefixMagnitudeGate {
    fn is_silent(&self, samples: &[f32]) -> bool {
        !samples
            .iter()
            .take(self.prefix)
            .any(|s| s.abs() > self.threshold)
    }
}

/// Gate used when silence skipping is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSilent;

impl SilenceDetector for NeverSilent {
    fn is_silent(&self, _samples: &[f32]) -> bool {
        false
    }
}

impl From<&CaptureConfig> for Box<dyn SilenceDetector> {
    fn from(config: &CaptureConfig) -> Self {
        if config.silence_gate {
            Box::new(PrefixMagnitudeGate {
                threshold: config.silence_threshold,
                prefix: config.silence_prefix,
            })
        } else {
            Box::new(NeverSilent)
        }
    }
}

/// Real-time half of the capture path.
pub struct CaptureEncoder {
    accumulator: Vec<f32>,
    filled: usize,
    gate: Box<dyn SilenceDetector>,
    producer: Producer<f32>,
    stats: Arc<StreamStats>,
}

impl CaptureEncoder {
    /// Feed one device block of any length.
    pub fn process(&mut self, mut input: &[f32]) {
        let quantum = self.accumulator.len();
        while !input.is_empty() {
            let take = (quantum - self.filled).min(input.len());
            self.accumulator[self.filled..self.filled + take].copy_from_slice(&input[..take]);
            self.filled += take;
            input = &input[take..];

            if self.filled == quantum {
                self.emit();
                self.filled = 0;
            }
        }
    }

    fn emit(&mut self) {
        StreamStats::bump(&self.stats.capture_quanta);
        if self.gate.is_silent(&self.accumulator) {
            StreamStats::bump(&self.stats.silent_quanta);
            return;
        }

        match self.producer.write_chunk(self.accumulator.len()) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&self.accumulator[..split]);
                second.copy_from_slice(&self.accumulator[split..]);
                chunk.commit_all();
            }
            Err(_) => StreamStats::bump(&self.stats.ring_overruns),
        }
    }

    pub fn into_callback(mut self) -> CaptureCallback {
        Box::new(move |input: &[f32]| self.process(input))
    }
}

/// Control half of the capture path.
pub struct FrameDrain {
    consumer: Consumer<f32>,
    codec: SampleCodec,
    spec: StreamSpec,
}

impl FrameDrain {
    /// Next whole quantum waiting in the ring.
    pub fn pop_frame(&mut self) -> Option<AudioFrame> {
        let quantum = self.spec.quantum;
        let chunk = self.consumer.read_chunk(quantum).ok()?;
        let (first, second) = chunk.as_slices();
        let mut samples = Vec::with_capacity(quantum);
        samples.extend_from_slice(first);
        samples.extend_from_slice(second);
        chunk.commit_all();
        Some(AudioFrame::mono(samples, self.spec.sample_rate))
    }

    /// Next quantum, encoded for the wire.
    pub fn pop_wire(&mut self) -> Option<String> {
        self.pop_frame().map(|frame| frame.to_wire(&self.codec))
    }

    pub fn pending_frames(&self) -> usize {
        self.consumer.slots() / self.spec.quantum.max(1)
    }

    /// Throw away everything still queued.
    pub fn discard(&mut self) -> usize {
        let mut dropped = 0;
        while self.pop_frame().is_some() {
            dropped += 1;
        }
        dropped
    }
}

/// Build both halves of the capture path around a ring of `ring_frames` quanta.
pub fn capture_pipeline(
    config: &CaptureConfig,
    codec: SampleCodec,
    stats: Arc<StreamStats>,
) -> (CaptureEncoder, FrameDrain) {
    let spec = config.spec();
    let quantum = spec.quantum.max(1);
    let (producer, consumer) = RingBuffer::new(quantum * config.ring_frames.max(1));

    let encoder = CaptureEncoder {
        accumulator: vec![0.0; quantum],
        filled: 0,
        gate: config.into(),
        producer,
        stats,
    };
    let drain = FrameDrain {
        consumer,
        codec,
        spec,
    };
    (encoder, drain)
}

/// A running input stream together with its drain.
pub struct CapturePath {
    drain: FrameDrain,
    stream: DeviceStream,
}

impl CapturePath {
    /// Acquire the input device and start encoding.
    pub fn start(
        backend: &dyn AudioBackend,
        config: &CaptureConfig,
        codec: SampleCodec,
        stats: Arc<StreamStats>,
        errors: DeviceErrorSink,
    ) -> AppResult<Self> {
        let spec = config.spec();
        let (encoder, drain) = capture_pipeline(config, codec, stats);
        let stream = backend.open_input(spec, encoder.into_callback(), errors)?;
        info!(
            backend = backend.name(),
            sample_rate = spec.sample_rate,
            quantum = spec.quantum,
            silence_gate = config.silence_gate,
            "Capture path started"
        );
        Ok(Self { drain, stream })
    }

    pub fn drain(&mut self) -> &mut FrameDrain {
        &mut self.drain
    }

    /// Release the input device and hand back the drain so queued quanta can still be sent.
    pub fn stop(self) -> FrameDrain {
        self.stream.stop();
        debug!(pending = self.drain.pending_frames(), "Capture path stopped");
        self.drain
    }
}
