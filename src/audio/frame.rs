//! Immutable audio frames exchanged between the codec and the two audio paths.

use crate::audio::codec::{DecodeWarning, SampleCodec};

/// One block of mono samples at a known rate.
///
/// Frames are produced once (by the codec or by the capture path) and consumed once,
/// so they own their samples and expose them read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Decode a wire payload into a frame, passing any decode warning through.
    pub fn from_wire(
        codec: &SampleCodec,
        wire_text: &str,
        sample_rate: u32,
    ) -> (Self, Option<DecodeWarning>) {
        let decoded = codec.decode(wire_text);
        (Self::mono(decoded.samples, sample_rate), decoded.warning)
    }

    pub fn to_wire(&self, codec: &SampleCodec) -> String {
        codec.encode(&self.samples)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_from_wire() {
        let codec = SampleCodec::default();
        let wire = codec.encode(&vec![0.1; 240]);
        let (frame, warning) = AudioFrame::from_wire(&codec, &wire, 24_000);

        assert!(warning.is_none());
        assert_eq!(frame.len(), 240);
        assert_eq!(frame.channels(), 1);
        assert_eq!(frame.duration_ms(), 10.0);
        assert_eq!(frame.to_wire(&codec), wire);
    }
}
