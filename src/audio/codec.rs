//! # Sample Codec
//!
//! Stateless conversion between the wire encoding and linear float samples.
//!
//! ## Wire Format:
//! - **Sample format**: 16-bit signed PCM, little-endian
//! - **Channels**: Mono
//! - **Text encoding**: standard base64 (padding optional on decode)
//! - **Wrapper**: an optional `data:...;base64,` style prefix is stripped on decode
//! - **Whitespace**: ASCII whitespace anywhere in the payload is ignored on decode
//!
//! ## Scaling:
//! The default [`ScaleMode::Symmetric`] uses a single full-scale constant (32767) in both
//! directions, so `encode` then `decode` reconstructs any sample in [-1, 1] within half a
//! quantization step and positive/negative samples quantize identically.
//! [`ScaleMode::LegacyAsymmetric`] exists only for bit-exact parity with the older encoder
//! that multiplied negative samples by 32768.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Symmetric full-scale constant.
pub const FULL_SCALE: f32 = 32767.0;

/// Legacy negative full-scale constant.
const LEGACY_NEGATIVE_SCALE: f32 = 32768.0;

/// Separator between a data-URI style wrapper and the payload.
const PAYLOAD_DELIMITER: char = ',';

/// Accepts both padded and unpadded input.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// How float samples map onto 16-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMode {
    /// `round(clamp(x) * 32767)` and `i / 32767`
    #[default]
    Symmetric,

    /// Compatibility shim: negative samples scale by 32768, positive by 32767,
    /// and decoding divides by 32768.
    LegacyAsymmetric,
}

/// Non-fatal problems found while decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeWarning {
    /// Payload had an odd number of bytes; the last byte was dropped
    TrailingByte,

    /// Text was not valid base64; nothing could be recovered
    InvalidEncoding(String),
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeWarning::TrailingByte => write!(f, "odd payload length, dropped trailing byte"),
            DecodeWarning::InvalidEncoding(msg) => write!(f, "invalid base64 payload: {}", msg),
        }
    }
}

/// Result of decoding one wire payload.
///
/// `samples` always holds every fully decoded sample, even when `warning` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub samples: Vec<f32>,
    pub warning: Option<DecodeWarning>,
}

/// Converts between float samples and wire text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleCodec {
    mode: ScaleMode,
}

impl SampleCodec {
    pub fn new(mode: ScaleMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ScaleMode {
        self.mode
    }

    /// Encode float samples into base64 text of little-endian i16 PCM.
    ///
    /// Samples outside [-1, 1] are clamped; NaN encodes as silence.
    pub fn encode(&self, samples: &[f32]) -> String {
        if samples.is_empty() {
            return String::new();
        }

        let mut bytes = vec![0u8; samples.len() * 2];
        for (chunk, &sample) in bytes.chunks_exact_mut(2).zip(samples) {
            LittleEndian::write_i16(chunk, self.quantize(sample));
        }
        STANDARD.encode(bytes)
    }

    /// Decode wire text into float samples.
    ///
    /// Never fails: malformed input yields as many samples as could be recovered
    /// plus a [`DecodeWarning`].
    pub fn decode(&self, wire_text: &str) -> Decoded {
        let payload = strip_wrapper(wire_text);
        if payload.is_empty() {
            return Decoded {
                samples: Vec::new(),
                warning: None,
            };
        }

        // Line-wrapped payloads carry whitespace inside the base64 text too
        let payload: Cow<'_, str> = if payload.bytes().any(|b| b.is_ascii_whitespace()) {
            Cow::Owned(payload.chars().filter(|c| !c.is_ascii_whitespace()).collect())
        } else {
            Cow::Borrowed(payload)
        };

        let bytes = match LENIENT.decode(payload.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                return Decoded {
                    samples: Vec::new(),
                    warning: Some(DecodeWarning::InvalidEncoding(err.to_string())),
                }
            }
        };

        let warning = (bytes.len() % 2 != 0).then_some(DecodeWarning::TrailingByte);
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| self.dequantize(LittleEndian::read_i16(pair)))
            .collect();

        Decoded { samples, warning }
    }

    fn quantize(&self, sample: f32) -> i16 {
        if sample.is_nan() {
            return 0;
        }
        let clamped = sample.clamp(-1.0, 1.0);
        let scaled = match self.mode {
            ScaleMode::Symmetric => clamped * FULL_SCALE,
            ScaleMode::LegacyAsymmetric if clamped < 0.0 => clamped * LEGACY_NEGATIVE_SCALE,
            ScaleMode::LegacyAsymmetric => clamped * FULL_SCALE,
        };
        scaled.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }

    fn dequantize(&self, value: i16) -> f32 {
        match self.mode {
            // i16::MIN would land at -1.00003; keep the output inside [-1, 1]
            ScaleMode::Symmetric => (value as f32 / FULL_SCALE).max(-1.0),
            ScaleMode::LegacyAsymmetric => value as f32 / LEGACY_NEGATIVE_SCALE,
        }
    }
}

/// Drop everything up to and including the first delimiter, then trim whitespace.
fn strip_wrapper(wire_text: &str) -> &str {
    match wire_text.find(PAYLOAD_DELIMITER) {
        Some(index) => wire_text[index + 1..].trim(),
        None => wire_text.trim(),
    }
}
