//! # Configuration Management
//!
//! Loads the client configuration from several layers:
//! - built-in defaults (the [`Default`] impl below)
//! - an optional `config.toml` in the working directory
//! - environment variables with the `APP_` prefix (nested keys use `__`,
//!   e.g. `APP_PLAYBACK__PREBUFFER_MS=500`)
//! - `HOST` / `PORT` for the local control API
//!
//! ## Priority (highest to lowest):
//! 1. `HOST` / `PORT`
//! 2. `APP_*` environment variables
//! 3. `config.toml`
//! 4. Defaults
//!
//! Audio parameters are read once when a session starts. Runtime updates through
//! `PUT /api/v1/config` therefore apply to the next session, never to running streams.

use crate::audio::codec::ScaleMode;
use crate::audio::device::StreamSpec;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Complete client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub service: ServiceConfig,
    pub playback: PlaybackConfig,
    pub capture: CaptureConfig,
    pub session: SessionConfig,
}

/// Local control API listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote conversational-audio service.
///
/// ## Fields:
/// - `url`: WebSocket endpoint (`ws://` or `wss://`)
/// - `outbound_queue`: frames buffered between the session and the socket writer
/// - `inbound_queue`: events buffered between the socket reader and the session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub url: String,
    pub outbound_queue: usize,
    pub inbound_queue: usize,
}

/// Playback (render) path settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackConfig {
    /// Device rate; inbound audio must already be at this rate
    pub sample_rate: u32,

    /// Samples per render callback
    pub quantum: usize,

    /// Audio withheld before playback starts or resumes after running dry
    pub prebuffer_ms: u32,

    /// Starting jitter buffer capacity
    pub initial_capacity_ms: u32,

    /// Longest fade-to-silence applied on underflow
    pub fade_samples: usize,

    /// Sample scaling used by the wire codec
    pub scale_mode: ScaleMode,

    /// Window of the output analyser; yields `analyser_fft_size / 2` frequency bins
    pub analyser_fft_size: usize,
}

/// Capture (microphone) path settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    pub sample_rate: u32,

    /// Samples per outbound frame
    pub quantum: usize,

    /// Skip quanta whose prefix stays under `silence_threshold`
    pub silence_gate: bool,
    pub silence_threshold: f32,
    pub silence_prefix: usize,

    /// Whole quanta the capture ring can hold before frames are dropped
    pub ring_frames: usize,
}

/// Session state machine timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// How long to wait in `Processing` for the service to answer
    pub processing_timeout_ms: u64,

    /// Control loop tick: drains the capture ring and publishes counters
    pub poll_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            service: ServiceConfig {
                url: "ws://127.0.0.1:9000/ws/speech".to_string(),
                outbound_queue: 64,
                inbound_queue: 256,
            },
            playback: PlaybackConfig {
                sample_rate: 24_000,
                quantum: 512,
                prebuffer_ms: 1000, // one second of cushion before audible output
                initial_capacity_ms: 1000,
                fade_samples: 64,
                scale_mode: ScaleMode::Symmetric,
                analyser_fft_size: 512,
            },
            capture: CaptureConfig {
                sample_rate: 16_000,
                quantum: 4096,
                silence_gate: true,
                silence_threshold: 0.01,
                silence_prefix: 512,
                ring_frames: 8,
            },
            session: SessionConfig {
                processing_timeout_ms: 30_000,
                poll_interval_ms: 20,
            },
        }
    }
}

impl PlaybackConfig {
    pub fn prebuffer_samples(&self) -> usize {
        ms_to_samples(self.prebuffer_ms, self.sample_rate)
    }

    pub fn initial_capacity_samples(&self) -> usize {
        ms_to_samples(self.initial_capacity_ms, self.sample_rate)
    }

    /// Samples in `ms` milliseconds of playback audio.
    pub fn samples_for_ms(&self, ms: u32) -> usize {
        ms_to_samples(ms, self.sample_rate)
    }

    pub fn spec(&self) -> StreamSpec {
        StreamSpec::mono(self.sample_rate, self.quantum)
    }
}

impl CaptureConfig {
    pub fn spec(&self) -> StreamSpec {
        StreamSpec::mono(self.sample_rate, self.quantum)
    }
}

impl SessionConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn ms_to_samples(ms: u32, sample_rate: u32) -> usize {
    (ms as usize * sample_rate as usize) / 1000
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        // Deployment platforms commonly set these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the streaming core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !(self.service.url.starts_with("ws://") || self.service.url.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Service URL must use ws:// or wss://, got {}",
                self.service.url
            ));
        }

        if self.service.outbound_queue == 0 || self.service.inbound_queue == 0 {
            return Err(anyhow::anyhow!("Channel queue capacities must be greater than 0"));
        }

        if self.playback.sample_rate == 0 || self.capture.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.playback.quantum == 0 || self.capture.quantum == 0 {
            return Err(anyhow::anyhow!("Quantum sizes must be greater than 0"));
        }

        if self.playback.initial_capacity_samples() == 0 {
            return Err(anyhow::anyhow!("Initial playback capacity must hold at least one sample"));
        }

        let fft_size = self.playback.analyser_fft_size;
        if !fft_size.is_power_of_two() || !(32..=32_768).contains(&fft_size) {
            return Err(anyhow::anyhow!(
                "Analyser FFT size must be a power of two in [32, 32768], got {}",
                fft_size
            ));
        }

        if !(0.0..1.0).contains(&self.capture.silence_threshold) {
            return Err(anyhow::anyhow!(
                "Silence threshold must be in [0, 1), got {}",
                self.capture.silence_threshold
            ));
        }

        if self.capture.silence_gate && self.capture.silence_prefix == 0 {
            return Err(anyhow::anyhow!(
                "Silence prefix must be greater than 0 while the silence gate is enabled"
            ));
        }

        if self.capture.ring_frames == 0 {
            return Err(anyhow::anyhow!("Capture ring must hold at least one frame"));
        }

        if self.session.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Poll interval must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update, e.g. `{"playback": {"prebuffer_ms": 500}}`.
    ///
    /// Only the keys present in `json_str` change. The merged result must pass
    /// [`AppConfig::validate`]; on failure `self` is left untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.playback.sample_rate, 24_000);
        assert_eq!(config.capture.sample_rate, 16_000);
        // One second of pre-roll at the playback rate
        assert_eq!(config.playback.prebuffer_samples(), 24_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.playback.quantum = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.service.url = "http://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.capture.silence_threshold = 1.5;
        assert!(config.validate().is_err());

        // An empty prefix would gate every quantum as silent
        let mut config = AppConfig::default();
        config.capture.silence_prefix = 0;
        assert!(config.validate().is_err());
        config.capture.silence_gate = false;
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.playback.analyser_fft_size = 500;
        assert!(config.validate().is_err());
        config.playback.analyser_fft_size = 16;
        assert!(config.validate().is_err());
        config.playback.analyser_fft_size = 2048;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"playback": {"prebuffer_ms": 250}, "capture": {"silence_gate": false}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.playback.prebuffer_ms, 250);
        assert_eq!(config.playback.prebuffer_samples(), 6_000);
        assert!(!config.capture.silence_gate);
        // Untouched sections keep their values
        assert_eq!(config.playback.sample_rate, 24_000);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_invalid_update_leaves_config_unchanged() {
        let mut config = AppConfig::default();
        let before = config.clone();
        assert!(config.update_from_json(r#"{"server": {"port": 0}}"#).is_err());
        assert_eq!(config, before);

        assert!(config.update_from_json(r#"[1, 2, 3]"#).is_err());
        assert_eq!(config, before);
    }

    #[test]
    fn test_scale_mode_update() {
        let mut config = AppConfig::default();
        config
            .update_from_json(r#"{"playback": {"scale_mode": "legacy_asymmetric"}}"#)
            .unwrap();
        assert_eq!(config.playback.scale_mode, ScaleMode::LegacyAsymmetric);
    }
}
