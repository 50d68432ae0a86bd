//! Hardware backend built on cpal.
//!
//! cpal streams are not `Send`, so each stream is built, played and dropped on its own
//! thread. `open_*` waits for that thread to report whether the stream started; the
//! returned [`DeviceStream`] signals the thread to drop the stream and joins it.

use crate::audio::device::{
    AudioBackend, CaptureCallback, DeviceErrorSink, DeviceFault, DeviceStream, Direction,
    RenderCallback, StreamSpec,
};
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig, SupportedBufferSize, SupportedStreamConfigRange};
use std::sync::mpsc;
use std::thread;
use tracing::{error, info, warn};

/// Default input and output devices of the platform's default host.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open_output(
        &self,
        spec: StreamSpec,
        mut render: RenderCallback,
        errors: DeviceErrorSink,
    ) -> AppResult<DeviceStream> {
        run_on_stream_thread(Direction::Output, move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| AppError::Initialization("No audio output device available".to_string()))?;
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

            let ranges: Vec<_> = device
                .supported_output_configs()
                .map_err(|e| AppError::Initialization(format!("Failed to query output configs: {}", e)))?
                .collect();
            let native = device
                .default_output_config()
                .map(|c| (c.sample_rate().0, c.channels()))
                .ok();
            let config = select_config(Direction::Output, &spec, &ranges, native)?;

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render(data),
                    move |err| report_fault(&errors, Direction::Output, err),
                    None,
                )
                .map_err(|e| AppError::Initialization(format!("Failed to build output stream: {}", e)))?;
            stream
                .play()
                .map_err(|e| AppError::Initialization(format!("Failed to start output stream: {}", e)))?;

            info!(device = %name, ?config, "Output stream playing");
            Ok((stream, name))
        })
    }

    fn open_input(
        &self,
        spec: StreamSpec,
        mut capture: CaptureCallback,
        errors: DeviceErrorSink,
    ) -> AppResult<DeviceStream> {
        run_on_stream_thread(Direction::Input, move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| AppError::Initialization("No audio input device available".to_string()))?;
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

            let ranges: Vec<_> = device
                .supported_input_configs()
                .map_err(|e| AppError::Initialization(format!("Failed to query input configs: {}", e)))?
                .collect();
            let native = device
                .default_input_config()
                .map(|c| (c.sample_rate().0, c.channels()))
                .ok();
            let config = select_config(Direction::Input, &spec, &ranges, native)?;

            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| capture(data),
                    move |err| report_fault(&errors, Direction::Input, err),
                    None,
                )
                .map_err(|e| AppError::Initialization(format!("Failed to build input stream: {}", e)))?;
            stream
                .play()
                .map_err(|e| AppError::Initialization(format!("Failed to start input stream: {}", e)))?;

            info!(device = %name, ?config, "Input stream recording");
            Ok((stream, name))
        })
    }
}

fn report_fault(errors: &DeviceErrorSink, direction: Direction, err: cpal::StreamError) {
    error!(%direction, "Audio stream error: {}", err);
    let _ = errors.send(DeviceFault {
        direction,
        message: err.to_string(),
    });
}

/// Pick an f32 configuration at exactly the requested rate and channel count.
///
/// The device's native configuration must already match: hosts that resample in a
/// plugin advertise wide rate ranges that say nothing about the hardware rate.
/// The quantum is requested as a fixed buffer size when the device advertises it;
/// otherwise the device default is used and the callbacks cope with whatever block
/// size arrives.
fn select_config(
    direction: Direction,
    spec: &StreamSpec,
    ranges: &[SupportedStreamConfigRange],
    native: Option<(u32, u16)>,
) -> AppResult<StreamConfig> {
    if let Some((rate, channels)) = native {
        spec.ensure_native(direction, rate, channels)?;
    }

    let matching = ranges.iter().find(|range| {
        range.channels() == spec.channels
            && range.sample_format() == SampleFormat::F32
            && range.min_sample_rate().0 <= spec.sample_rate
            && spec.sample_rate <= range.max_sample_rate().0
    });

    let Some(range) = matching else {
        return Err(AppError::Initialization(format!(
            "{} device offers no f32 stream at {} Hz / {} ch",
            direction, spec.sample_rate, spec.channels
        )));
    };

    let quantum = spec.quantum as u32;
    let buffer_size = match range.buffer_size() {
        SupportedBufferSize::Range { min, max } if *min <= quantum && quantum <= *max => {
            BufferSize::Fixed(quantum)
        }
        _ => {
            warn!(%direction, quantum, "Device cannot fix the buffer size; using its default");
            BufferSize::Default
        }
    };

    Ok(StreamConfig {
        channels: spec.channels,
        sample_rate: SampleRate(spec.sample_rate),
        buffer_size,
    })
}

/// Build a stream on a dedicated thread and keep it alive until the handle is stopped.
fn run_on_stream_thread<F>(direction: Direction, build: F) -> AppResult<DeviceStream>
where
    F: FnOnce() -> AppResult<(cpal::Stream, String)> + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::sync_channel::<AppResult<String>>(1);
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let worker = thread::Builder::new()
        .name(format!("audio-{}", direction))
        .spawn(move || {
            let stream = match build() {
                Ok((stream, name)) => {
                    let _ = ready_tx.send(Ok(name));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Returns on an explicit stop or when the handle is dropped
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| AppError::Initialization(format!("Failed to spawn {} thread: {}", direction, e)))?;

    let name = match ready_rx.recv() {
        Ok(result) => result?,
        Err(_) => {
            return Err(AppError::Initialization(format!(
                "{} thread exited before the stream started",
                direction
            )))
        }
    };

    Ok(DeviceStream::new(format!("{}:{}", direction, name), move || {
        let _ = stop_tx.send(());
        if worker.join().is_err() {
            error!(%direction, "Audio thread panicked");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide_range(buffer_size: SupportedBufferSize) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            1,
            SampleRate(8_000),
            SampleRate(192_000),
            buffer_size,
            SampleFormat::F32,
        )
    }

    #[test]
    fn test_wide_range_does_not_hide_native_rate_mismatch() {
        let spec = StreamSpec::mono(24_000, 512);
        let ranges = [wide_range(SupportedBufferSize::Unknown)];

        let err = select_config(Direction::Output, &spec, &ranges, Some((48_000, 1))).unwrap_err();
        assert!(matches!(err, AppError::Initialization(_)));

        let err = select_config(Direction::Input, &spec, &ranges, Some((24_000, 2))).unwrap_err();
        assert!(matches!(err, AppError::Initialization(_)));
    }

    #[test]
    fn test_native_match_selects_fixed_quantum() {
        let spec = StreamSpec::mono(24_000, 512);
        let ranges = [wide_range(SupportedBufferSize::Range { min: 64, max: 4096 })];

        let config = select_config(Direction::Output, &spec, &ranges, Some((24_000, 1))).unwrap();
        assert_eq!(config.sample_rate, SampleRate(24_000));
        assert_eq!(config.channels, 1);
        assert_eq!(config.buffer_size, BufferSize::Fixed(512));
    }

    #[test]
    fn test_no_f32_range_fails() {
        let spec = StreamSpec::mono(16_000, 4096);
        let ranges = [SupportedStreamConfigRange::new(
            1,
            SampleRate(16_000),
            SampleRate(16_000),
            SupportedBufferSize::Unknown,
            SampleFormat::I16,
        )];

        assert!(select_config(Direction::Input, &spec, &ranges, Some((16_000, 1))).is_err());
    }
}
