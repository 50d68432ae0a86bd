//! # Output Analyser
//!
//! Level and spectrum of what the render path actually played.
//!
//! - [`OutputTap`] runs inside the render callback, after the drain. It copies the
//!   rendered quantum into a preallocated SPSC ring; whatever does not fit is skipped.
//! - [`OutputAnalyser`] runs on the control tick. It keeps the most recent `fft_size`
//!   samples, measures peak and RMS over the samples that arrived since the previous
//!   tick and turns the window into byte-scaled frequency data.
//!
//! ## Frequency data:
//! Blackman window, magnitude `|X[k]| / fft_size`, exponential smoothing (0.8) across
//! ticks, then decibels mapped linearly from [-100 dB, -30 dB] onto `0..=255`.
//! Only the first `fft_size / 2` bins are kept.

use rtrb::{Consumer, Producer, RingBuffer};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::Serialize;
use std::f32::consts::PI;
use std::fmt;
use std::sync::Arc;

const SMOOTHING: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Windows' worth of samples the tap ring holds between two ticks.
const RING_WINDOWS: usize = 4;

/// Peak and RMS over the samples rendered since the previous tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OutputLevel {
    pub peak: f32,
    pub rms: f32,
}

/// Latest analysis, as reported in session snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputAnalysis {
    pub level: OutputLevel,
    pub fft_size: usize,
    pub frequency_data: Vec<u8>,
}

/// Real-time half: never allocates or blocks.
pub struct OutputTap {
    producer: Producer<f32>,
}

impl OutputTap {
    /// Copy rendered samples into the ring. Returns how many were taken.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let taken = samples.len().min(self.producer.slots());
        if taken == 0 {
            return 0;
        }
        match self.producer.write_chunk(taken) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&samples[..split]);
                second.copy_from_slice(&samples[split..taken]);
                chunk.commit_all();
                taken
            }
            Err(_) => 0,
        }
    }
}

/// Control half.
pub struct OutputAnalyser {
    consumer: Consumer<f32>,
    history: Vec<f32>,
    cursor: usize,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    spectrum: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    level: OutputLevel,
    frequency_data: Vec<u8>,
}

impl fmt::Debug for OutputAnalyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputAnalyser")
            .field("fft_size", &self.history.len())
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// Build both halves around a window of `fft_size` samples (a power of two).
pub fn output_analyser(fft_size: usize) -> (OutputTap, OutputAnalyser) {
    let fft_size = fft_size.max(2);
    let (producer, consumer) = RingBuffer::new(fft_size * RING_WINDOWS);

    let window = (0..fft_size)
        .map(|n| {
            let phase = 2.0 * PI * n as f32 / fft_size as f32;
            0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
        })
        .collect();
    let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);

    let analyser = OutputAnalyser {
        consumer,
        history: vec![0.0; fft_size],
        cursor: 0,
        window,
        fft,
        spectrum: vec![Complex::new(0.0, 0.0); fft_size],
        smoothed: vec![0.0; fft_size / 2],
        level: OutputLevel::default(),
        frequency_data: vec![0; fft_size / 2],
    };
    (OutputTap { producer }, analyser)
}

impl OutputAnalyser {
    pub fn fft_size(&self) -> usize {
        self.history.len()
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.frequency_data.len()
    }

    /// Consume everything the tap delivered. `None` when nothing was rendered since the
    /// last call; the previous level and frequency data stay in place.
    pub fn update(&mut self) -> Option<OutputLevel> {
        let arrived = self.consumer.slots();
        if arrived == 0 {
            return None;
        }
        let chunk = self.consumer.read_chunk(arrived).ok()?;

        let size = self.history.len();
        let mut peak = 0.0f32;
        let mut energy = 0.0f64;
        let (first, second) = chunk.as_slices();
        for &sample in first.iter().chain(second) {
            peak = peak.max(sample.abs());
            energy += f64::from(sample) * f64::from(sample);
            self.history[self.cursor] = sample;
            self.cursor = (self.cursor + 1) % size;
        }
        chunk.commit_all();

        self.level = OutputLevel {
            peak,
            rms: (energy / arrived as f64).sqrt() as f32,
        };
        self.transform();
        Some(self.level)
    }

    fn transform(&mut self) {
        let size = self.history.len();
        // Oldest sample first
        for (i, bin) in self.spectrum.iter_mut().enumerate() {
            let sample = self.history[(self.cursor + i) % size];
            *bin = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.spectrum);

        let scale = 1.0 / size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        for ((smoothed, byte), bin) in self
            .smoothed
            .iter_mut()
            .zip(self.frequency_data.iter_mut())
            .zip(self.spectrum.iter())
        {
            *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * bin.norm() * scale;
            let decibels = 20.0 * smoothed.log10();
            *byte = (255.0 * (decibels - MIN_DECIBELS) / range).clamp(0.0, 255.0) as u8;
        }
    }

    pub fn level(&self) -> OutputLevel {
        self.level
    }

    pub fn frequency_data(&self) -> &[u8] {
        &self.frequency_data
    }

    pub fn analysis(&self) -> OutputAnalysis {
        OutputAnalysis {
            level: self.level,
            fft_size: self.fft_size(),
            frequency_data: self.frequency_data.clone(),
        }
    }
}
