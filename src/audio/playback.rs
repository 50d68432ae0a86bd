//! # Playback Path
//!
//! Connects the [`JitterBuffer`] to the output device.
//!
//! ## Threads involved:
//! - **Control context** (the session task): calls `write_audio`, `set_prebuffer_threshold`
//!   and `barge_in`. All variable-cost work (compaction, growth) happens here.
//! - **Render context** (the device thread): calls [`RenderScheduler::render`] once per
//!   quantum. It takes the buffer lock, copies one quantum and bumps two counters, then
//!   hands the rendered quantum to the [`OutputTap`].
//!
//! The mutex around the buffer is the only synchronization point, so the render tick never
//! observes half-updated cursors. Growth allocates the new store *before* taking the lock
//! and frees the old one *after* releasing it, which keeps the critical section to plain
//! copies.

use crate::audio::analyser::{output_analyser, OutputAnalyser, OutputTap};
use crate::audio::buffer::{AppendOutcome, DrainReport, JitterBuffer, JitterBufferConfig};
use crate::audio::device::{AudioBackend, DeviceErrorSink, DeviceStream, RenderCallback, StreamSpec};
use crate::audio::stats::StreamStats;
use crate::error::AppResult;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Jitter buffer shared between the control context and the render callback.
#[derive(Debug)]
pub struct PlaybackBuffer {
    inner: Mutex<JitterBuffer>,
}

/// Read-only view of the buffer for status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferStatus {
    pub capacity: usize,
    pub available: usize,
    pub prebuffering: bool,
    pub prebuffer_threshold: usize,
    pub underflow_count: u64,
}

impl PlaybackBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        Self {
            inner: Mutex::new(JitterBuffer::new(config)),
        }
    }

    // A panic while holding the lock cannot leave the cursors torn (every mutation is
    // a plain assignment), so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, JitterBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, samples: &[f32]) -> AppendOutcome {
        // Only the control context appends, and drains only shrink the unread region,
        // so a store sized here is still large enough once the lock is retaken.
        let needed = self.lock().growth_needed(samples.len());
        let mut spare = needed.map(|capacity| vec![0.0; capacity]);

        let outcome = self.lock().append_with_store(samples, &mut spare);
        drop(spare);
        outcome
    }

    pub fn drain_into(&self, out: &mut [f32]) -> DrainReport {
        self.lock().drain_into(out)
    }

    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn set_prebuffer_threshold(&self, samples: usize) {
        self.lock().set_prebuffer_threshold(samples);
    }

    pub fn status(&self) -> BufferStatus {
        let jb = self.lock();
        BufferStatus {
            capacity: jb.capacity(),
            available: jb.available(),
            prebuffering: jb.is_prebuffering(),
            prebuffer_threshold: jb.prebuffer_threshold(),
            underflow_count: jb.underflow_count(),
        }
    }
}

/// Fixed-quantum consumer of the jitter buffer.
///
/// Cloning is cheap; the clone handed to the device and the one kept by the session share
/// the same buffer and counters.
#[derive(Debug, Clone)]
pub struct RenderScheduler {
    buffer: Arc<PlaybackBuffer>,
    stats: Arc<StreamStats>,
    spec: StreamSpec,
}

impl RenderScheduler {
    pub fn new(spec: StreamSpec, config: JitterBufferConfig, stats: Arc<StreamStats>) -> Self {
        let buffer = PlaybackBuffer::new(config);
        stats
            .buffer_capacity
            .store(buffer.status().capacity, Ordering::Relaxed);
        Self {
            buffer: Arc::new(buffer),
            stats,
            spec,
        }
    }

    pub fn spec(&self) -> StreamSpec {
        self.spec
    }

    /// One device tick: exactly one drain of `out.len()` samples.
    pub fn render(&self, out: &mut [f32]) -> DrainReport {
        let report = self.buffer.drain_into(out);
        StreamStats::bump(&self.stats.render_quanta);
        StreamStats::add(&self.stats.underflow_samples, report.underflow as u64);
        report
    }

    /// Device callback: render, then copy what was played into `tap`.
    pub fn callback(&self, mut tap: OutputTap) -> RenderCallback {
        let scheduler = self.clone();
        Box::new(move |out: &mut [f32]| {
            scheduler.render(out);
            tap.write(out);
        })
    }

    /// Queue decoded audio for playback.
    pub fn write_audio(&self, samples: &[f32]) -> AppendOutcome {
        let outcome = self.buffer.append(samples);
        if let AppendOutcome::Grown { capacity } = outcome {
            StreamStats::bump(&self.stats.buffer_growths);
            self.stats.buffer_capacity.store(capacity, Ordering::Relaxed);
            debug!(capacity, "Jitter buffer grown");
        }
        outcome
    }

    pub fn set_prebuffer_threshold(&self, samples: usize) {
        self.buffer.set_prebuffer_threshold(samples);
    }

    /// Drop everything queued; the next tick is silent.
    pub fn barge_in(&self) {
        self.buffer.reset();
        StreamStats::bump(&self.stats.barge_ins);
    }

    fn clear(&self) {
        self.buffer.reset();
    }

    pub fn status(&self) -> BufferStatus {
        self.buffer.status()
    }
}

/// A running output stream together with its scheduler.
#[derive(Debug)]
pub struct RenderPath {
    scheduler: RenderScheduler,
    analyser: OutputAnalyser,
    stream: DeviceStream,
}

impl RenderPath {
    /// Create the buffer (pre-rolling) and the output analyser, then start the output
    /// device.
    pub fn start(
        backend: &dyn AudioBackend,
        spec: StreamSpec,
        config: JitterBufferConfig,
        analyser_fft_size: usize,
        stats: Arc<StreamStats>,
        errors: DeviceErrorSink,
    ) -> AppResult<Self> {
        let scheduler = RenderScheduler::new(spec, config, stats);
        let (tap, analyser) = output_analyser(analyser_fft_size);
        let stream = backend.open_output(spec, scheduler.callback(tap), errors)?;
        info!(
            backend = backend.name(),
            sample_rate = spec.sample_rate,
            quantum = spec.quantum,
            fft_size = analyser.fft_size(),
            "Render path started"
        );
        Ok(Self {
            scheduler,
            analyser,
            stream,
        })
    }

    pub fn scheduler(&self) -> &RenderScheduler {
        &self.scheduler
    }

    pub fn analyser(&self) -> &OutputAnalyser {
        &self.analyser
    }

    pub fn analyser_mut(&mut self) -> &mut OutputAnalyser {
        &mut self.analyser
    }

    /// Clear the buffer and release the output device.
    pub fn stop(self) {
        self.scheduler.clear();
        self.stream.stop();
        info!("Render path stopped");
    }
}
