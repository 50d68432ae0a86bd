//! # Jitter Buffer
//!
//! Growable store of pending playback samples that absorbs irregular network delivery
//! so the render callback can pull a fixed quantum at a constant rate.
//!
//! ## Key Features:
//! - **Pre-roll**: nothing is played until `prebuffer_threshold` samples are queued, and
//!   the buffer re-enters pre-roll whenever it runs completely dry
//! - **Compact before grow**: when the tail is full the unread region is shifted to the
//!   front if it fits, so steady traffic never reallocates
//! - **Content-preserving growth**: bursts grow the store to twice the needed size
//!   without losing unread samples
//! - **Click-free underflow**: a short partial quantum fades from the last played sample
//!   to silence instead of cutting off
//!
//! ## Layout:
//! ```text
//! 0          read         write          capacity
//! |  played  |   unread   |    free      |
//! ```
//!
//! This type is single-threaded. [`crate::audio::playback::PlaybackBuffer`] wraps it in
//! the mutex shared by the control context and the render callback.

use crate::config::PlaybackConfig;

/// Sizing and pre-roll parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct JitterBufferConfig {
    /// Starting store size in samples
    pub initial_capacity: usize,

    /// Samples required before playback starts or resumes
    pub prebuffer_threshold: usize,

    /// Longest fade-to-silence on underflow
    pub fade_samples: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 24_000,    // one second at 24kHz
            prebuffer_threshold: 24_000, // one second of pre-roll
            fade_samples: 64,
        }
    }
}

impl From<&PlaybackConfig> for JitterBufferConfig {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            initial_capacity: config.initial_capacity_samples(),
            prebuffer_threshold: config.prebuffer_samples(),
            fade_samples: config.fade_samples,
        }
    }
}

/// What `append` had to do to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Samples fit after the write cursor
    InPlace,

    /// Unread samples were shifted to the front first
    Compacted,

    /// The store was replaced with a larger one
    Grown { capacity: usize },
}

/// What one `drain` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Buffered samples copied to the output
    pub copied: usize,

    /// Samples that had to be synthesized because the buffer ran short
    pub underflow: usize,

    /// Output was withheld because the buffer is pre-rolling
    pub prebuffering: bool,
}

#[derive(Debug)]
pub struct JitterBuffer {
    store: Vec<f32>,
    read: usize,
    write: usize,
    prebuffering: bool,
    prebuffer_threshold: usize,
    underflow_count: u64,
    fade_samples: usize,
    /// Last sample handed to the device; the fade starts here
    last_sample: f32,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        Self {
            store: vec![0.0; config.initial_capacity],
            read: 0,
            write: 0,
            prebuffering: true,
            prebuffer_threshold: config.prebuffer_threshold,
            underflow_count: 0,
            fade_samples: config.fade_samples,
            last_sample: 0.0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    /// Samples queued and not yet played.
    pub fn available(&self) -> usize {
        self.write - self.read
    }

    pub fn is_prebuffering(&self) -> bool {
        self.prebuffering
    }

    pub fn prebuffer_threshold(&self) -> usize {
        self.prebuffer_threshold
    }

    /// Cumulative samples synthesized because playback ran short.
    pub fn underflow_count(&self) -> u64 {
        self.underflow_count
    }

    /// Change the pre-roll threshold. Checked again at the next append or drain.
    pub fn set_prebuffer_threshold(&mut self, samples: usize) {
        self.prebuffer_threshold = samples;
    }

    /// Capacity a new store would need to accept `incoming` more samples, or `None`
    /// when the current store suffices (in place or after compaction).
    pub fn growth_needed(&self, incoming: usize) -> Option<usize> {
        let unread = self.available();
        if self.write + incoming <= self.store.len() || unread + incoming <= self.store.len() {
            None
        } else {
            Some(2 * (unread + incoming))
        }
    }

    /// Queue samples for playback.
    pub fn append(&mut self, samples: &[f32]) -> AppendOutcome {
        let mut spare = None;
        self.append_with_store(samples, &mut spare)
    }

    /// Queue samples, growing into a caller-provided store if growth is needed.
    ///
    /// If `spare` is large enough it replaces the current store, and the retired store is
    /// handed back through `spare` so the caller can free it after releasing any lock.
    /// A missing or undersized spare falls back to allocating here.
    pub fn append_with_store(
        &mut self,
        samples: &[f32],
        spare: &mut Option<Vec<f32>>,
    ) -> AppendOutcome {
        let incoming = samples.len();
        let unread = self.available();

        let outcome = if self.write + incoming <= self.store.len() {
            AppendOutcome::InPlace
        } else if unread + incoming <= self.store.len() {
            self.store.copy_within(self.read..self.write, 0);
            self.read = 0;
            self.write = unread;
            AppendOutcome::Compacted
        } else {
            let needed = 2 * (unread + incoming);
            let mut store = match spare.take() {
                Some(store) if store.len() >= needed => store,
                _ => vec![0.0; needed],
            };
            store[..unread].copy_from_slice(&self.store[self.read..self.write]);
            *spare = Some(std::mem::replace(&mut self.store, store));
            self.read = 0;
            self.write = unread;
            AppendOutcome::Grown {
                capacity: self.store.len(),
            }
        };

        self.store[self.write..self.write + incoming].copy_from_slice(samples);
        self.write += incoming;
        self.release_if_ready();
        outcome
    }

    /// Pull exactly `n` samples. Convenience wrapper over [`JitterBuffer::drain_into`].
    pub fn drain(&mut self, n: usize) -> Vec<f32> {
        let mut out = vec![0.0; n];
        self.drain_into(&mut out);
        out
    }

    /// Fill `out` completely, from buffered audio where possible.
    ///
    /// Never allocates. While pre-rolling the output is silent and nothing is consumed.
    /// A short read is padded with a fade to silence and counted as underflow; a read
    /// that finds nothing at all puts the buffer back into pre-roll.
    pub fn drain_into(&mut self, out: &mut [f32]) -> DrainReport {
        let n = out.len();
        if n == 0 {
            return DrainReport {
                prebuffering: self.prebuffering,
                ..DrainReport::default()
            };
        }
        self.release_if_ready();

        if self.prebuffering {
            out.fill(0.0);
            return DrainReport {
                copied: 0,
                underflow: 0,
                prebuffering: true,
            };
        }

        let copied = self.available().min(n);
        out[..copied].copy_from_slice(&self.store[self.read..self.read + copied]);
        self.read += copied;
        if copied > 0 {
            self.last_sample = out[copied - 1];
        }

        let shortfall = n - copied;
        if shortfall > 0 {
            self.fade_out(&mut out[copied..]);
            self.underflow_count += shortfall as u64;
        }

        if copied == 0 {
            self.prebuffering = true;
        }

        // Fully played: rewind so the next append lands in place
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }

        DrainReport {
            copied,
            underflow: shortfall,
            prebuffering: false,
        }
    }

    /// Discard everything queued and go back to pre-roll (barge-in).
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.prebuffering = true;
        self.last_sample = 0.0;
    }

    fn release_if_ready(&mut self) {
        let unread = self.available();
        if self.prebuffering && unread > 0 && unread >= self.prebuffer_threshold {
            self.prebuffering = false;
        }
    }

    /// Linear ramp from the last played sample down to zero, then plain silence.
    fn fade_out(&mut self, tail: &mut [f32]) {
        let fade_len = self.fade_samples.min(tail.len());
        let start = self.last_sample;
        for (i, slot) in tail[..fade_len].iter_mut().enumerate() {
            *slot = start * (1.0 - (i + 1) as f32 / fade_len as f32);
        }
        tail[fade_len..].fill(0.0);
        self.last_sample = 0.0;
    }
}
