//! Lock-free counters shared between the real-time callbacks and the control loop.
//!
//! Callbacks only ever `fetch_add` with relaxed ordering. The control loop reads the
//! counters on its tick and turns changes into log lines and events.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct StreamStats {
    // Playback
    pub underflow_samples: AtomicU64,
    pub render_quanta: AtomicU64,
    pub inbound_frames: AtomicU64,
    pub inbound_samples: AtomicU64,
    pub rejected_frames: AtomicU64,
    pub decode_warnings: AtomicU64,
    pub buffer_growths: AtomicU64,
    pub buffer_capacity: AtomicUsize,
    pub barge_ins: AtomicU64,

    // Capture
    pub capture_quanta: AtomicU64,
    pub silent_quanta: AtomicU64,
    pub ring_overruns: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`] for JSON responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub underflow_samples: u64,
    pub render_quanta: u64,
    pub inbound_frames: u64,
    pub inbound_samples: u64,
    pub rejected_frames: u64,
    pub decode_warnings: u64,
    pub buffer_growths: u64,
    pub buffer_capacity: usize,
    pub barge_ins: u64,
    pub capture_quanta: u64,
    pub silent_quanta: u64,
    pub ring_overruns: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, amount: u64) {
        if amount > 0 {
            counter.fetch_add(amount, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            underflow_samples: load(&self.underflow_samples),
            render_quanta: load(&self.render_quanta),
            inbound_frames: load(&self.inbound_frames),
            inbound_samples: load(&self.inbound_samples),
            rejected_frames: load(&self.rejected_frames),
            decode_warnings: load(&self.decode_warnings),
            buffer_growths: load(&self.buffer_growths),
            buffer_capacity: self.buffer_capacity.load(Ordering::Relaxed),
            barge_ins: load(&self.barge_ins),
            capture_quanta: load(&self.capture_quanta),
            silent_quanta: load(&self.silent_quanta),
            ring_overruns: load(&self.ring_overruns),
            frames_sent: load(&self.frames_sent),
            frames_dropped: load(&self.frames_dropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = StreamStats::new();
        StreamStats::bump(&stats.frames_sent);
        StreamStats::add(&stats.underflow_samples, 512);
        stats.buffer_capacity.store(48_000, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_sent, 1);
        assert_eq!(snapshot.underflow_samples, 512);
        assert_eq!(snapshot.buffer_capacity, 48_000);
        assert_eq!(snapshot.frames_dropped, 0);
    }
}
