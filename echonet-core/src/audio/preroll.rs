//! Rolling pre-roll buffer of the most recently captured PCM samples.
//!
//! Distinct from `buffering::AudioProducer`/`AudioConsumer` — that SPSC ring
//! exists purely to hand raw samples from the realtime audio callback to the
//! capture thread without allocation. `PreRollBuffer` serves a different
//! purpose: a multi-reader `snapshot()` of "the last N seconds", which the
//! SPSC consumer/producer split cannot provide since taking it does not
//! consume the underlying samples.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Fixed-capacity FIFO buffer of mono f32 PCM samples at a known sample rate.
pub struct PreRollBuffer {
    samples: Mutex<VecDeque<f32>>,
    capacity: usize,
}

impl PreRollBuffer {
    /// Create a buffer holding up to `duration_seconds` of audio at `sample_rate`.
    pub fn new(duration_seconds: f32, sample_rate: u32) -> Self {
        let capacity = (duration_seconds.max(0.0) as f64 * sample_rate as f64).round() as usize;
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append new samples, evicting the oldest ones on overflow.
    pub fn push(&self, chunk: &[f32]) {
        if self.capacity == 0 {
            return;
        }
        let mut buf = self.samples.lock();
        buf.extend(chunk.iter().copied());
        let overflow = buf.len().saturating_sub(self.capacity);
        if overflow > 0 {
            buf.drain(..overflow);
        }
    }

    /// Copy of the current buffered contents, oldest-first.
    pub fn snapshot(&self) -> Vec<f32> {
        self.samples.lock().iter().copied().collect()
    }

    /// Discard all buffered samples (called on transition to inactive mode).
    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_eviction_keeps_last_capacity_samples() {
        let buf = PreRollBuffer::new(0.01, 1000); // capacity = 10
        let sequence: Vec<f32> = (0..25).map(|i| i as f32).collect();
        for chunk in sequence.chunks(3) {
            buf.push(chunk);
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 10);
        assert_eq!(snap, sequence[15..25]);
    }

    #[test]
    fn snapshot_does_not_consume() {
        let buf = PreRollBuffer::new(1.0, 100); // capacity = 100
        buf.push(&[1.0, 2.0, 3.0]);
        let first = buf.snapshot();
        let second = buf.snapshot();
        assert_eq!(first, second);
    }

    #[test]
    fn clear_empties_buffer() {
        let buf = PreRollBuffer::new(1.0, 100);
        buf.push(&[1.0, 2.0, 3.0]);
        buf.clear();
        assert!(buf.snapshot().is_empty());
    }

    #[test]
    fn zero_capacity_buffer_stays_empty() {
        let buf = PreRollBuffer::new(0.0, 16000);
        buf.push(&[1.0, 2.0, 3.0]);
        assert!(buf.snapshot().is_empty());
    }
}
