//! `StubTranscriber` — placeholder backend that echoes metadata without real inference.
//!
//! Used when no real ASR backend is configured. Produces a deterministic
//! transcript so the full capture → VAD → route pipeline can be exercised
//! end-to-end without a model file on disk.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::error::Result;
use crate::inference::{Transcriber, Transcription};

/// Echo-style stub transcriber.
///
/// For any non-trivial PCM buffer it returns `"[stub: <N> samples @ <SR> Hz]"`
/// with `confidence = 1.0`. Buffers shorter than 160 samples (10 ms at 16 kHz)
/// are treated as silence and return an empty transcription.
pub struct StubTranscriber {
    utterance_count: AtomicU32,
}

impl StubTranscriber {
    pub fn new() -> Self {
        Self { utterance_count: AtomicU32::new(0) }
    }
}

impl Default for StubTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcriber for StubTranscriber {
    fn warm_up(&self) -> Result<()> {
        debug!("StubTranscriber::warm_up — no-op");
        Ok(())
    }

    fn transcribe(&self, pcm: &[f32], sample_rate: u32, _language: Option<&str>) -> Result<Transcription> {
        if pcm.len() < 160 {
            return Ok(Transcription {
                text: String::new(),
                confidence: 0.0,
                duration_s: pcm.len() as f32 / sample_rate.max(1) as f32,
            });
        }

        self.utterance_count.fetch_add(1, Ordering::Relaxed);
        let duration_s = pcm.len() as f32 / sample_rate.max(1) as f32;

        Ok(Transcription {
            text: format!("[stub: {} samples @ {} Hz]", pcm.len(), sample_rate),
            confidence: 1.0,
            duration_s,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_buffer_is_empty_transcription() {
        let t = StubTranscriber::new();
        let out = t.transcribe(&[0.0; 40], 16000, None).unwrap();
        assert!(out.text.is_empty());
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn non_trivial_buffer_produces_placeholder_text() {
        let t = StubTranscriber::new();
        let pcm = vec![0.1f32; 4000];
        let out = t.transcribe(&pcm, 16000, None).unwrap();
        assert!(out.text.contains("4000"));
        assert!(out.text.contains("16000"));
        assert_eq!(out.confidence, 1.0);
        assert!((out.duration_s - 0.25).abs() < 1e-4);
    }
}
