//! Transcriber abstraction.
//!
//! The `Transcriber` trait decouples the ASR Worker from any specific speech
//! recognition backend. The contract is intentionally opaque and single-shot:
//! given a complete, endpointed PCM buffer, return text. No streaming/partial
//! mode — `record_until_silence` already returns a finished utterance.
//!
//! `transcribe` takes `&self` rather than `&mut self`: implementations that
//! need internal mutation (decoder caches, a loaded session) guard it
//! themselves, since the contract promises callers may invoke concurrently
//! with capture.

pub mod stub;

use std::sync::Arc;

use crate::error::Result;

/// Result of a single transcription call.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    /// Recognised text. May be empty or whitespace-only — callers must handle that.
    pub text: String,
    /// Model confidence in `[0.0, 1.0]`, if the backend provides one.
    pub confidence: f32,
    /// Wall-clock duration of the input audio, in seconds.
    pub duration_s: f32,
}

/// Contract for speech recognition backends.
///
/// Must be safe to call concurrently with capture — the worker calls it from
/// its own thread while the HTTP surface may be running `/test/transcribe`
/// calls at the same time. Implementations need not be internally parallel;
/// a single lock around a stateful backend (see `TranscriberHandle`) is fine.
pub trait Transcriber: Send + Sync + 'static {
    /// One-time warm-up: load weights, run a dummy inference to populate
    /// caches. Called once at startup.
    fn warm_up(&self) -> Result<()>;

    /// Transcribe a mono f32 PCM buffer at `sample_rate`.
    ///
    /// `language` is an optional BCP-47-ish hint (e.g. `"en"`); backends that
    /// don't support language hints should ignore it.
    fn transcribe(&self, pcm: &[f32], sample_rate: u32, language: Option<&str>) -> Result<Transcription>;
}

/// Thread-safe reference-counted handle to any `Transcriber` implementor.
#[derive(Clone)]
pub struct TranscriberHandle(pub Arc<dyn Transcriber>);

impl TranscriberHandle {
    pub fn new<T: Transcriber>(transcriber: T) -> Self {
        Self(Arc::new(transcriber))
    }
}

impl std::fmt::Debug for TranscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriberHandle").finish_non_exhaustive()
    }
}

impl std::ops::Deref for TranscriberHandle {
    type Target = dyn Transcriber;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}
