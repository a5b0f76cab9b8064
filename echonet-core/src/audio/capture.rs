//! Call-and-return speech capture: `CaptureSession::record_until_silence`.
//!
//! A blocking function that records one endpointed utterance from an
//! already-open device and returns. The device is opened once (when the
//! worker enters `trigger` or `active` mode) and held for the session's
//! lifetime — reopening per utterance would drop the leading edge of fast
//! follow-up speech and defeat the pre-roll buffer's purpose.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tracing::{debug, warn};

use crate::{
    audio::{preroll::PreRollBuffer, resample::RateConverter, AudioCapture},
    buffering::{chunk::AudioChunk, create_audio_ring, AudioConsumer, Consumer},
    error::Result,
    vad::{energy::EnergyVad, VoiceActivityDetector},
};

#[cfg(feature = "ml-vad")]
use crate::vad::SileroVad;

/// Canonical sample rate the rest of the pipeline (VAD, transcriber) expects.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// How long to poll the ring buffer for new samples before re-checking stop/endpoint state.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long capture may run with no speech observed at all before giving up.
const STARTUP_GATE_S: f32 = 3.0;

/// Frame size fed to the VAD, in seconds.
const VAD_FRAME_S: f32 = 0.05;

/// Parameters controlling one `record_until_silence` call.
#[derive(Debug, Clone)]
pub struct RecordParams {
    pub silence_duration_s: f32,
    pub min_duration_s: f32,
    pub max_duration_s: f32,
    pub energy_threshold: f32,
    pub use_ml_vad: bool,
}

impl Default for RecordParams {
    fn default() -> Self {
        Self {
            silence_duration_s: 1.0,
            min_duration_s: 0.5,
            max_duration_s: 30.0,
            energy_threshold: 0.01,
            use_ml_vad: true,
        }
    }
}

/// An open audio device plus the machinery needed to repeatedly record
/// endpointed utterances from it without reopening the device each time.
///
/// Not `Send` — must be created, used, and dropped on the same OS thread
/// (the ASR Worker's dedicated thread), since `cpal::Stream` carries
/// platform thread affinity.
pub struct CaptureSession {
    _capture: AudioCapture,
    consumer: AudioConsumer,
    resampler: RateConverter,
    preroll: Option<Arc<PreRollBuffer>>,
    running: Arc<AtomicBool>,
}

impl CaptureSession {
    /// Open `device_index` (or the default/recommended device when `None`)
    /// and begin capture. `preroll`, if given, receives every captured frame
    /// so its `snapshot()` always reflects the last N seconds of audio.
    pub fn open(device_index: Option<usize>, preroll: Option<Arc<PreRollBuffer>>) -> Result<Self> {
        let (producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let capture = AudioCapture::open_by_index(producer, Arc::clone(&running), device_index)?;
        let resampler = RateConverter::new(capture.sample_rate, TARGET_SAMPLE_RATE, 960)?;

        Ok(Self {
            _capture: capture,
            consumer,
            resampler,
            preroll,
            running,
        })
    }

    /// Stop and release the underlying device.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Record one endpointed utterance.
    ///
    /// Returns `Ok(None)` when no speech is observed within the startup
    /// window. Blocks on `stop_signal` via `should_continue` — check it
    /// between polls so a worker shutdown request aborts promptly.
    pub fn record_until_silence(
        &mut self,
        params: &RecordParams,
        should_continue: impl Fn() -> bool,
    ) -> Result<Option<Vec<f32>>> {
        let mut energy_vad = EnergyVad::new(params.energy_threshold, 4);

        #[cfg(feature = "ml-vad")]
        let mut ml_vad: Option<SileroVad> = if params.use_ml_vad {
            match SileroVad::new(SileroVad::default_model_path(), 0.2) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("ml-vad requested but SileroVad failed to load ({e}); using energy VAD only");
                    None
                }
            }
        } else {
            None
        };

        let frame_samples = (VAD_FRAME_S * TARGET_SAMPLE_RATE as f32).round() as usize;
        let mut poll_buf = vec![0f32; 4096];

        // Snapshot whatever pre-trigger audio has already accumulated, before
        // this call pushes any of its own samples — otherwise the snapshot
        // taken at the end would just be this call's own tail, duplicated.
        let preroll_prefix = self.preroll.as_ref().map(|p| p.snapshot()).filter(|s| !s.is_empty());

        let mut recorded: Vec<f32> = Vec::new();
        let mut frame_accum: Vec<f32> = Vec::new();
        let mut silence_run_s = 0f32;
        let mut speech_observed = false;

        loop {
            if !should_continue() {
                debug!("record_until_silence: stop requested");
                return Ok(None);
            }

            let n = self.consumer.pop_slice(&mut poll_buf);
            if n == 0 {
                std::thread::sleep(POLL_INTERVAL);
            } else {
                let resampled = self.resampler.process(&poll_buf[..n]);
                if let Some(preroll) = &self.preroll {
                    preroll.push(&resampled);
                }
                recorded.extend_from_slice(&resampled);
                frame_accum.extend_from_slice(&resampled);
            }

            while frame_accum.len() >= frame_samples {
                let frame: Vec<f32> = frame_accum.drain(..frame_samples).collect();
                let chunk = AudioChunk::new(frame, TARGET_SAMPLE_RATE);

                let energy_decision = energy_vad.classify(&chunk);

                #[cfg(feature = "ml-vad")]
                let decision = match &mut ml_vad {
                    Some(vad) if energy_decision.is_speech() => vad.classify(&chunk),
                    _ => energy_decision,
                };
                #[cfg(not(feature = "ml-vad"))]
                let decision = energy_decision;

                if decision.is_speech() {
                    speech_observed = true;
                    silence_run_s = 0.0;
                } else {
                    silence_run_s += VAD_FRAME_S;
                }
            }

            let elapsed_s = recorded.len() as f32 / TARGET_SAMPLE_RATE as f32;

            if !speech_observed && elapsed_s >= STARTUP_GATE_S {
                debug!("record_until_silence: no speech within startup window");
                return Ok(None);
            }

            if speech_observed
                && silence_run_s >= params.silence_duration_s
                && elapsed_s >= params.min_duration_s
            {
                break;
            }

            if elapsed_s >= params.max_duration_s {
                warn!(elapsed_s, "record_until_silence: hit hard cap");
                break;
            }
        }

        if !speech_observed {
            return Ok(None);
        }

        // Prepend pre-trigger audio, if any, so speech uttered just before
        // this call started is not lost. The pre-roll snapshot is raw PCM,
        // not re-run through VAD — only live frames are ever classified.
        if let Some(mut prefix) = preroll_prefix {
            prefix.extend(recorded);
            return Ok(Some(prefix));
        }

        Ok(Some(recorded))
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}
