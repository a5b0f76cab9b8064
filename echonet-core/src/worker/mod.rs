//! ASR Worker: the control loop tying capture, VAD, transcription, and
//! routing together.
//!
//! Runs on its own `std::thread` — `cpal::Stream` and therefore
//! `CaptureSession` are not `Send` on some platforms, so the device must be
//! opened, used, and dropped on one dedicated thread. The worker drives its
//! own small single-threaded Tokio runtime purely to `block_on` the
//! Router's async HTTP fan-out; it never touches the server's
//! multi-threaded runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        capture::{CaptureSession, RecordParams, TARGET_SAMPLE_RATE},
        preroll::PreRollBuffer,
    },
    inference::TranscriberHandle,
    router::{Router, TextEvent},
    state_manager::{ListenMode, StateManager},
};

/// Commands sent to a running worker over its control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Stop,
}

/// Tunables for one worker instance, sourced from `ECHONET_*` environment
/// variables at startup (§6).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub source_id: String,
    pub room: String,
    pub silence_duration_s: f32,
    pub min_duration_s: f32,
    pub trigger_max_duration_s: f32,
    pub active_max_duration_s: f32,
    pub energy_threshold: f32,
    pub use_ml_vad: bool,
    pub enable_preroll_buffer: bool,
    pub preroll_buffer_seconds: f32,
    pub language: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            source_id: "local-mic".to_string(),
            room: "default".to_string(),
            silence_duration_s: 1.0,
            min_duration_s: 0.5,
            trigger_max_duration_s: 10.0,
            active_max_duration_s: 30.0,
            energy_threshold: 0.01,
            use_ml_vad: true,
            enable_preroll_buffer: true,
            preroll_buffer_seconds: 2.0,
            language: None,
        }
    }
}

/// Outcome of one completed capture → (transcribe →) route cycle, used to
/// build the auto-reset reason string `active_mode_<outcome>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Completed,
    Empty,
    NoAudio,
}

impl CycleOutcome {
    fn as_str(self) -> &'static str {
        match self {
            CycleOutcome::Completed => "completed",
            CycleOutcome::Empty => "empty",
            CycleOutcome::NoAudio => "no_audio",
        }
    }
}

/// The main control-loop driver. Not `Send` in the sense that it must run
/// on the thread it was spawned on — `CaptureSession` inside it carries
/// platform device-thread affinity.
pub struct AsrWorker {
    state: Arc<StateManager>,
    router: Arc<Router>,
    transcriber: TranscriberHandle,
    config: WorkerConfig,
    commands: crossbeam_channel::Receiver<WorkerCommand>,
    stopped: Arc<AtomicBool>,
    capture: Option<CaptureSession>,
    preroll: Option<Arc<PreRollBuffer>>,
    /// Last `audio_device_index` observed from the State Manager, used only
    /// to detect a user-initiated change (`sync_device_selection`).
    configured_device_index: Option<usize>,
    /// Device index actually passed to `CaptureSession::open`. Diverges from
    /// `configured_device_index` after a forced fallback to the default
    /// device — reverted to match it again only when the user picks a
    /// *different* device, so the fallback isn't immediately undone by the
    /// next iteration re-reading the same unchanged setting.
    active_device_index: Option<usize>,
    backoff_step: u32,
    device_failure_count: u32,
}

/// Capped exponential backoff schedule for recoverable iteration failures:
/// 250ms → 500ms → 1s, then holds at 1s.
const BACKOFF_SCHEDULE_MS: &[u64] = &[250, 500, 1000];

/// After this many consecutive capture-open failures on the configured
/// device, give up on it and fall back to the default input device (§7).
const MAX_CONSECUTIVE_DEVICE_FAILURES: u32 = 3;

impl AsrWorker {
    pub fn new(
        state: Arc<StateManager>,
        router: Arc<Router>,
        transcriber: TranscriberHandle,
        config: WorkerConfig,
    ) -> (Self, crossbeam_channel::Sender<WorkerCommand>) {
        let (tx, rx) = crossbeam_channel::bounded(8);
        let preroll = if config.enable_preroll_buffer {
            Some(Arc::new(PreRollBuffer::new(config.preroll_buffer_seconds, TARGET_SAMPLE_RATE)))
        } else {
            None
        };
        let worker = Self {
            state,
            router,
            transcriber,
            config,
            commands: rx,
            stopped: Arc::new(AtomicBool::new(false)),
            capture: None,
            preroll,
            configured_device_index: None,
            active_device_index: None,
            backoff_step: 0,
            device_failure_count: 0,
        };
        (worker, tx)
    }

    /// Run the main loop until a `Stop` command is received. Intended to be
    /// the body of a dedicated `std::thread::spawn` closure.
    pub fn run(mut self) {
        info!("asr worker starting");

        if let Err(e) = self.transcriber.warm_up() {
            error!(error = %e, "transcriber warm_up failed; continuing — calls will surface per-iteration errors");
        }

        let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
            Ok(rt) => rt,
            Err(e) => {
                error!(error = %e, "asr worker failed to build its runtime; worker cannot start");
                return;
            }
        };

        while !self.stopped.load(Ordering::Relaxed) {
            self.drain_commands();
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }

            let outcome = self.run_iteration(&rt);
            match outcome {
                Ok(()) => self.backoff_step = 0,
                Err(e) => {
                    warn!(error = %e, "asr worker iteration failed; backing off");
                    self.backoff();
                }
            }
        }

        self.release_capture();
        info!("asr worker stopped");
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                WorkerCommand::Stop => self.stopped.store(true, Ordering::Relaxed),
            }
        }
    }

    fn backoff(&mut self) {
        let idx = (self.backoff_step as usize).min(BACKOFF_SCHEDULE_MS.len() - 1);
        let ms = BACKOFF_SCHEDULE_MS[idx];
        self.backoff_step += 1;
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn run_iteration(&mut self, rt: &tokio::runtime::Runtime) -> crate::error::Result<()> {
        let mode = self.state.get_listen_mode();
        self.sync_device_selection();

        match mode {
            ListenMode::Inactive => {
                self.release_capture();
                std::thread::sleep(Duration::from_millis(500));
                Ok(())
            }
            ListenMode::Trigger => {
                self.ensure_capture_open()?;
                self.run_cycle(rt, self.config.trigger_max_duration_s, false)
            }
            ListenMode::Active => {
                self.ensure_capture_open()?;
                self.run_cycle(rt, self.config.active_max_duration_s, true)
            }
        }
    }

    fn sync_device_selection(&mut self) {
        let current = self.state.get_audio_device_index();
        if current != self.configured_device_index {
            info!(?current, previous = ?self.configured_device_index, "audio_device_index changed; will adopt on next capture open");
            self.configured_device_index = current;
            self.active_device_index = current;
            self.device_failure_count = 0;
            self.release_capture();
        }
    }

    fn ensure_capture_open(&mut self) -> crate::error::Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let preroll = self.preroll.clone();
        match CaptureSession::open(self.active_device_index, preroll) {
            Ok(session) => {
                self.capture = Some(session);
                self.device_failure_count = 0;
                Ok(())
            }
            Err(e) => {
                self.device_failure_count += 1;
                if self.device_failure_count >= MAX_CONSECUTIVE_DEVICE_FAILURES
                    && self.active_device_index.is_some()
                {
                    warn!(
                        device_index = ?self.active_device_index,
                        failures = self.device_failure_count,
                        "configured audio device failed repeatedly; falling back to default device"
                    );
                    // Only `active_device_index` is cleared — `configured_device_index`
                    // keeps tracking the unchanged setting so the next iteration's
                    // `sync_device_selection` doesn't see a "change" and re-adopt the
                    // very index that's just been given up on.
                    self.active_device_index = None;
                    self.device_failure_count = 0;
                }
                Err(e)
            }
        }
    }

    fn release_capture(&mut self) {
        if self.capture.take().is_some() {
            debug!("releasing audio capture device");
        }
        if let Some(preroll) = &self.preroll {
            preroll.clear();
        }
    }

    /// Record one utterance, transcribe it, and route it if non-empty.
    /// In `active` mode, always performs the auto-reset-to-trigger write
    /// afterward regardless of outcome.
    fn run_cycle(&mut self, rt: &tokio::runtime::Runtime, max_duration_s: f32, is_active: bool) -> crate::error::Result<()> {
        let params = RecordParams {
            silence_duration_s: self.config.silence_duration_s,
            min_duration_s: self.config.min_duration_s,
            max_duration_s,
            energy_threshold: self.config.energy_threshold,
            use_ml_vad: self.config.use_ml_vad,
        };

        let stopped = Arc::clone(&self.stopped);
        let capture = self
            .capture
            .as_mut()
            .expect("ensure_capture_open must be called before run_cycle");

        let pcm = capture.record_until_silence(&params, move || !stopped.load(Ordering::Relaxed))?;

        let outcome = match pcm {
            None => CycleOutcome::NoAudio,
            Some(pcm) => {
                let transcription = self.transcriber.transcribe(&pcm, TARGET_SAMPLE_RATE, self.config.language.as_deref())?;
                if transcription.text.trim().is_empty() {
                    CycleOutcome::Empty
                } else {
                    let event = TextEvent {
                        source_id: self.config.source_id.clone(),
                        room: self.config.room.clone(),
                        ts: chrono::Utc::now().timestamp_millis(),
                        text: transcription.text,
                        confidence: transcription.confidence,
                    };
                    let mode = self.state.get_listen_mode();
                    let decision = rt.block_on(self.router.route(event, mode));
                    info!(
                        mode = ?decision.mode,
                        routed_to = ?decision.routed_to,
                        forwarded = decision.forwarded,
                        reason = %decision.reason,
                        "transcript routed"
                    );
                    CycleOutcome::Completed
                }
            }
        };

        if is_active {
            let reason = format!("active_mode_{}", outcome.as_str());
            self.state.set_listen_mode(ListenMode::Trigger, "asr_worker", Some(&reason))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.silence_duration_s, 1.0);
        assert_eq!(config.min_duration_s, 0.5);
        assert_eq!(config.trigger_max_duration_s, 10.0);
        assert_eq!(config.active_max_duration_s, 30.0);
    }

    #[test]
    fn cycle_outcome_reason_strings() {
        assert_eq!(CycleOutcome::Completed.as_str(), "completed");
        assert_eq!(CycleOutcome::Empty.as_str(), "empty");
        assert_eq!(CycleOutcome::NoAudio.as_str(), "no_audio");
    }

    #[test]
    fn backoff_schedule_caps_at_last_entry() {
        assert_eq!(BACKOFF_SCHEDULE_MS, &[250, 500, 1000]);
    }

    #[test]
    fn repeated_device_failure_falls_back_to_default() {
        use crate::inference::stub::StubTranscriber;
        use crate::registry::Registry;
        use crate::state_manager::StateManager;
        use crate::store::Store;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("worker.db")).unwrap());
        let registry = Arc::new(Registry::new(Arc::clone(&store)).unwrap());
        let state = Arc::new(StateManager::new(store));
        let router = Arc::new(Router::new(registry, vec![], 25));
        let transcriber = TranscriberHandle::new(StubTranscriber::new());

        let (mut worker, _tx) = AsrWorker::new(state, router, transcriber, WorkerConfig::default());
        // No device at this index exists in a headless test environment, so
        // every `ensure_capture_open` call here fails.
        worker.active_device_index = Some(9999);

        assert!(worker.ensure_capture_open().is_err());
        assert_eq!(worker.device_failure_count, 1);
        assert_eq!(worker.active_device_index, Some(9999));

        assert!(worker.ensure_capture_open().is_err());
        assert_eq!(worker.device_failure_count, 2);

        assert!(worker.ensure_capture_open().is_err());
        // Third consecutive failure: falls back to the default device and
        // resets the counter.
        assert_eq!(worker.device_failure_count, 0);
        assert_eq!(worker.active_device_index, None);
    }

    #[test]
    fn fallback_is_not_immediately_undone_by_unchanged_setting() {
        use crate::inference::stub::StubTranscriber;
        use crate::registry::Registry;
        use crate::state_manager::StateManager;
        use crate::store::Store;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("worker2.db")).unwrap());
        let registry = Arc::new(Registry::new(Arc::clone(&store)).unwrap());
        let state = Arc::new(StateManager::new(store));
        state.set_audio_device_index(9999, "test").unwrap();
        let router = Arc::new(Router::new(registry, vec![], 25));
        let transcriber = TranscriberHandle::new(StubTranscriber::new());

        let (mut worker, _tx) = AsrWorker::new(state, router, transcriber, WorkerConfig::default());
        // First sync adopts the persisted setting.
        worker.sync_device_selection();
        assert_eq!(worker.active_device_index, Some(9999));

        for _ in 0..MAX_CONSECUTIVE_DEVICE_FAILURES {
            let _ = worker.ensure_capture_open();
        }
        assert_eq!(worker.active_device_index, None);

        // The underlying setting hasn't changed — a subsequent sync must not
        // re-adopt the index that was just given up on.
        worker.sync_device_selection();
        assert_eq!(worker.active_device_index, None);
    }
}
