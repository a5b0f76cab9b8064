//! # echonet-core
//!
//! Voice event router and session manager core library.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → CaptureSession::record_until_silence
//!                                                    │
//!                                              VAD endpointing
//!                                                    │
//!                                           Transcriber::transcribe
//!                                                    │
//!                                            Router::route  ──► Target HTTP (/listen)
//! ```
//!
//! `Store` / `Registry` / `StateManager` form the persistence and
//! configuration layer shared by the ASR Worker (a dedicated OS thread) and
//! the HTTP surface (in `echonet-server`, on the async runtime). Neither
//! side shares mutable state directly with the other — they only meet at
//! these three types' locked interiors.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod error;
pub mod inference;
pub mod registry;
pub mod router;
pub mod state_manager;
pub mod store;
pub mod vad;
pub mod worker;

pub use error::{EchoNetError, Result};
pub use inference::{Transcriber, TranscriberHandle, Transcription};
pub use registry::{PhraseIndex, Registry};
pub use router::{RouteDecision, RouteMode, Router, TextEvent};
pub use state_manager::{ListenMode, StateManager};
pub use store::{SettingChange, Store, Target};
pub use worker::{AsrWorker, WorkerCommand, WorkerConfig};
