use thiserror::Error;

/// All errors produced by echonet-core.
#[derive(Debug, Error)]
pub enum EchoNetError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("ring buffer is full — capture cannot keep up")]
    RingBufferFull,

    #[error("inference error: {0}")]
    Inference(String),

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("worker is not running")]
    NotRunning,

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid listen mode: {0}")]
    InvalidMode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("unsupported schema version {found}, expected at most {max}")]
    SchemaVersion { found: u32, max: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EchoNetError>;
