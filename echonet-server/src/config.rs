//! Environment-variable configuration loading.
//!
//! A single `Config::from_env()` constructor reads every `ECHONET_*`
//! variable once at startup into a typed struct. Parsing is hand-rolled
//! rather than pulled in from a config-file crate — there's no config file,
//! just environment variables.

use std::path::PathBuf;

use echonet_core::store::Store;
use echonet_core::worker::WorkerConfig;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_opt_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Everything the process needs to start, read once from `ECHONET_*`
/// environment variables (§6).
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub api_key: Option<String>,
    pub admin_key: Option<String>,
    pub http_bind: String,
    pub log_directive: String,
    pub initial_listen_mode: String,
    pub audio_device_index: Option<usize>,
    pub session_ttl_seconds: i64,
    pub cancel_phrases: Vec<String>,
    pub source_id: String,
    pub room: String,
    pub worker: WorkerConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let db_path = std::env::var_os("ECHONET_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(Store::default_db_path);

        let cancel_phrases = env_opt_string("ECHONET_CANCEL_PHRASES")
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let worker = WorkerConfig {
            source_id: env_string("ECHONET_SOURCE_ID", "local-mic"),
            room: env_string("ECHONET_ROOM", "default"),
            silence_duration_s: env_f32("ECHONET_AUDIO_SILENCE_DURATION", 1.0),
            min_duration_s: env_f32("ECHONET_AUDIO_MIN_DURATION", 0.5),
            trigger_max_duration_s: 10.0,
            active_max_duration_s: env_f32("ECHONET_AUDIO_MAX_DURATION", 30.0),
            energy_threshold: env_f32("ECHONET_AUDIO_ENERGY_THRESHOLD", 0.01),
            use_ml_vad: env_bool("ECHONET_AUDIO_USE_ML_VAD", true),
            enable_preroll_buffer: env_bool("ECHONET_ENABLE_PREROLL_BUFFER", true),
            preroll_buffer_seconds: env_f32("ECHONET_PREROLL_BUFFER_SECONDS", 2.0).clamp(0.5, 10.0),
            language: env_opt_string("ECHONET_LANGUAGE"),
        };

        Self {
            db_path,
            api_key: env_opt_string("ECHONET_API_KEY"),
            admin_key: env_opt_string("ECHONET_ADMIN_KEY"),
            http_bind: env_string("ECHONET_HTTP_BIND", "127.0.0.1:8787"),
            log_directive: env_string("ECHONET_LOG", "echonet=info"),
            initial_listen_mode: env_string("ECHONET_INITIAL_LISTEN_MODE", "trigger"),
            audio_device_index: env_usize("ECHONET_AUDIO_DEVICE_INDEX"),
            session_ttl_seconds: env_i64("ECHONET_SESSION_TTL_SECONDS", 25),
            cancel_phrases,
            source_id: env_string("ECHONET_SOURCE_ID", "local-mic"),
            room: env_string("ECHONET_ROOM", "default"),
            worker,
        }
    }
}
