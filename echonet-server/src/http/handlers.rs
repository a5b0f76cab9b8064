//! Thin HTTP handlers delegating to `AppState`'s core types — one small
//! request/response struct per route, `Json`/`Path`/`Query` extractors
//! doing all the parsing so handler bodies stay a few lines each.

use std::str::FromStr;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use echonet_core::audio::device;
use echonet_core::router::TextEvent;
use echonet_core::state_manager::ListenMode;
use echonet_core::store::Target;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::AppError;

use super::state::AppState;

// ---------------------------------------------------------------------
// /register, /targets
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub base_url: String,
    pub phrases: Vec<String>,
}

pub async fn register_target(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Target>, AppError> {
    let target = state.registry.upsert(Target {
        name: req.name,
        base_url: req.base_url,
        phrases: req.phrases,
    })?;
    Ok(Json(target))
}

pub async fn list_targets(State(state): State<AppState>) -> Result<Json<Vec<Target>>, AppError> {
    Ok(Json(state.registry.list()?))
}

pub async fn delete_target(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.registry.delete(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------
// /state, /state/history
// ---------------------------------------------------------------------

pub async fn get_state(State(state): State<AppState>) -> Json<serde_json::Value> {
    let settings = state.state_manager.all_settings();
    Json(json!({
        "listen_mode": state.state_manager.get_listen_mode().as_str(),
        "audio_device_index": state.state_manager.get_audio_device_index(),
        "settings": settings.into_iter().collect::<std::collections::HashMap<_, _>>(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct StateUpdateRequest {
    /// Name of the setting this update targets — for this endpoint it must
    /// be `"listen_mode"`; any other value is rejected so a client can't
    /// accidentally aim a mode change at the wrong control surface.
    pub target: String,
    pub source: String,
    pub state: String,
    pub reason: Option<String>,
}

pub async fn put_state(
    State(state): State<AppState>,
    Json(req): Json<StateUpdateRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.target != "listen_mode" {
        return Err(AppError(echonet_core::EchoNetError::InvalidConfig(format!(
            "unknown state target '{}', expected 'listen_mode'",
            req.target
        ))));
    }
    let mode = ListenMode::from_str(&req.state)?;
    state
        .state_manager
        .set_listen_mode(mode, &req.source, req.reason.as_deref())?;
    Ok(Json(json!({ "listen_mode": mode.as_str() })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub name: Option<String>,
    pub limit: Option<usize>,
}

pub async fn get_state_history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<echonet_core::store::SettingChange>>, AppError> {
    let history = state.store.history(q.name.as_deref(), q.limit.unwrap_or(100))?;
    Ok(Json(history))
}

// ---------------------------------------------------------------------
// /text
// ---------------------------------------------------------------------

pub async fn post_text(
    State(state): State<AppState>,
    Json(event): Json<TextEvent>,
) -> Json<echonet_core::router::RouteDecision> {
    let mode = state.state_manager.get_listen_mode();
    let decision = state.router.route(event, mode).await;
    Json(decision)
}

// ---------------------------------------------------------------------
// /audio/devices, /audio/device
// ---------------------------------------------------------------------

pub async fn list_audio_devices(State(state): State<AppState>) -> Json<serde_json::Value> {
    let devices = device::list_input_devices();
    let current = state.state_manager.get_audio_device_index();
    Json(json!({ "devices": devices, "current_device_index": current }))
}

#[derive(Debug, Deserialize)]
pub struct SetDeviceRequest {
    pub device_index: usize,
}

pub async fn put_audio_device(
    State(state): State<AppState>,
    Json(req): Json<SetDeviceRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let devices = device::list_input_devices();
    if req.device_index >= devices.len() {
        return Err(AppError(echonet_core::EchoNetError::InvalidConfig(format!(
            "device index {} out of range (0..{})",
            req.device_index,
            devices.len()
        ))));
    }
    state.state_manager.set_audio_device_index(req.device_index, "api")?;
    Ok(Json(json!({ "device_index": req.device_index })))
}

// ---------------------------------------------------------------------
// /config, /config/{key}
// ---------------------------------------------------------------------

pub async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let settings: std::collections::HashMap<_, _> = state.state_manager.all_settings().into_iter().collect();
    Json(json!({ "settings": settings }))
}

#[derive(Debug, Deserialize)]
pub struct ConfigValueRequest {
    pub value: String,
    pub reason: Option<String>,
}

pub async fn put_config_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<ConfigValueRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.state_manager.set_raw(&key, &req.value, "api", req.reason.as_deref())?;
    Ok(Json(json!({ key: req.value })))
}

// ---------------------------------------------------------------------
// /test/transcribe
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TestTranscribeResponse {
    pub text: String,
    pub confidence: f32,
    pub duration_s: f32,
    pub route: Option<echonet_core::router::RouteDecision>,
}

/// Capture-less transcription: decode an uploaded WAV file, run it through
/// the Transcriber, and optionally route the result — lets an operator
/// exercise the VAD-free half of the pipeline (transcribe → route) without
/// a live microphone.
pub async fn test_transcribe(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<TestTranscribeResponse>, AppError> {
    let mut pcm: Option<Vec<f32>> = None;
    let mut sample_rate: u32 = 16_000;
    let mut source_id: Option<String> = None;
    let mut room = "default".to_string();
    let mut do_route = false;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError(echonet_core::EchoNetError::InvalidConfig(format!("multipart error: {e}")))
    })? {
        match field.name().unwrap_or_default() {
            "audio" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError(echonet_core::EchoNetError::InvalidConfig(e.to_string())))?;
                let (samples, rate) = decode_wav(&bytes)?;
                pcm = Some(samples);
                sample_rate = rate;
            }
            "source_id" => {
                source_id = field.text().await.ok().filter(|s| !s.is_empty());
            }
            "room" => {
                if let Ok(text) = field.text().await {
                    room = text;
                }
            }
            "route" => {
                do_route = matches!(field.text().await.as_deref(), Ok("true") | Ok("1"));
            }
            _ => {}
        }
    }

    let pcm = pcm.ok_or_else(|| {
        AppError(echonet_core::EchoNetError::InvalidConfig("missing 'audio' field".to_string()))
    })?;

    let transcription = state.transcriber.transcribe(&pcm, sample_rate, None)?;

    let route = if do_route && !transcription.text.trim().is_empty() {
        let event = TextEvent {
            source_id: source_id.unwrap_or_else(|| "test-transcribe".to_string()),
            room,
            ts: chrono::Utc::now().timestamp_millis(),
            text: transcription.text.clone(),
            confidence: transcription.confidence,
        };
        let mode = state.state_manager.get_listen_mode();
        Some(state.router.route(event, mode).await)
    } else {
        None
    };

    Ok(Json(TestTranscribeResponse {
        text: transcription.text,
        confidence: transcription.confidence,
        duration_s: transcription.duration_s,
        route,
    }))
}

fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32), AppError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut reader = hound::WavReader::new(cursor)
        .map_err(|e| AppError(echonet_core::EchoNetError::InvalidConfig(format!("invalid wav: {e}"))))?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError(echonet_core::EchoNetError::InvalidConfig(e.to_string())))?,
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError(echonet_core::EchoNetError::InvalidConfig(e.to_string())))?
        }
    };

    // Downmix to mono by averaging channels, so capture-less testing accepts
    // stereo WAVs the same way `AudioCapture`'s stream callback does.
    let mono = if spec.channels > 1 {
        let ch = spec.channels as usize;
        samples
            .chunks(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    } else {
        samples
    };

    Ok((mono, spec.sample_rate))
}

// ---------------------------------------------------------------------
// /healthz
// ---------------------------------------------------------------------

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    // Store reads never touch disk after warmup (§4.A) — a cache read here
    // is enough to prove the process and its Store are both alive.
    let _ = state.store.all_settings();
    Json(json!({ "status": "ok" }))
}
