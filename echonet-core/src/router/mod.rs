//! Router / Session Engine: wake-phrase matching, per-source session
//! lifecycle, and target HTTP fan-out.
//!
//! One decision point classifies each finished transcript and dispatches it
//! to a downstream HTTP target, tracking per-source session state so a
//! wake phrase opens a window of follow-up utterances instead of requiring
//! one per utterance.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{registry::Registry, state_manager::ListenMode};

/// Default cancel phrases when `ECHONET_CANCEL_PHRASES` is unset or empty.
pub const DEFAULT_CANCEL_PHRASES: &[&str] = &["never mind", "cancel", "stop"];

const DEFAULT_TTL_SECONDS: i64 = 25;

/// Normalize transcript text for matching: lowercase, strip punctuation,
/// collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let stripped: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

/// Incoming transcript to be routed, from either the ASR Worker or the
/// `/text` HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEvent {
    pub source_id: String,
    pub room: String,
    pub ts: i64,
    pub text: String,
    pub confidence: f32,
}

/// Tagged outcome of a routing decision — replaces any ad-hoc boolean flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    SessionOpen,
    SessionContinue,
    SessionEnd,
    Ignored,
}

/// Per-source open conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub source_id: String,
    pub target: String,
    pub room: String,
    pub opened_at: i64,
    pub last_ts: i64,
    pub ttl_seconds: i64,
}

impl Session {
    /// `now` and `last_ts` are both unix-ms (per `TextEvent.ts`); `ttl_seconds`
    /// is a duration in seconds, so it's converted to ms before comparing.
    fn is_expired(&self, now: i64) -> bool {
        now - self.last_ts > self.ttl_seconds * 1000
    }
}

/// Result of routing one `TextEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub handled: bool,
    pub routed_to: Option<String>,
    pub mode: RouteMode,
    pub session: Option<Session>,
    pub forwarded: bool,
    pub reason: String,
}

impl RouteDecision {
    fn ignored(reason: impl Into<String>) -> Self {
        Self {
            handled: false,
            routed_to: None,
            mode: RouteMode::Ignored,
            session: None,
            forwarded: false,
            reason: reason.into(),
        }
    }
}

/// Body posted to a target's `base_url + /listen`.
#[derive(Debug, Clone, Serialize)]
struct ListenPayload<'a> {
    source_id: &'a str,
    room: &'a str,
    ts: i64,
    text: &'a str,
    confidence: f32,
    session_id: &'a str,
    target: &'a str,
    reason: &'a str,
}

/// The core policy engine. Owns per-source session state and the
/// outbound HTTP client used for target fan-out.
///
/// Sessions are kept behind a single coarse `parking_lot::Mutex` — with at
/// most one entry per live microphone source, contention here is low, so a
/// per-source lock would be premature.
pub struct Router {
    registry: std::sync::Arc<Registry>,
    sessions: Mutex<HashMap<String, Session>>,
    /// Last target successfully forwarded to, across all sources — used by
    /// `active` mode's "no session exists" fallback.
    last_target: Mutex<Option<String>>,
    cancel_phrases: Vec<String>,
    default_ttl_seconds: i64,
    http: reqwest::Client,
}

/// Outcome of one fan-out attempt, surfaced in `RouteDecision.reason` as
/// `target_error:<kind>` when every attempt is exhausted.
#[derive(Debug)]
enum FanOutError {
    Network(String),
    Status(u16),
}

impl FanOutError {
    fn kind(&self) -> String {
        match self {
            FanOutError::Network(_) => "network".to_string(),
            FanOutError::Status(code) => format!("status_{code}"),
        }
    }
}

impl Router {
    pub fn new(registry: std::sync::Arc<Registry>, cancel_phrases: Vec<String>, default_ttl_seconds: i64) -> Self {
        let cancel_phrases = if cancel_phrases.is_empty() {
            DEFAULT_CANCEL_PHRASES.iter().map(|s| s.to_string()).collect()
        } else {
            cancel_phrases
        };

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            registry,
            sessions: Mutex::new(HashMap::new()),
            last_target: Mutex::new(None),
            cancel_phrases: cancel_phrases.into_iter().map(|p| normalize_text(&p)).collect(),
            default_ttl_seconds: if default_ttl_seconds > 0 { default_ttl_seconds } else { DEFAULT_TTL_SECONDS },
            http,
        }
    }

    /// Route one transcript according to the current `listen_mode`.
    ///
    /// Inactive mode is never expected to reach this call in steady state
    /// (the worker doesn't transcribe), but `/text` can bypass audio
    /// entirely — it is treated identically to `trigger` mode here.
    pub async fn route(&self, event: TextEvent, mode: ListenMode) -> RouteDecision {
        let normalized = normalize_text(&event.text);

        if normalized.is_empty() {
            return RouteDecision::ignored("no_match");
        }

        // 1. Cancel check.
        if self.cancel_phrases.iter().any(|p| normalized.contains(p.as_str())) {
            let had_session = self.sessions.lock().remove(&event.source_id).is_some();
            if had_session {
                info!(source_id = %event.source_id, "session cancelled by cancel phrase");
            }
            return RouteDecision {
                handled: true,
                routed_to: None,
                mode: RouteMode::SessionEnd,
                session: None,
                forwarded: false,
                reason: "cancel_phrase".to_string(),
            };
        }

        // 2. Active (non-expired) session.
        let existing = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&event.source_id) {
                Some(s) if !s.is_expired(event.ts) => {
                    let mut refreshed = s.clone();
                    refreshed.last_ts = event.ts;
                    sessions.insert(event.source_id.clone(), refreshed.clone());
                    Some(refreshed)
                }
                Some(_) => {
                    sessions.remove(&event.source_id);
                    None
                }
                None => None,
            }
        };

        if let Some(session) = existing {
            return self
                .forward(&event, &session.target, RouteMode::SessionContinue, "session", session)
                .await;
        }

        // In `active` mode, skip the wake-phrase requirement entirely:
        // route to the most-recently-used target if there's no session.
        if mode == ListenMode::Active {
            if let Some(target) = self.last_target.lock().clone() {
                let session = self.open_session(&event, &target);
                return self
                    .forward(&event, &target, RouteMode::SessionOpen, "active_mode_fallback", session)
                    .await;
            }
            return RouteDecision::ignored("no_match");
        }

        // 3. Wake-phrase scan, longest match first.
        let phrase_map = self.registry.phrase_map();
        let hit = phrase_map
            .iter_longest_first()
            .find(|(phrase, _)| normalized.contains(phrase));

        if let Some((phrase, target_name)) = hit {
            let target_name = target_name.to_string();
            let session = self.open_session(&event, &target_name);
            let reason = format!("trigger_phrase:{phrase}");
            return self
                .forward(&event, &target_name, RouteMode::SessionOpen, &reason, session)
                .await;
        }

        // 4. No match.
        RouteDecision::ignored("no_match")
    }

    fn open_session(&self, event: &TextEvent, target: &str) -> Session {
        let session = Session {
            source_id: event.source_id.clone(),
            target: target.to_string(),
            room: event.room.clone(),
            opened_at: event.ts,
            last_ts: event.ts,
            ttl_seconds: self.default_ttl_seconds,
        };
        self.sessions.lock().insert(event.source_id.clone(), session.clone());
        session
    }

    async fn forward(
        &self,
        event: &TextEvent,
        target_name: &str,
        mode: RouteMode,
        reason: &str,
        session: Session,
    ) -> RouteDecision {
        let target = match self.registry.get(target_name) {
            Ok(Some(t)) => t,
            Ok(None) => {
                warn!(target = target_name, "session references a deleted target");
                self.sessions.lock().remove(&event.source_id);
                return RouteDecision::ignored("no_match");
            }
            Err(e) => {
                warn!(target = target_name, error = %e, "registry lookup failed");
                return RouteDecision {
                    handled: true,
                    routed_to: Some(target_name.to_string()),
                    mode,
                    session: Some(session),
                    forwarded: false,
                    reason: "target_error:registry".to_string(),
                };
            }
        };

        match self.post_listen(&target.base_url, event, target_name, reason).await {
            Ok(()) => {
                *self.last_target.lock() = Some(target_name.to_string());
                RouteDecision {
                    handled: true,
                    routed_to: Some(target_name.to_string()),
                    mode,
                    session: Some(session),
                    forwarded: true,
                    reason: reason.to_string(),
                }
            }
            Err(e) => {
                warn!(target = target_name, kind = %e.kind(), "target fan-out failed after retry");
                RouteDecision {
                    handled: true,
                    routed_to: Some(target_name.to_string()),
                    mode,
                    session: Some(session),
                    forwarded: false,
                    reason: format!("target_error:{}", e.kind()),
                }
            }
        }
    }

    /// POST to `{base_url}/listen`, with one retry on transient network
    /// failure or a 5xx response; no retry on 4xx.
    async fn post_listen(
        &self,
        base_url: &str,
        event: &TextEvent,
        target_name: &str,
        reason: &str,
    ) -> Result<(), FanOutError> {
        let url = format!("{}/listen", base_url.trim_end_matches('/'));
        let payload = ListenPayload {
            source_id: &event.source_id,
            room: &event.room,
            ts: event.ts,
            text: &event.text,
            confidence: event.confidence,
            session_id: &event.source_id,
            target: target_name,
            reason,
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.http.post(&url).json(&payload).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    if status.is_client_error() {
                        return Err(FanOutError::Status(status.as_u16()));
                    }
                    // 5xx: retry once.
                    if attempts >= 2 {
                        return Err(FanOutError::Status(status.as_u16()));
                    }
                }
                Err(e) => {
                    if attempts >= 2 {
                        return Err(FanOutError::Network(e.to_string()));
                    }
                }
            }
        }
    }

    /// Explicitly close a session (used by an admin/close API, if one exists).
    pub fn close_session(&self, source_id: &str) -> bool {
        self.sessions.lock().remove(source_id).is_some()
    }

    /// Snapshot of currently open sessions, for inspection endpoints.
    pub fn sessions_snapshot(&self) -> Vec<Session> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Sweep expired sessions. Called periodically by a background task in
    /// addition to the lazy GC that happens on each routed event.
    pub fn sweep_expired(&self, now: i64) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, Target};
    use tempfile::tempdir;

    fn new_router(cancel_phrases: Vec<&str>) -> (tempfile::TempDir, Router) {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(Store::open(&dir.path().join("router.db")).unwrap());
        let registry = std::sync::Arc::new(Registry::new(store).unwrap());
        registry
            .upsert(Target {
                name: "astraea".into(),
                base_url: "http://127.0.0.1:1".into(),
                phrases: vec!["hey astraea".into()],
            })
            .unwrap();
        let router = Router::new(
            registry,
            cancel_phrases.into_iter().map(String::from).collect(),
            25,
        );
        (dir, router)
    }

    fn event(source_id: &str, ts: i64, text: &str) -> TextEvent {
        TextEvent {
            source_id: source_id.into(),
            room: "office".into(),
            ts,
            text: text.into(),
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn trigger_without_wake_word_is_ignored() {
        let (_dir, router) = new_router(vec![]);
        let decision = router
            .route(event("m1", 100_000, "this is just random speech"), ListenMode::Trigger)
            .await;
        assert_eq!(decision.mode, RouteMode::Ignored);
        assert!(!decision.forwarded);
        assert_eq!(decision.reason, "no_match");
    }

    #[tokio::test]
    async fn trigger_with_wake_word_opens_session_even_if_forward_fails() {
        let (_dir, router) = new_router(vec![]);
        let decision = router
            .route(event("m1", 100_000, "Hey Astraea, what's the weather?"), ListenMode::Trigger)
            .await;
        assert_eq!(decision.mode, RouteMode::SessionOpen);
        assert_eq!(decision.routed_to.as_deref(), Some("astraea"));
        assert_eq!(decision.reason, "trigger_phrase:hey astraea");
        assert!(!decision.forwarded, "nothing listens on 127.0.0.1:1");
    }

    #[tokio::test]
    async fn cancel_phrase_wins_over_wake_phrase() {
        let (_dir, router) = new_router(vec![]);
        let decision = router
            .route(event("m1", 100_000, "never mind hey astraea"), ListenMode::Trigger)
            .await;
        assert_eq!(decision.mode, RouteMode::SessionEnd);
        assert_eq!(decision.reason, "cancel_phrase");
    }

    #[tokio::test]
    async fn cancel_clears_existing_session_and_later_events_are_ignored() {
        let (_dir, router) = new_router(vec![]);
        router
            .route(event("m1", 100_000, "Hey Astraea, what's the weather?"), ListenMode::Trigger)
            .await;
        let cancel = router.route(event("m1", 115_000, "never mind"), ListenMode::Trigger).await;
        assert_eq!(cancel.mode, RouteMode::SessionEnd);

        let after = router.route(event("m1", 120_000, "are you there"), ListenMode::Trigger).await;
        assert_eq!(after.mode, RouteMode::Ignored);
    }

    #[tokio::test]
    async fn session_expires_after_ttl() {
        let (_dir, router) = new_router(vec![]);
        router
            .route(event("m1", 100_000, "Hey Astraea, what's the weather?"), ListenMode::Trigger)
            .await;
        // 100_000 + 25_000 (ttl in ms) + 1_000 = 126_000, strictly greater than
        // the ttl expires the session. `ts` is unix-ms, same as `last_ts`.
        let after_ttl = router.route(event("m1", 126_000, "anything"), ListenMode::Trigger).await;
        assert_eq!(after_ttl.mode, RouteMode::Ignored, "session should have expired");
    }

    #[tokio::test]
    async fn longest_phrase_wins() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(Store::open(&dir.path().join("lp.db")).unwrap());
        let registry = std::sync::Arc::new(Registry::new(store).unwrap());
        registry
            .upsert(Target { name: "a".into(), base_url: "http://127.0.0.1:1".into(), phrases: vec!["hey".into()] })
            .unwrap();
        registry
            .upsert(Target {
                name: "b".into(),
                base_url: "http://127.0.0.1:1".into(),
                phrases: vec!["hey astraea".into()],
            })
            .unwrap();
        let router = Router::new(registry, vec![], 25);

        let decision = router.route(event("m1", 100_000, "hey astraea tell me"), ListenMode::Trigger).await;
        assert_eq!(decision.routed_to.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn active_mode_routes_without_wake_phrase_when_session_exists() {
        let (_dir, router) = new_router(vec![]);
        router
            .route(event("m1", 100_000, "Hey Astraea"), ListenMode::Trigger)
            .await;
        let decision = router.route(event("m1", 105_000, "anything at all"), ListenMode::Active).await;
        assert_eq!(decision.mode, RouteMode::SessionContinue);
        assert_eq!(decision.routed_to.as_deref(), Some("astraea"));
    }

    #[tokio::test]
    async fn active_mode_with_no_session_and_no_prior_target_is_ignored() {
        let (_dir, router) = new_router(vec![]);
        let decision = router.route(event("m2", 100_000, "anything at all"), ListenMode::Active).await;
        assert_eq!(decision.mode, RouteMode::Ignored);
    }

    #[tokio::test]
    async fn session_survives_a_realistic_sub_second_gap_between_ms_timestamps() {
        // Regression guard: `ts` is unix-ms, not unix-seconds. A gap of a few
        // hundred ms between utterances must not look like it blew through a
        // 25-second ttl.
        let (_dir, router) = new_router(vec![]);
        let base = 1_700_000_000_000_i64;
        router
            .route(event("m1", base, "Hey Astraea, what's the weather?"), ListenMode::Trigger)
            .await;
        let decision = router.route(event("m1", base + 400, "anything"), ListenMode::Trigger).await;
        assert_eq!(decision.mode, RouteMode::SessionContinue);
    }

    #[test]
    fn normalize_strips_punctuation_and_collapses_whitespace() {
        assert_eq!(normalize_text("Hey,  Astraea!!"), "hey astraea");
        assert_eq!(normalize_text("  ALREADY lower  "), "already lower");
    }
}
