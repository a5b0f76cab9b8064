//! State Manager: a typed facade over `Store` for the listen-mode state
//! machine and a handful of other runtime-tunable settings, with a
//! `broadcast::Sender` fanning out change notifications to any subscriber.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    error::{EchoNetError, Result},
    store::Store,
};

const BROADCAST_CAP: usize = 64;

const SETTING_LISTEN_MODE: &str = "listen_mode";
const SETTING_AUDIO_DEVICE_INDEX: &str = "audio_device_index";

/// The three-state listen-mode machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenMode {
    Inactive,
    Trigger,
    Active,
}

impl ListenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenMode::Inactive => "inactive",
            ListenMode::Trigger => "trigger",
            ListenMode::Active => "active",
        }
    }
}

impl FromStr for ListenMode {
    type Err = EchoNetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inactive" => Ok(ListenMode::Inactive),
            "trigger" => Ok(ListenMode::Trigger),
            "active" => Ok(ListenMode::Active),
            other => Err(EchoNetError::InvalidMode(other.to_string())),
        }
    }
}

/// Emitted whenever a setting the worker cares about changes.
#[derive(Debug, Clone)]
pub struct SettingsChangedEvent {
    pub name: String,
    pub new_value: String,
}

/// Typed facade over `Store` for runtime-tunable settings.
///
/// Polling the cache (via `get_listen_mode`/`get_audio_device_index`) is the
/// worker's primary read path — it's O(1) with no I/O. The broadcast channel
/// is a best-effort notify-only path: subscribing is optional, since sends
/// with no receivers are silently dropped by `tokio::sync::broadcast`, which
/// is fine here (the worker polls the cache regardless of whether it has
/// subscribed yet).
pub struct StateManager {
    store: Arc<Store>,
    changed_tx: broadcast::Sender<SettingsChangedEvent>,
}

impl StateManager {
    pub fn new(store: Arc<Store>) -> Self {
        let (changed_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self { store, changed_tx }
    }

    /// Seed `listen_mode` with `default` if the Store has no value yet.
    pub fn ensure_initialized(&self, default: ListenMode) -> Result<()> {
        if self.store.get(SETTING_LISTEN_MODE).is_none() {
            self.store
                .set(SETTING_LISTEN_MODE, default.as_str(), "startup", Some("initial default"))?;
        }
        Ok(())
    }

    pub fn get_listen_mode(&self) -> ListenMode {
        self.store
            .get(SETTING_LISTEN_MODE)
            .and_then(|v| ListenMode::from_str(&v).ok())
            .unwrap_or(ListenMode::Trigger)
    }

    pub fn set_listen_mode(&self, mode: ListenMode, source: &str, reason: Option<&str>) -> Result<()> {
        self.store.set(SETTING_LISTEN_MODE, mode.as_str(), source, reason)?;
        info!(mode = mode.as_str(), source, "listen_mode changed");
        let _ = self.changed_tx.send(SettingsChangedEvent {
            name: SETTING_LISTEN_MODE.to_string(),
            new_value: mode.as_str().to_string(),
        });
        Ok(())
    }

    pub fn is_inactive(&self) -> bool {
        self.get_listen_mode() == ListenMode::Inactive
    }

    pub fn is_trigger(&self) -> bool {
        self.get_listen_mode() == ListenMode::Trigger
    }

    pub fn is_active(&self) -> bool {
        self.get_listen_mode() == ListenMode::Active
    }

    pub fn get_audio_device_index(&self) -> Option<usize> {
        self.store
            .get(SETTING_AUDIO_DEVICE_INDEX)
            .and_then(|v| v.parse::<usize>().ok())
    }

    pub fn set_audio_device_index(&self, index: usize, source: &str) -> Result<()> {
        self.store
            .set(SETTING_AUDIO_DEVICE_INDEX, &index.to_string(), source, None)?;
        let _ = self.changed_tx.send(SettingsChangedEvent {
            name: SETTING_AUDIO_DEVICE_INDEX.to_string(),
            new_value: index.to_string(),
        });
        Ok(())
    }

    /// Generic passthrough for any other runtime-tunable setting.
    pub fn set_raw(&self, name: &str, value: &str, source: &str, reason: Option<&str>) -> Result<()> {
        self.store.set(name, value, source, reason)?;
        let _ = self.changed_tx.send(SettingsChangedEvent {
            name: name.to_string(),
            new_value: value.to_string(),
        });
        Ok(())
    }

    pub fn get_raw(&self, name: &str) -> Option<String> {
        self.store.get(name)
    }

    pub fn all_settings(&self) -> Vec<(String, String)> {
        self.store.all_settings()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChangedEvent> {
        self.changed_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_manager() -> (tempfile::TempDir, StateManager) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("sm.db")).unwrap());
        (dir, StateManager::new(store))
    }

    #[test]
    fn defaults_to_trigger_when_unset() {
        let (_dir, sm) = new_manager();
        assert_eq!(sm.get_listen_mode(), ListenMode::Trigger);
    }

    #[test]
    fn ensure_initialized_is_idempotent() {
        let (_dir, sm) = new_manager();
        sm.ensure_initialized(ListenMode::Trigger).unwrap();
        sm.set_listen_mode(ListenMode::Active, "api", None).unwrap();
        sm.ensure_initialized(ListenMode::Trigger).unwrap();
        assert_eq!(sm.get_listen_mode(), ListenMode::Active);
    }

    #[test]
    fn set_then_get_is_linearizable() {
        let (_dir, sm) = new_manager();
        sm.set_listen_mode(ListenMode::Active, "api", None).unwrap();
        assert_eq!(sm.get_listen_mode(), ListenMode::Active);
        assert!(sm.is_active());
    }

    #[test]
    fn invalid_mode_string_is_rejected() {
        assert!(matches!(
            ListenMode::from_str("paused"),
            Err(EchoNetError::InvalidMode(_))
        ));
    }

    #[test]
    fn broadcast_send_with_no_subscriber_does_not_panic() {
        let (_dir, sm) = new_manager();
        sm.set_listen_mode(ListenMode::Active, "api", None).unwrap();
    }

    #[test]
    fn subscriber_observes_change_event() {
        let (_dir, sm) = new_manager();
        let mut rx = sm.subscribe();
        sm.set_listen_mode(ListenMode::Active, "api", None).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, "listen_mode");
        assert_eq!(event.new_value, "active");
    }
}
