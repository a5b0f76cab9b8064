//! Persistent Store: settings, the settings audit log, and the target registry's
//! backing table. Backed by `rusqlite` with the `bundled` feature — no system
//! SQLite dependency, deterministic builds.
//!
//! The in-memory settings cache and the `rusqlite::Connection` live behind a
//! single `parking_lot::Mutex`, so a `set()` call's read-old/write-new/append-log
//! sequence and its cache update happen in one critical section. Two separate
//! locks (one for cache, one for the connection) would let a reader observe a
//! cache value with no matching committed row.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{EchoNetError, Result};

/// Current schema version this binary knows how to read and write.
const SCHEMA_VERSION: u32 = 1;

/// Ordered migrations applied in a single transaction on open.
/// Each entry's `u32` is the version it upgrades *to*.
const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        name        TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        updated_at  INTEGER NOT NULL,
        description TEXT
    );

    CREATE TABLE IF NOT EXISTS settings_log (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT NOT NULL,
        old_value   TEXT,
        new_value   TEXT NOT NULL,
        changed_at  INTEGER NOT NULL,
        source      TEXT NOT NULL,
        reason      TEXT
    );

    CREATE TABLE IF NOT EXISTS targets (
        name        TEXT PRIMARY KEY COLLATE NOCASE,
        base_url    TEXT NOT NULL,
        phrases_json TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_settings_log_name ON settings_log(name, changed_at DESC);
    "#,
)];

/// A registered downstream target ("brain").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub name: String,
    pub base_url: String,
    pub phrases: Vec<String>,
}

/// Append-only audit record of a single settings write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingChange {
    pub id: i64,
    pub name: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub changed_at: i64,
    pub source: String,
    pub reason: Option<String>,
}

struct Inner {
    conn: Connection,
    cache: HashMap<String, String>,
}

/// Durable settings/targets store with a warm in-memory settings cache.
///
/// Reads of settings never touch disk after `open()` warms the cache; writes
/// always go through disk first (inside the same critical section that
/// updates the cache), so the cache can never diverge from what's committed.
pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    /// Resolve the default DB path from `ECHONET_DB_PATH`, falling back to a
    /// platform data directory via `HOME`/`XDG_DATA_HOME`, with no `dirs`
    /// crate dependency.
    pub fn default_db_path() -> PathBuf {
        if let Some(p) = std::env::var_os("ECHONET_DB_PATH") {
            return PathBuf::from(p);
        }
        #[cfg(target_os = "windows")]
        {
            std::env::var_os("APPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Lattice Labs")
                .join("EchoNet")
                .join("echonet.db")
        }
        #[cfg(not(target_os = "windows"))]
        {
            std::env::var_os("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    std::env::var_os("HOME")
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("/tmp"))
                        .join(".local")
                        .join("share")
                })
                .join("echonet")
                .join("echonet.db")
        }
    }

    /// Open (creating if absent) the DB at `path`, run migrations, and warm the cache.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;

        Self::run_migrations(&conn)?;

        let mut cache = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT name, value FROM settings")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                cache.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
            }
        }

        Ok(Self {
            inner: Mutex::new(Inner { conn, cache }),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL);",
        )?;

        let current: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get::<_, Option<u32>>(0)
            })?
            .unwrap_or(0);

        if current > SCHEMA_VERSION {
            return Err(EchoNetError::SchemaVersion {
                found: current,
                max: SCHEMA_VERSION,
            });
        }

        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![version, Utc::now().timestamp()],
            )?;
        }

        Ok(())
    }

    /// Atomically write a setting: read the old value, persist the new one, and
    /// append a `SettingChange` row, all inside one critical section.
    pub fn set(&self, name: &str, value: &str, source: &str, reason: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = Utc::now().timestamp();
        let old_value = inner.cache.get(name).cloned();

        inner.conn.execute(
            r#"
            INSERT INTO settings (name, value, updated_at, description)
            VALUES (?1, ?2, ?3, NULL)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![name, value, now],
        )?;

        inner.conn.execute(
            "INSERT INTO settings_log (name, old_value, new_value, changed_at, source, reason) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![name, old_value, value, now, source, reason],
        )?;

        inner.cache.insert(name.to_string(), value.to_string());
        Ok(())
    }

    /// Read a setting from the warm cache (no disk I/O).
    pub fn get(&self, name: &str) -> Option<String> {
        self.inner.lock().cache.get(name).cloned()
    }

    /// Snapshot of every known setting.
    pub fn all_settings(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .cache
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Newest-first audit log, optionally filtered to one setting name.
    pub fn history(&self, name: Option<&str>, limit: usize) -> Result<Vec<SettingChange>> {
        let limit = limit.clamp(1, 500);
        let inner = self.inner.lock();

        let mut stmt = if name.is_some() {
            inner.conn.prepare(
                "SELECT id, name, old_value, new_value, changed_at, source, reason
                 FROM settings_log WHERE name = ?1 ORDER BY id DESC LIMIT ?2",
            )?
        } else {
            inner.conn.prepare(
                "SELECT id, name, old_value, new_value, changed_at, source, reason
                 FROM settings_log ORDER BY id DESC LIMIT ?1",
            )?
        };

        let row_to_change = |row: &rusqlite::Row| -> rusqlite::Result<SettingChange> {
            Ok(SettingChange {
                id: row.get(0)?,
                name: row.get(1)?,
                old_value: row.get(2)?,
                new_value: row.get(3)?,
                changed_at: row.get(4)?,
                source: row.get(5)?,
                reason: row.get(6)?,
            })
        };

        let rows = if let Some(name) = name {
            stmt.query_map(params![name, limit as i64], row_to_change)?
        } else {
            stmt.query_map(params![limit as i64], row_to_change)?
        };

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(EchoNetError::from)
    }

    /// Insert or replace a target by name (case-insensitive).
    pub fn upsert_target(&self, target: &Target) -> Result<()> {
        let phrases_json = serde_json::to_string(&target.phrases)
            .map_err(|e| EchoNetError::InvalidConfig(e.to_string()))?;
        let inner = self.inner.lock();
        inner.conn.execute(
            r#"
            INSERT INTO targets (name, base_url, phrases_json) VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET base_url = excluded.base_url, phrases_json = excluded.phrases_json
            "#,
            params![target.name, target.base_url, phrases_json],
        )?;
        Ok(())
    }

    /// Case-insensitive lookup by name.
    pub fn get_target(&self, name: &str) -> Result<Option<Target>> {
        let inner = self.inner.lock();
        let row: Option<(String, String, String)> = inner
            .conn
            .query_row(
                "SELECT name, base_url, phrases_json FROM targets WHERE name = ?1 COLLATE NOCASE",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(row.map(|(name, base_url, phrases_json)| Target {
            name,
            base_url,
            phrases: serde_json::from_str(&phrases_json).unwrap_or_default(),
        }))
    }

    pub fn list_targets(&self) -> Result<Vec<Target>> {
        let inner = self.inner.lock();
        let mut stmt = inner
            .conn
            .prepare("SELECT name, base_url, phrases_json FROM targets ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (name, base_url, phrases_json) = row?;
            out.push(Target {
                name,
                base_url,
                phrases: serde_json::from_str(&phrases_json).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    /// Delete a target. Returns `EchoNetError::NotFound` if it doesn't exist.
    pub fn delete_target(&self, name: &str) -> Result<()> {
        let inner = self.inner.lock();
        let changed = inner.conn.execute(
            "DELETE FROM targets WHERE name = ?1 COLLATE NOCASE",
            params![name],
        )?;
        if changed == 0 {
            return Err(EchoNetError::NotFound(format!("target '{name}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_dir, store) = open_temp();
        store.set("listen_mode", "trigger", "test", None).unwrap();
        assert_eq!(store.get("listen_mode").as_deref(), Some("trigger"));
    }

    #[test]
    fn set_appends_audit_row_with_monotonic_id() {
        let (_dir, store) = open_temp();
        store.set("listen_mode", "trigger", "test", Some("init")).unwrap();
        store.set("listen_mode", "active", "test", Some("api")).unwrap();

        let history = store.history(Some("listen_mode"), 10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].id > history[1].id, "newest-first ordering");
        assert_eq!(history[0].new_value, "active");
        assert_eq!(history[0].old_value.as_deref(), Some("trigger"));
        assert_eq!(history[1].old_value, None);
    }

    #[test]
    fn target_upsert_get_delete_round_trip() {
        let (_dir, store) = open_temp();
        let target = Target {
            name: "astraea".into(),
            base_url: "http://localhost:9000".into(),
            phrases: vec!["hey astraea".into()],
        };
        store.upsert_target(&target).unwrap();

        let fetched = store.get_target("ASTRAEA").unwrap().unwrap();
        assert_eq!(fetched, target);

        store.delete_target("astraea").unwrap();
        assert!(store.get_target("astraea").unwrap().is_none());
    }

    #[test]
    fn delete_missing_target_is_not_found() {
        let (_dir, store) = open_temp();
        let err = store.delete_target("nope").unwrap_err();
        assert!(matches!(err, EchoNetError::NotFound(_)));
    }

    #[test]
    fn reopening_existing_db_preserves_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        {
            let store = Store::open(&path).unwrap();
            store.set("audio_device_index", "2", "test", None).unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.get("audio_device_index").as_deref(), Some("2"));
    }

    #[test]
    fn schema_version_ahead_of_binary_fails_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL);
                 INSERT INTO schema_version VALUES (99, 0);",
            )
            .unwrap();
        }
        let err = Store::open(&path).unwrap_err();
        assert!(matches!(err, EchoNetError::SchemaVersion { found: 99, .. }));
    }
}
