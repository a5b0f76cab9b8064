//! Target registry: thin typed wrapper over `Store`'s target table plus a
//! derived phrase index for the Router.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    error::{EchoNetError, Result},
    store::{Store, Target},
};

/// Normalize a phrase for storage and matching: lowercase, collapse whitespace.
pub fn normalize_phrase(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

/// Derived phrase → target mapping, rebuilt on any Registry mutation.
///
/// Entries are kept sorted longest-phrase-first so the Router's scan finds
/// the longest match by taking the first hit.
#[derive(Debug, Clone, Default)]
pub struct PhraseIndex {
    /// `(normalized phrase, target name)`, longest phrase first; ties keep
    /// insertion order (the order targets were read back from the registry).
    entries: Vec<(String, String)>,
}

impl PhraseIndex {
    fn build(targets: &[Target]) -> Self {
        let mut entries: Vec<(String, String)> = Vec::new();
        for target in targets {
            for phrase in &target.phrases {
                entries.push((normalize_phrase(phrase), target.name.clone()));
            }
        }
        // Stable sort: equal-length phrases keep the order they were pushed in.
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { entries }
    }

    /// Direct lookup of an exact normalized phrase, mostly useful for tests.
    pub fn get(&self, normalized_phrase: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(p, _)| p == normalized_phrase)
            .map(|(_, name)| name.as_str())
    }

    /// Iterate phrases longest-first, as the Router's wake-phrase scan requires.
    pub fn iter_longest_first(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, n)| (p.as_str(), n.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Typed wrapper over `Store`'s target CRUD, maintaining a `PhraseIndex` snapshot.
///
/// The index is held behind a `parking_lot::RwLock<Arc<PhraseIndex>>`: writers
/// build a whole new index and swap the pointer; readers take a cheap `Arc`
/// clone under a read lock and never block on each other. `arc_swap` would
/// express the same pattern with one less lock, but this sticks to
/// `parking_lot` alone rather than adding a crate for it.
pub struct Registry {
    store: Arc<Store>,
    index: RwLock<Arc<PhraseIndex>>,
}

impl Registry {
    pub fn new(store: Arc<Store>) -> Result<Self> {
        let targets = store.list_targets()?;
        Ok(Self {
            store,
            index: RwLock::new(Arc::new(PhraseIndex::build(&targets))),
        })
    }

    /// Validate and persist a target, rebuilding the phrase index.
    pub fn upsert(&self, mut target: Target) -> Result<Target> {
        if target.name.trim().is_empty() {
            return Err(EchoNetError::InvalidConfig("target name must not be empty".into()));
        }
        if !target.base_url.starts_with("http://") && !target.base_url.starts_with("https://") {
            return Err(EchoNetError::InvalidConfig(format!(
                "target base_url must be http(s): {}",
                target.base_url
            )));
        }
        target.phrases = target
            .phrases
            .iter()
            .map(|p| normalize_phrase(p))
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>();
        // Dedup while preserving first-seen order.
        let mut seen = std::collections::HashSet::new();
        target.phrases.retain(|p| seen.insert(p.clone()));

        if target.phrases.is_empty() {
            return Err(EchoNetError::InvalidConfig(
                "target must have at least one non-empty phrase".into(),
            ));
        }

        self.store.upsert_target(&target)?;
        self.rebuild_index()?;
        Ok(target)
    }

    pub fn get(&self, name: &str) -> Result<Option<Target>> {
        self.store.get_target(name)
    }

    pub fn list(&self) -> Result<Vec<Target>> {
        self.store.list_targets()
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        self.store.delete_target(name)?;
        self.rebuild_index()?;
        Ok(())
    }

    /// Immutable snapshot of the current phrase index.
    pub fn phrase_map(&self) -> Arc<PhraseIndex> {
        Arc::clone(&self.index.read())
    }

    fn rebuild_index(&self) -> Result<()> {
        let targets = self.store.list_targets()?;
        *self.index.write() = Arc::new(PhraseIndex::build(&targets));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("reg.db")).unwrap());
        let registry = Registry::new(store).unwrap();
        (dir, registry)
    }

    #[test]
    fn upsert_normalizes_and_dedups_phrases() {
        let (_dir, registry) = new_registry();
        let target = registry
            .upsert(Target {
                name: "astraea".into(),
                base_url: "http://localhost:9000".into(),
                phrases: vec!["Hey  Astraea".into(), "hey astraea".into(), "  ASTRAEA ".into()],
            })
            .unwrap();
        assert_eq!(target.phrases, vec!["hey astraea", "astraea"]);
    }

    #[test]
    fn longest_phrase_wins_in_index_order() {
        let (_dir, registry) = new_registry();
        registry
            .upsert(Target {
                name: "a".into(),
                base_url: "http://a".into(),
                phrases: vec!["hey".into()],
            })
            .unwrap();
        registry
            .upsert(Target {
                name: "b".into(),
                base_url: "http://b".into(),
                phrases: vec!["hey astraea".into()],
            })
            .unwrap();

        let index = registry.phrase_map();
        let (first_phrase, first_target) = index.iter_longest_first().next().unwrap();
        assert_eq!(first_phrase, "hey astraea");
        assert_eq!(first_target, "b");
    }

    #[test]
    fn delete_rebuilds_index() {
        let (_dir, registry) = new_registry();
        registry
            .upsert(Target {
                name: "astraea".into(),
                base_url: "http://localhost:9000".into(),
                phrases: vec!["hey astraea".into()],
            })
            .unwrap();
        assert!(!registry.phrase_map().is_empty());

        registry.delete("astraea").unwrap();
        assert!(registry.phrase_map().is_empty());
    }

    #[test]
    fn upsert_rejects_empty_name_or_bad_url() {
        let (_dir, registry) = new_registry();
        let err = registry
            .upsert(Target {
                name: "".into(),
                base_url: "http://x".into(),
                phrases: vec!["hi".into()],
            })
            .unwrap_err();
        assert!(matches!(err, EchoNetError::InvalidConfig(_)));

        let err = registry
            .upsert(Target {
                name: "x".into(),
                base_url: "not-a-url".into(),
                phrases: vec!["hi".into()],
            })
            .unwrap_err();
        assert!(matches!(err, EchoNetError::InvalidConfig(_)));
    }

    #[test]
    fn upsert_rejects_target_with_no_phrases() {
        let (_dir, registry) = new_registry();
        let err = registry
            .upsert(Target {
                name: "x".into(),
                base_url: "http://x".into(),
                phrases: vec!["   ".into()],
            })
            .unwrap_err();
        assert!(matches!(err, EchoNetError::InvalidConfig(_)));
    }
}
