//! Persisted pairing state.
//!
//! Two things survive a restart: which Core this extension is paired with, and
//! the registration token each Core handed out (sent back on the next
//! `register` so the Core recognises the extension).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for state persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error accessing state at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Everything written to the state file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_core_id: Option<String>,
    /// Registration token per `core_id`.
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

/// Load/save seam for [`PersistedState`].
#[cfg_attr(test, mockall::automock)]
pub trait StateStore: Send {
    /// Loads the state; a store with nothing saved yet returns the default.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if stored state exists but cannot be read.
    fn load(&self) -> Result<PersistedState, StoreError>;

    /// Replaces the stored state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the state cannot be written.
    fn save(&self, state: &PersistedState) -> Result<(), StoreError>;
}

// ── File store ────────────────────────────────────────────────────────────────

/// TOML file store.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<PersistedState, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(state)?;
        std::fs::write(&self.path, content).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

// ── Memory store ──────────────────────────────────────────────────────────────

/// In-memory store.  Clones share the same state, so a test can keep one
/// clone to inspect what the extension saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<(PersistedState, usize)>>,
}

impl MemoryStateStore {
    pub fn new(initial: PersistedState) -> Self {
        Self {
            inner: Arc::new(Mutex::new((initial, 0))),
        }
    }

    /// The last saved (or initial) state.
    pub fn snapshot(&self) -> PersistedState {
        self.lock().0.clone()
    }

    /// How many times `save` has been called.
    pub fn save_count(&self) -> usize {
        self.lock().1
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (PersistedState, usize)> {
        // A poisoned lock only means another holder panicked mid-read; the
        // data itself is still a complete value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<PersistedState, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let mut guard = self.lock();
        guard.0 = state.clone();
        guard.1 += 1;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedState {
        let mut tokens = BTreeMap::new();
        tokens.insert("core-a".to_string(), "tok-a".to_string());
        PersistedState {
            paired_core_id: Some("core-a".to_string()),
            tokens,
        }
    }

    #[test]
    fn test_file_store_missing_file_loads_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(dir.path().join("state.toml"));

        assert_eq!(store.load().expect("load"), PersistedState::default());
    }

    #[test]
    fn test_file_store_round_trips_and_creates_directories() {
        // Arrange
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(dir.path().join("a").join("b").join("state.toml"));

        // Act
        store.save(&sample()).expect("save");
        let loaded = store.load().expect("load");

        // Assert
        assert_eq!(loaded, sample());
        assert!(store.path().exists());
    }

    #[test]
    fn test_file_store_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.toml");
        std::fs::write(&path, "tokens = 5").unwrap();

        let err = FileStateStore::new(&path).load().unwrap_err();

        assert!(matches!(err, StoreError::Parse(_)));
    }

    #[test]
    fn test_unpaired_state_omits_paired_core_id() {
        let text = toml::to_string_pretty(&PersistedState::default()).unwrap();
        assert!(!text.contains("paired_core_id"));
    }

    #[test]
    fn test_memory_store_clones_share_state() {
        let store = MemoryStateStore::default();
        let observer = store.clone();

        store.save(&sample()).unwrap();

        assert_eq!(observer.snapshot(), sample());
        assert_eq!(observer.save_count(), 1);
    }
}
