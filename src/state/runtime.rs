//! Whether the gateway was last intentionally active.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StateError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub enabled: bool,
}

/// File-backed [`RuntimeState`].
#[derive(Debug, Clone)]
pub struct RuntimeStateFile {
    path: PathBuf,
}

impl RuntimeStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or corrupt content reads as disabled.
    pub fn load(&self) -> RuntimeState {
        super::read_json(&self.path).unwrap_or_default()
    }

    pub fn save(&self, enabled: bool) -> Result<(), StateError> {
        super::write_json(&self.path, &RuntimeState { enabled })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_save_and_load_state() {
        let dir = tempfile::tempdir().unwrap();
        let file = RuntimeStateFile::new(dir.path().join("runtime_state.json"));

        file.save(true).unwrap();
        assert!(file.load().enabled);

        file.save(false).unwrap();
        assert!(!file.load().enabled);
    }

    #[test]
    fn should_load_disabled_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = RuntimeStateFile::new(dir.path().join("runtime_state.json"));

        assert!(!file.load().enabled);
    }

    #[test]
    fn should_load_disabled_when_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_state.json");
        std::fs::write(&path, "not-json").unwrap();

        assert!(!RuntimeStateFile::new(path).load().enabled);
    }

    #[test]
    fn should_write_expected_document() {
        let dir = tempfile::tempdir().unwrap();
        let file = RuntimeStateFile::new(dir.path().join("runtime_state.json"));
        file.save(true).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(file.path()).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({ "enabled": true }));
    }
}
