//! Persisted JSON state files.
//!
//! Every file is replaced as a whole: the new content is written to a
//! temporary file in the same directory and renamed over the target, so a
//! concurrent reader sees either the old or the new document, never a mix.
//! Readers treat missing or invalid content as "absent".

pub mod runtime;
pub mod schedule;

use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::StateError;

pub use runtime::{RuntimeState, RuntimeStateFile};
pub use schedule::{ScheduleState, ScheduleStateFile};

/// Read a JSON document, distinguishing a missing file from a corrupt one.
pub fn try_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(_) => {
            return Err(StateError::Corrupt {
                path: path.to_path_buf(),
            });
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|_| StateError::Corrupt {
            path: path.to_path_buf(),
        })
}

/// Read a JSON document, returning `None` when it is missing or unreadable.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    match try_read_json(path) {
        Ok(value) => value,
        Err(err) => {
            warn!("{err}, treating as absent");
            None
        }
    }
}

/// Replace a JSON document atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let write_err = |source| StateError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let content = serde_json::to_vec_pretty(value)?;
    let mut file = NamedTempFile::new_in(dir).map_err(write_err)?;
    file.write_all(&content).map_err(write_err)?;
    file.as_file().sync_all().map_err(write_err)?;
    file.persist(path).map_err(|err| write_err(err.error))?;

    Ok(())
}

/// Remove a state file; a file that is already gone is not an error.
pub fn remove(path: &Path) -> Result<(), StateError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StateError::Write {
            path: path.to_path_buf(),
            source,
        }),
    }
}
