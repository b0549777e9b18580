// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Snapshot file handling for the state cache.
//!
//! The snapshot is a JSON object `{"<entity id>": {"<attribute>": value}}`.
//! Writes go to a sibling temporary file that is then renamed over the
//! snapshot, so a crash mid-write leaves the previous snapshot intact.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::Attributes;
use crate::entity::EntityId;
use crate::error::PersistenceError;

/// In-memory form of the snapshot.
pub type Snapshot = HashMap<EntityId, Attributes>;

/// Reads the snapshot at `path`.
///
/// A missing file yields `Ok(None)`.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load(path: &Path) -> Result<Option<Snapshot>, PersistenceError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let snapshot = serde_json::from_slice(&bytes)?;
    Ok(Some(snapshot))
}

/// Writes `snapshot` to `path` atomically.
///
/// # Errors
///
/// Returns an error if encoding, writing or renaming fails. The temporary
/// file is removed on failure.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    let tmp = temp_path(path);

    if let Err(e) = fs::write(&tmp, &bytes).and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            EntityId::device("0x01"),
            json!({"state": "ON", "brightness": 50}).as_object().cloned().unwrap(),
        );
        snapshot.insert(
            EntityId::group(3),
            json!({"state": "OFF"}).as_object().cloned().unwrap(),
        );
        snapshot
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        save(&path, &sample()).unwrap();
        let loaded = load(&path).unwrap().unwrap();

        assert_eq!(loaded, sample());
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();

        assert!(matches!(load(&path), Err(PersistenceError::Json(_))));
    }

    #[test]
    fn failed_write_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        save(&path, &sample()).unwrap();

        let bad = dir.path().join("missing").join("state.json");
        assert!(save(&bad, &sample()).is_err());
        assert_eq!(load(&path).unwrap().unwrap(), sample());
    }

    #[test]
    fn temp_path_is_sibling() {
        let tmp = temp_path(Path::new("/data/state.json"));
        assert_eq!(tmp, PathBuf::from("/data/state.json.tmp"));
    }
}
