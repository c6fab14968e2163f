//! Durable copy of the authoritative bases, loaded when a session opens so reads can be answered
//! before the remote store has said anything. Pending writes are not stored here; they come back
//! from the journal and are layered on top.

use std::io::{self, Write as _};
use std::path::Path as FsPath;

use crate::data_model::{Entity, Path, Version};

const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("snapshot could not be parsed: {0}")]
    Parse(String),

    #[error("unsupported snapshot format {0}")]
    Format(u32),
}

impl From<io::Error> for SnapshotError {
    fn from(error: io::Error) -> Self {
        SnapshotError::Io {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SnapshotEntry {
    path: Path,
    value: Entity,
    version: Version,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SnapshotFile {
    format: u32,
    saved_at: chrono::DateTime<chrono::Utc>,
    entries: Vec<SnapshotEntry>,
}

/// Reads a snapshot. A missing file is an empty snapshot.
pub fn load_snapshot(path: &FsPath) -> Result<Vec<(Path, Entity, Version)>, SnapshotError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let file: SnapshotFile =
        serde_json::from_slice(&bytes).map_err(|e| SnapshotError::Parse(e.to_string()))?;
    if file.format != SNAPSHOT_FORMAT {
        return Err(SnapshotError::Format(file.format));
    }

    log::info!(
        "Loaded {} cached entries from snapshot saved at {}",
        file.entries.len(),
        file.saved_at
    );
    Ok(file
        .entries
        .into_iter()
        .map(|entry| (entry.path, entry.value, entry.version))
        .collect())
}

/// Atomically replaces the snapshot at `path`.
pub fn save_snapshot(
    path: &FsPath,
    entries: Vec<(Path, Entity, Version)>,
) -> Result<(), SnapshotError> {
    let file = SnapshotFile {
        format: SNAPSHOT_FORMAT,
        saved_at: chrono::Utc::now(),
        entries: entries
            .into_iter()
            .map(|(path, value, version)| SnapshotEntry {
                path,
                value,
                version,
            })
            .collect(),
    };
    let bytes = serde_json::to_vec(&file).map_err(|e| SnapshotError::Parse(e.to_string()))?;

    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(FsPath::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(directory)?;
    temp.write_all(&bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| SnapshotError::from(e.error))?;
    Ok(())
}
