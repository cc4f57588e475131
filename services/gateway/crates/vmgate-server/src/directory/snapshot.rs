//! Durable JSON snapshot of the directory.
//!
//! Writes go to a temp file that is then renamed over the target, so a crash
//! mid-write never leaves a truncated snapshot behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub mapping: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    /// A snapshot is fresh while younger than `max_age`. One stamped in the
    /// future counts as fresh.
    #[must_use]
    pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match (now - self.timestamp).to_std() {
            Ok(age) => age < max_age,
            Err(_) => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot {} is not valid JSON: {source}", .path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Reads and writes the snapshot file. All file I/O runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot if it exists and is younger than `max_age`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load_fresh(&self, max_age: Duration) -> Result<Option<Snapshot>, SnapshotError> {
        let path = self.path.clone();
        let loaded = tokio::task::spawn_blocking(move || load_sync(&path)).await??;
        Ok(loaded.filter(|snap| {
            let fresh = snap.is_fresh(max_age, Utc::now());
            if !fresh {
                tracing::info!(timestamp = %snap.timestamp, "ignoring stale snapshot");
            }
            fresh
        }))
    }

    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be serialized or written.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let path = self.path.clone();
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || save_sync(&path, &snapshot)).await?
    }
}

fn load_sync(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SnapshotError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| SnapshotError::Format {
            path: path.to_path_buf(),
            source,
        })
}

fn save_sync(path: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    let io_err = |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let content = serde_json::to_string_pretty(snapshot).map_err(|source| {
        SnapshotError::Format {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).map_err(io_err)?;
    std::fs::rename(&temp_path, path).map_err(io_err)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn snapshot(age: chrono::Duration) -> Snapshot {
        Snapshot {
            mapping: BTreeMap::from([
                ("Build-Box".to_string(), "us-east4-a".to_string()),
                ("build-box".to_string(), "us-east4-a".to_string()),
                ("guedfocnlq03".to_string(), "asia-east1-b".to_string()),
            ]),
            timestamp: Utc::now() - age,
        }
    }

    #[tokio::test]
    async fn round_trip_reproduces_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("nested").join("vm_cache.json"));
        let snap = snapshot(chrono::Duration::seconds(5));
        store.save(&snap).await.unwrap();
        let loaded = store
            .load_fresh(Duration::from_secs(3600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, snap);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent.json"));
        assert!(store.load_fresh(Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("vm_cache.json"));
        store
            .save(&snapshot(chrono::Duration::hours(2)))
            .await
            .unwrap();
        assert!(
            store
                .load_fresh(Duration::from_secs(3600))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn corrupt_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm_cache.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = SnapshotStore::new(path)
            .load_fresh(Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Format { .. }), "{err}");
    }

    #[test]
    fn future_timestamp_counts_as_fresh() {
        let snap = snapshot(chrono::Duration::seconds(-30));
        assert!(snap.is_fresh(Duration::from_secs(1), Utc::now()));
    }
}
