//! Durable JSON snapshots with a single writer task per file.
//!
//! Every logical file gets exactly one background task that drains a queue
//! of serialized snapshots and performs the blocking write. Callers enqueue
//! and move on; writes never block the async path, and write-then-rename
//! keeps the file whole across crashes.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Errors raised by the durable store helpers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error for {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writer task for {0} is no longer running")]
    WriterGone(PathBuf),
}

/// Handle to the single writer task owning one durable file.
#[derive(Clone, Debug)]
pub struct JsonFileWriter {
    path: PathBuf,
    tx: mpsc::UnboundedSender<String>,
}

impl JsonFileWriter {
    /// Spawns the writer task for `path` and returns its handle along with
    /// the task's join handle. Dropping every `JsonFileWriter` clone closes
    /// the queue; the task drains remaining snapshots and exits.
    pub fn spawn(path: impl Into<PathBuf>) -> (Self, JoinHandle<()>) {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                // Keep only the most recent pending snapshot.
                let mut latest = payload;
                while let Ok(newer) = rx.try_recv() {
                    latest = newer;
                }
                let write_path = task_path.clone();
                let result =
                    tokio::task::spawn_blocking(move || write_atomic(&write_path, &latest)).await;
                match result {
                    Ok(Ok(())) => debug!(path = %task_path.display(), "snapshot persisted"),
                    Ok(Err(err)) => {
                        error!(path = %task_path.display(), error = %err, "snapshot write failed");
                    }
                    Err(err) => {
                        error!(path = %task_path.display(), error = %err, "snapshot writer panicked");
                    }
                }
            }
        });
        (Self { path, tx }, handle)
    }

    /// Serializes `value` and enqueues it for the writer task.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), StoreError> {
        let payload = serde_json::to_string_pretty(value).map_err(|source| StoreError::Serde {
            path: self.path.clone(),
            source,
        })?;
        self.tx
            .send(payload)
            .map_err(|_| StoreError::WriterGone(self.path.clone()))
    }

    /// The file this writer owns.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Loads a previously persisted snapshot, returning `None` when the file
/// does not exist yet.
pub fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StoreError::Serde {
            path: path.to_path_buf(),
            source,
        })
}

fn write_atomic(path: &Path, payload: &str) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(payload.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    std::fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Snapshot {
        revision: u64,
        note: String,
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let (writer, handle) = JsonFileWriter::spawn(&path);

        let snap = Snapshot {
            revision: 7,
            note: "open BTC long".into(),
        };
        writer.save(&snap).unwrap();
        drop(writer);
        handle.await.unwrap();

        let loaded: Option<Snapshot> = load_snapshot(&path).unwrap();
        assert_eq!(loaded.unwrap(), snap);
    }

    #[tokio::test]
    async fn newest_snapshot_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let (writer, handle) = JsonFileWriter::spawn(&path);

        for revision in 0..20u64 {
            writer
                .save(&Snapshot {
                    revision,
                    note: String::new(),
                })
                .unwrap();
        }
        drop(writer);
        handle.await.unwrap();

        let loaded: Snapshot = load_snapshot(&path).unwrap().unwrap();
        assert_eq!(loaded.revision, 19);
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Snapshot> = load_snapshot(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }
}
