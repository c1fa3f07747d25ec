//! Durable snapshots of the sampler dedup cache.
//!
//! Snapshots are written to a sibling temp file, flushed, then renamed over the
//! target so readers never observe a partial file. A `.lock` file guarded by an
//! exclusive advisory lock keeps concurrent writers (including other
//! processes) from interleaving.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot. Unknown fields are ignored on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub rate: f64,
    pub sampled: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    max_age: Duration,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the snapshot with `entries`
    pub fn save(&self, entries: Vec<SnapshotEntry>) -> Result<usize> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(sibling(&self.path, ".lock"))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(PipelineError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                "snapshot lock is held by another writer",
            )));
        }

        let count = entries.len();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            entries,
        };

        let tmp_path = sibling(&self.path, ".tmp");
        let result = write_and_rename(&tmp_path, &self.path, &snapshot);
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        let _ = FileExt::unlock(&lock);
        result?;

        tracing::debug!(
            path = %self.path.display(),
            entries = count,
            "Sampler snapshot written"
        );
        Ok(count)
    }

    /// Load unexpired entries.
    ///
    /// Returns `Ok(None)` when no snapshot exists or it is older than the
    /// configured maximum age, and `CacheCorruption` when it cannot be decoded.
    /// Any version is accepted as long as its entries have the known shape.
    pub fn load(&self, now: DateTime<Utc>) -> Result<Option<Vec<SnapshotEntry>>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PipelineError::CacheCorruption(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let snapshot: Snapshot = serde_json::from_slice(&data).map_err(|e| {
            PipelineError::CacheCorruption(format!("cannot decode {}: {}", self.path.display(), e))
        })?;

        // newer writers may add fields; entries that still decode are usable
        if snapshot.version > SNAPSHOT_VERSION {
            tracing::debug!(
                path = %self.path.display(),
                version = snapshot.version,
                "Loading sampler snapshot written by a newer version"
            );
        }

        let age = now.signed_duration_since(snapshot.saved_at);
        let stale = age
            .to_std()
            .map(|age| age > self.max_age)
            .unwrap_or(false);
        if stale {
            tracing::info!(
                path = %self.path.display(),
                saved_at = %snapshot.saved_at,
                "Sampler snapshot is stale, starting with an empty cache"
            );
            return Ok(None);
        }

        let entries = snapshot
            .entries
            .into_iter()
            .filter(|entry| entry.expires_at > now)
            .collect();
        Ok(Some(entries))
    }
}

fn write_and_rename(tmp_path: &Path, path: &Path, snapshot: &Snapshot) -> Result<()> {
    let mut file = File::create(tmp_path)?;
    serde_json::to_writer(&mut file, snapshot)?;
    file.flush()?;
    file.sync_all()?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
