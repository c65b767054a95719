//! Crash-safe persistence of the record store.
//!
//! Snapshots are written to `<path>.tmp`, synced, then renamed over
//! `<path>`. The canonical file is therefore always either the previous
//! complete snapshot or the new one.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{RecordStore, Snapshot};

/// Errors raised while reading or writing a snapshot file.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("encoding snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decoding snapshot {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("flush task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PersistError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Which file a restore was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSource {
    /// A leftover temp file from an interrupted flush, now promoted.
    Temp,
    Canonical,
    Empty,
}

/// Outcome of [`Durability::restore`].
#[derive(Debug)]
pub struct Restored {
    pub snapshot: Snapshot,
    pub source: RestoreSource,
}

/// Owns the snapshot file pair and serializes writers to it.
#[derive(Debug)]
pub struct Durability {
    path: PathBuf,
    tmp_path: PathBuf,
    fsync: bool,
    write_lock: Mutex<()>,
}

impl Durability {
    /// Create a manager for the snapshot at `path`.
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Self {
        let path = path.into();
        let tmp_path = tmp_path_for(&path);

        Self {
            path,
            tmp_path,
            fsync,
            write_lock: Mutex::new(()),
        }
    }

    /// Canonical snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// In-progress snapshot path (`<path>.tmp`).
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Load the newest complete snapshot available on disk.
    ///
    /// Never fails: unreadable files are logged and skipped, falling back
    /// to the next candidate and finally to an empty store.
    pub fn restore(&self) -> Restored {
        let _guard = self.write_lock.lock();

        if self.tmp_path.exists() {
            match read_snapshot(&self.tmp_path) {
                Ok(snapshot) => {
                    info!(
                        path = %self.tmp_path.display(),
                        records = snapshot.len(),
                        "restored snapshot from interrupted flush",
                    );
                    if let Err(e) = fs::rename(&self.tmp_path, &self.path) {
                        warn!(
                            from = %self.tmp_path.display(),
                            to = %self.path.display(),
                            error = %e,
                            "failed to promote temp snapshot",
                        );
                    }
                    return Restored {
                        snapshot,
                        source: RestoreSource::Temp,
                    };
                }
                Err(e) => {
                    warn!(error = %e, "discarding unreadable temp snapshot");
                    if let Err(e) = fs::remove_file(&self.tmp_path) {
                        warn!(
                            path = %self.tmp_path.display(),
                            error = %e,
                            "removing temp snapshot",
                        );
                    }
                }
            }
        }

        if self.path.exists() {
            match read_snapshot(&self.path) {
                Ok(snapshot) => {
                    info!(
                        path = %self.path.display(),
                        records = snapshot.len(),
                        "restored snapshot",
                    );
                    return Restored {
                        snapshot,
                        source: RestoreSource::Canonical,
                    };
                }
                Err(e) => {
                    warn!(error = %e, "snapshot unreadable, starting empty");
                }
            }
        } else {
            info!(path = %self.path.display(), "no snapshot found, starting empty");
        }

        Restored {
            snapshot: Snapshot::new(),
            source: RestoreSource::Empty,
        }
    }

    /// Write `snapshot` through the temp file and atomically replace the
    /// canonical file with it.
    pub fn flush(&self, snapshot: &Snapshot) -> Result<(), PersistError> {
        let _guard = self.write_lock.lock();
        self.write_snapshot(snapshot)
    }

    /// Snapshot `store` and flush it. Returns the number of records written.
    ///
    /// The snapshot is taken after acquiring the write lock, so flushes
    /// land on disk in the same order their snapshots were taken and a
    /// slower, older flush can never overwrite a newer one.
    pub fn flush_store(&self, store: &RecordStore) -> Result<usize, PersistError> {
        let _guard = self.write_lock.lock();
        let snapshot = store.snapshot_all();
        self.write_snapshot(&snapshot)?;
        Ok(snapshot.len())
    }

    /// [`flush_store`](Self::flush_store) on the blocking thread pool.
    pub async fn flush_store_blocking(
        self: &Arc<Self>,
        store: &Arc<RecordStore>,
    ) -> Result<usize, PersistError> {
        let durability = Arc::clone(self);
        let store = Arc::clone(store);
        tokio::task::spawn_blocking(move || durability.flush_store(&store)).await?
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), PersistError> {
        let data = serde_json::to_vec(snapshot).map_err(PersistError::Encode)?;

        {
            let mut file = File::create(&self.tmp_path)
                .map_err(|e| PersistError::io("creating", &self.tmp_path, e))?;
            file.write_all(&data)
                .map_err(|e| PersistError::io("writing", &self.tmp_path, e))?;
            if self.fsync {
                file.sync_all()
                    .map_err(|e| PersistError::io("syncing", &self.tmp_path, e))?;
            }
        }

        fs::rename(&self.tmp_path, &self.path)
            .map_err(|e| PersistError::io("renaming", &self.tmp_path, e))?;

        if self.fsync {
            sync_parent_dir(&self.path);
        }

        debug!(
            path = %self.path.display(),
            records = snapshot.len(),
            bytes = data.len(),
            "snapshot flushed",
        );

        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(".tmp");
    PathBuf::from(raw)
}

fn read_snapshot(path: &Path) -> Result<Snapshot, PersistError> {
    let data = fs::read(path).map_err(|e| PersistError::io("reading", path, e))?;
    serde_json::from_slice(&data).map_err(|source| PersistError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Make the rename itself durable. Best effort: some filesystems refuse
/// to sync directories.
fn sync_parent_dir(path: &Path) {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "directory sync skipped");
    }
}
