//! Local persistence for a replica.
//!
//! Four slots back one replica: its identity, the change log, the store
//! snapshot and the sync checkpoint. Files are written atomically through a
//! temp file in the same directory followed by a rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tandem_engine::{Error, MemoryPersistence, Persistence, Result};
use tempfile::NamedTempFile;

/// One file-backed persistence slot.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persistence for FilePersistence {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;

        let mut temp = NamedTempFile::new_in(dir).map_err(|e| io_error(dir, e))?;
        temp.write_all(bytes).map_err(|e| io_error(&self.path, e))?;
        temp.flush().map_err(|e| io_error(&self.path, e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| io_error(&self.path, e))?;
        temp.persist(&self.path)
            .map_err(|e| io_error(&self.path, e.error))?;
        Ok(())
    }
}

fn io_error(path: &Path, err: std::io::Error) -> Error {
    Error::Persistence(format!("{}: {err}", path.display()))
}

/// The four persistence slots of one replica.
#[derive(Clone)]
pub struct ReplicaStorage {
    pub replica_id: Arc<dyn Persistence>,
    pub log: Arc<dyn Persistence>,
    pub store: Arc<dyn Persistence>,
    pub checkpoint: Arc<dyn Persistence>,
}

impl std::fmt::Debug for ReplicaStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaStorage").finish_non_exhaustive()
    }
}

impl ReplicaStorage {
    /// Volatile storage. Cloning the result and reopening simulates a restart.
    pub fn memory() -> Self {
        Self {
            replica_id: Arc::new(MemoryPersistence::new()),
            log: Arc::new(MemoryPersistence::new()),
            store: Arc::new(MemoryPersistence::new()),
            checkpoint: Arc::new(MemoryPersistence::new()),
        }
    }

    /// Files under `dir`: `replica-id`, `changelog.json`, `store.json`,
    /// `checkpoint.json`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            replica_id: Arc::new(FilePersistence::new(dir.join("replica-id"))),
            log: Arc::new(FilePersistence::new(dir.join("changelog.json"))),
            store: Arc::new(FilePersistence::new(dir.join("store.json"))),
            checkpoint: Arc::new(FilePersistence::new(dir.join("checkpoint.json"))),
        }
    }
}
