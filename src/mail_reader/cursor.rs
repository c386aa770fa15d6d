//! Per-folder "highest processed UID" watermark for incremental sync.
//!
//! All folders share one JSON file (`{"INBOX": 44}`). A run takes the folder
//! lock before reading the watermark and keeps it until it has advanced it,
//! so two incremental runs against the same folder cannot interleave their
//! read-modify-write.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::mail_reader::error::{Result, SyncError};

type Watermarks = BTreeMap<String, u32>;

#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    file_lock: Mutex<()>,
    folder_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Exclusive access to one folder's watermark for the duration of a run.
#[derive(Debug)]
pub struct FolderCursor<'a> {
    store: &'a CursorStore,
    folder: String,
    _guard: OwnedMutexGuard<()>,
}

impl CursorStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file_lock: Mutex::new(()),
            folder_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until no other run holds `folder`, then take it.
    pub async fn lock_folder(&self, folder: &str) -> FolderCursor<'_> {
        let lock = {
            let mut locks = self.folder_locks.lock().await;
            locks
                .entry(folder.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        debug!("cursor lock taken for {}", folder);
        FolderCursor {
            store: self,
            folder: folder.to_string(),
            _guard: guard,
        }
    }

    /// Current watermark without taking the folder lock. 0 when the folder
    /// has never been synced.
    pub async fn peek(&self, folder: &str) -> Result<u32> {
        let _file = self.file_lock.lock().await;
        Ok(self.read_all()?.get(folder).copied().unwrap_or(0))
    }

    async fn advance(&self, folder: &str, candidate: u32) -> Result<u32> {
        let _file = self.file_lock.lock().await;
        let mut marks = self.read_all()?;
        let current = marks.get(folder).copied().unwrap_or(0);
        if candidate <= current {
            return Ok(current);
        }
        marks.insert(folder.to_string(), candidate);
        self.write_all(&marks)?;
        info!("cursor for {} advanced {} -> {}", folder, current, candidate);
        Ok(candidate)
    }

    fn read_all(&self) -> Result<Watermarks> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SyncError::Storage(format!("corrupt cursor file {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Watermarks::new()),
            Err(e) => Err(SyncError::Storage(format!(
                "cannot read cursor file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn write_all(&self, marks: &Watermarks) -> Result<()> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent,
            None => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let json = serde_json::to_vec_pretty(marks)
            .map_err(|e| SyncError::Storage(format!("cannot encode cursor: {}", e)))?;
        let mut tmpfile = NamedTempFile::new_in(dir)?;
        tmpfile.write_all(&json)?;
        tmpfile.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl FolderCursor<'_> {
    pub async fn load(&self) -> Result<u32> {
        self.store.peek(&self.folder).await
    }

    /// Raise the watermark to `candidate`. A lower candidate leaves the stored
    /// value alone. Returns the value now stored.
    pub async fn advance(&self, candidate: u32) -> Result<u32> {
        self.store.advance(&self.folder, candidate).await
    }
}
