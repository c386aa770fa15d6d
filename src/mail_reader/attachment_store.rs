use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::mail_reader::error::{Result, SyncError};
use crate::mail_reader::message::UNNAMED_ATTACHMENT;

/// How stored file names are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// `{timestamp}_{uid}_{ordinal}_{name}`, one file per stored attachment.
    #[default]
    Unique,
    /// The sanitized name itself; a later attachment with the same name
    /// replaces the earlier file.
    Overwrite,
}

/// What happens to attachments when a failed batch is run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Write every attachment again. In `Unique` mode a retried batch leaves
    /// a second timestamped copy of everything it had already written.
    #[default]
    AtLeastOnce,
    /// In `Unique` mode, reuse a file already stored for the same UID,
    /// ordinal and name instead of writing another copy.
    BestEffortOnce,
}

/// Name of a stored attachment inside the attachment directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredReference(String);

impl StoredReference {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoredReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keep alphanumerics, `.` and `_`, drop everything else.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '.' || *c == '_')
        .collect();
    let cleaned = cleaned.trim_end();
    // "." and ".." would resolve outside the file we mean to write
    if cleaned.chars().all(|c| c == '.') {
        return UNNAMED_ATTACHMENT.to_string();
    }
    cleaned.to_string()
}

#[derive(Debug)]
pub struct AttachmentStore {
    root: PathBuf,
    mode: StoreMode,
    retry_policy: RetryPolicy,
}

impl AttachmentStore {
    pub fn new(root: impl AsRef<Path>, mode: StoreMode, retry_policy: RetryPolicy) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            SyncError::Storage(format!("cannot create {}: {}", root.display(), e))
        })?;
        Ok(Self {
            root,
            mode,
            retry_policy,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, reference: &StoredReference) -> PathBuf {
        self.root.join(reference.as_str())
    }

    /// Write `bytes` under a name derived from `filename` and return the
    /// reference. `ordinal` is the attachment's position within its message,
    /// so two same-named attachments of one message never share a file in
    /// `Unique` mode. The payload lands in a temp file first and is renamed
    /// into place, so a reader never observes a half-written attachment.
    pub fn persist(&self, uid: u32, ordinal: usize, filename: &str, bytes: &[u8]) -> Result<StoredReference> {
        let sanitized = sanitize_filename(filename);

        if self.mode == StoreMode::Unique && self.retry_policy == RetryPolicy::BestEffortOnce {
            if let Some(existing) = self.find_previous(uid, ordinal, &sanitized)? {
                info!("reusing stored attachment {} for message {}", existing, uid);
                return Ok(existing);
            }
        }

        let stored_name = match self.mode {
            StoreMode::Unique => format!(
                "{}_{}_{}_{}",
                Local::now().format("%Y%m%d_%H%M%S"),
                uid,
                ordinal,
                sanitized
            ),
            StoreMode::Overwrite => sanitized,
        };
        let path = self.root.join(&stored_name);

        // Each writer gets its own randomly named temp file; dropping it on
        // failure removes it.
        let write = || -> std::io::Result<()> {
            let mut tmpfile = NamedTempFile::new_in(&self.root)?;
            tmpfile.write_all(bytes)?;
            tmpfile.persist(&path).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|e| SyncError::Storage(format!("cannot write {}: {}", path.display(), e)))?;

        debug!("stored {} bytes as {}", bytes.len(), path.display());
        Ok(StoredReference(stored_name))
    }

    /// Read a stored attachment back from disk.
    pub fn read_back(&self, reference: &StoredReference) -> Result<Vec<u8>> {
        let path = self.path_of(reference);
        fs::read(&path)
            .map_err(|e| SyncError::Storage(format!("cannot read {}: {}", path.display(), e)))
    }

    /// Look up a stored attachment by the reference a client handed back,
    /// returning its bytes and a content type guessed from the extension.
    pub fn open(&self, reference: &str) -> Result<(Vec<u8>, String)> {
        if reference.is_empty() || sanitize_filename(reference) != reference {
            return Err(SyncError::NotFound(reference.to_string()));
        }
        let path = self.root.join(reference);
        if !path.is_file() {
            return Err(SyncError::NotFound(reference.to_string()));
        }
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => SyncError::NotFound(reference.to_string()),
            _ => SyncError::Storage(format!("cannot read {}: {}", path.display(), e)),
        })?;
        let content_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .to_string();
        Ok((bytes, content_type))
    }

    // Latest `{timestamp}_{uid}_{ordinal}_{name}` file for this attachment, if any.
    fn find_previous(&self, uid: u32, ordinal: usize, sanitized: &str) -> Result<Option<StoredReference>> {
        let suffix = format!("_{}_{}_{}", uid, ordinal, sanitized);
        let timestamp_len = "YYYYmmdd_HHMMSS".len();

        let mut matches = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.len() == timestamp_len + suffix.len() && name.ends_with(&suffix) {
                matches.push(name);
            }
        }
        Ok(matches.into_iter().max().map(StoredReference))
    }
}
