use serde::Serialize;

/// Every way a sync run can fail. A run that hits any of these returns no
/// partial result and does not advance the cursor.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidRequest(String),
}

impl SyncError {
    /// Transport failures are the only kind worth retrying as a whole.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Connection(_))
    }
}

// The HTTP layer reports errors as `{"error": "..."}`.
impl Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<mailparse::MailParseError> for SyncError {
    fn from(e: mailparse::MailParseError) -> Self {
        SyncError::Decoding(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
