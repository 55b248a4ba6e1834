// Object store and size-history storage used by the pipeline.
use std::fmt;

pub mod ephemeral_cache;
pub mod history;
pub mod history_file;
pub mod object;

pub use ephemeral_cache::EphemeralCache;
pub use history::{HistoryStore, MemoryHistoryStore};
pub use history_file::{FileHistoryStore, FsyncMode};
pub use object::{ChangeNotifier, ListPage, MemoryObjectStore, ObjectStore};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug)]
pub enum StorageError {
    NotFound(String),
    Unavailable(String),
    Notify(String),
    Corruption(String),
    Serialization(serde_json::Error),
    Io(std::io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(what) => write!(f, "not found: {what}"),
            StorageError::Unavailable(reason) => write!(f, "store unavailable: {reason}"),
            StorageError::Notify(reason) => write!(f, "change notification failed: {reason}"),
            StorageError::Corruption(detail) => write!(f, "corruption detected: {detail}"),
            StorageError::Serialization(err) => write!(f, "serialization error: {err}"),
            StorageError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            StorageError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err)
    }
}
