//! Unified storage backend trait for sync trees.
//!
//! A backend exposes one directory tree through relative, forward-slash
//! paths. The engine never touches host paths directly; every side of a sync
//! pair is driven through this trait so local directories and remote stores
//! plug in interchangeably.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

/// Readable byte stream handed out by [`StorageBackend::read`].
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// A file or directory observed during a scan.
///
/// Immutable within a run; `relative_path` always uses `/` separators
/// regardless of host OS.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub relative_path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
    /// Unix permission bits where the backend supports them.
    pub permissions: Option<u32>,
    /// Content hash, populated by comparators that computed one.
    pub hash: Option<String>,
}

impl FileRecord {
    pub fn file(
        relative_path: impl Into<String>,
        size: u64,
        modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            size,
            modified,
            is_dir: false,
            permissions: None,
            hash: None,
        }
    }

    pub fn dir(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            size: 0,
            modified: None,
            is_dir: true,
            permissions: None,
            hash: None,
        }
    }
}

/// Metadata to apply to a freshly written file.
#[derive(Debug, Clone, Default)]
pub struct WriteMetadata {
    pub modified: Option<DateTime<Utc>>,
    pub permissions: Option<u32>,
}

impl From<&FileRecord> for WriteMetadata {
    fn from(record: &FileRecord) -> Self {
        Self {
            modified: record.modified,
            permissions: record.permissions,
        }
    }
}

/// Uniform access to one side of a sync pair.
///
/// Implementations must be internally thread-safe for every operation they
/// expose; the engine shares a backend across concurrent workers.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// List every file and directory under `prefix`, ordered by relative
    /// path. Directory entries are included so the engine can mirror tree
    /// structure and clean up orphaned directories.
    async fn list(&self, prefix: &str) -> Result<Vec<FileRecord>>;

    /// Stat a single path. `Ok(None)` means the path does not exist.
    async fn stat(&self, path: &str) -> Result<Option<FileRecord>>;

    /// Open a readable stream over a file's content.
    async fn read(&self, path: &str) -> Result<ByteStream>;

    /// Write a file from `data`, creating missing parent directories and
    /// preserving mod-time and permission bits from `meta`. A byte count
    /// differing from `expected_size` is an error.
    async fn write(
        &self,
        path: &str,
        data: ByteStream,
        expected_size: u64,
        meta: &WriteMetadata,
    ) -> Result<()>;

    /// Create a directory and any missing parents. Idempotent.
    async fn mkdir_all(&self, path: &str) -> Result<()>;

    /// Delete a file or an empty directory. Deleting a non-empty directory
    /// may fail; callers decide whether that is tolerable.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Human-readable identity of this backend, for logs and reports.
    fn describe(&self) -> String;
}
