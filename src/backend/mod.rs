//! Storage backend abstraction
//!
//! Every source and destination location is owned by exactly one backend,
//! identified by its [`BackendId`]. The copy selector and the export planner
//! only talk to storage through the [`Backend`] trait, so the local disk, an
//! in-memory store and remote clusters are interchangeable.

mod local;
mod memory;
mod registry;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use registry::BackendRegistry;

use crate::error::{BackendError, BackendResult};
use crate::models::{BackendId, ContentSummary, FileCandidate, StorageLocation};
use async_trait::async_trait;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream returned by [`Backend::open_read`]
pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;

/// Byte sink returned by [`Backend::create`]
pub type WriteStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Uniform async access to one storage backend instance
///
/// Handles are shared as `Arc<dyn Backend>` and must be safe to use from
/// several tasks at once.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Identity of the backend instance this handle talks to
    fn id(&self) -> &BackendId;

    /// Metadata of a single file or directory
    ///
    /// Returns `BackendError::NotFound` if nothing exists at `location`.
    async fn stat(&self, location: &StorageLocation) -> BackendResult<FileCandidate>;

    async fn exists(&self, location: &StorageLocation) -> BackendResult<bool> {
        match self.stat(location).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every file and directory below `location`, in a deterministic order.
    ///
    /// Listing a file returns that single file.
    async fn list_recursive(&self, location: &StorageLocation) -> BackendResult<Vec<FileCandidate>>;

    /// Aggregate size and file count of the subtree rooted at `location`
    async fn content_summary(&self, location: &StorageLocation) -> BackendResult<ContentSummary> {
        let root = self.stat(location).await?;
        if !root.is_dir {
            return Ok(ContentSummary::of_file(root.size));
        }

        let mut summary = ContentSummary {
            directory_count: 1,
            ..ContentSummary::default()
        };
        for entry in self.list_recursive(location).await? {
            summary.add_entry(&entry);
        }
        Ok(summary)
    }

    async fn open_read(&self, location: &StorageLocation) -> BackendResult<ReadStream>;

    /// Open `location` for writing, creating missing parent directories.
    ///
    /// With `overwrite == false` creation is exclusive and fails with
    /// `BackendError::AlreadyExists` if the file is already there.
    async fn create(&self, location: &StorageLocation, overwrite: bool) -> BackendResult<WriteStream>;

    /// Create a directory and any missing parents; succeeds if it already exists
    async fn mkdirs(&self, location: &StorageLocation) -> BackendResult<()>;

    /// Remove a file, or a directory with everything below it
    async fn delete(&self, location: &StorageLocation) -> BackendResult<()>;

    async fn set_modified(&self, _location: &StorageLocation, _modified: SystemTime) -> BackendResult<()> {
        Ok(())
    }

    /// Checksum maintained by the backend itself, if it keeps one
    async fn native_checksum(&self, _location: &StorageLocation) -> BackendResult<Option<String>> {
        Ok(None)
    }
}
