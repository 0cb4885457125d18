use super::{Backend, ReadStream, WriteStream};
use crate::error::{BackendError, BackendResult};
use crate::models::{BackendId, FileCandidate, StorageLocation};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Backend for the local disk (`file://`)
#[derive(Debug, Clone)]
pub struct LocalBackend {
    id: BackendId,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            id: BackendId::local(),
        }
    }

    fn to_path(location: &StorageLocation) -> PathBuf {
        let path = location.path();
        if cfg!(windows) && path.len() > 2 && path.as_bytes()[2] == b':' {
            PathBuf::from(&path[1..])
        } else {
            PathBuf::from(path)
        }
    }

    fn candidate_from_metadata(
        location: StorageLocation,
        metadata: &fs::Metadata,
    ) -> FileCandidate {
        let modified = metadata.modified().ok();
        if metadata.is_dir() {
            FileCandidate::directory(location, modified)
        } else {
            FileCandidate::file(location, metadata.len(), modified)
        }
    }

    async fn blocking<T, F>(&self, location: &StorageLocation, f: F) -> BackendResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> BackendResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.map_err(|e| {
            BackendError::io(&self.id, location.path(), std::io::Error::other(e))
        })?
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk `root` depth-first with siblings sorted by name.
///
/// Symlinks are followed, so a linked directory is listed as a directory with
/// its contents below it and a linked file carries its target's size.
fn walk_sorted(id: &BackendId, root: &Path) -> BackendResult<Vec<FileCandidate>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .unwrap_or(root)
                .to_string_lossy()
                .to_string();
            BackendError::io(id, path, e.into())
        })?;
        let metadata = entry
            .metadata()
            .map_err(|e| BackendError::io(id, entry.path().to_string_lossy(), e.into()))?;
        let location = StorageLocation::local(entry.path())?;
        entries.push(LocalBackend::candidate_from_metadata(location, &metadata));
    }

    Ok(entries)
}

#[async_trait]
impl Backend for LocalBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn stat(&self, location: &StorageLocation) -> BackendResult<FileCandidate> {
        let metadata = tokio::fs::metadata(Self::to_path(location))
            .await
            .map_err(|e| BackendError::io(&self.id, location.path(), e))?;
        Ok(Self::candidate_from_metadata(location.clone(), &metadata))
    }

    async fn list_recursive(&self, location: &StorageLocation) -> BackendResult<Vec<FileCandidate>> {
        let root = self.stat(location).await?;
        if !root.is_dir {
            return Ok(vec![root]);
        }

        let id = self.id.clone();
        let path = Self::to_path(location);
        self.blocking(location, move || walk_sorted(&id, &path)).await
    }

    async fn open_read(&self, location: &StorageLocation) -> BackendResult<ReadStream> {
        let file = tokio::fs::File::open(Self::to_path(location))
            .await
            .map_err(|e| BackendError::io(&self.id, location.path(), e))?;
        Ok(Box::new(file))
    }

    async fn create(&self, location: &StorageLocation, overwrite: bool) -> BackendResult<WriteStream> {
        let path = Self::to_path(location);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::io(&self.id, parent.to_string_lossy(), e))?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let file = options.open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                BackendError::AlreadyExists {
                    backend: self.id.clone(),
                    path: location.path().to_string(),
                }
            } else {
                BackendError::io(&self.id, location.path(), e)
            }
        })?;

        Ok(Box::new(file))
    }

    async fn mkdirs(&self, location: &StorageLocation) -> BackendResult<()> {
        tokio::fs::create_dir_all(Self::to_path(location))
            .await
            .map_err(|e| BackendError::io(&self.id, location.path(), e))
    }

    async fn delete(&self, location: &StorageLocation) -> BackendResult<()> {
        let path = Self::to_path(location);
        let result = if self.stat(location).await?.is_dir {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| BackendError::io(&self.id, location.path(), e))
    }

    async fn set_modified(&self, location: &StorageLocation, modified: SystemTime) -> BackendResult<()> {
        let path = Self::to_path(location);
        let id = self.id.clone();
        let display = location.path().to_string();
        self.blocking(location, move || {
            filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(modified))
                .map_err(|e| BackendError::io(&id, display, e))
        })
        .await
    }
}
