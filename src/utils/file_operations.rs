use crate::backend::Backend;
use crate::error::{BackendError, BackendResult};
use crate::models::{FileCandidate, StorageLocation};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Files and bytes moved by a transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub files: u64,
    pub bytes: u64,
}

impl TransferStats {
    pub fn merge(&mut self, other: TransferStats) {
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

/// Copy a single file between (possibly different) backends.
///
/// Missing parent directories are created and the source modification time
/// is carried over to the copy.
pub async fn copy_file(
    source_backend: &dyn Backend,
    source: &FileCandidate,
    destination_backend: &dyn Backend,
    destination: &StorageLocation,
    overwrite: bool,
) -> BackendResult<u64> {
    let mut reader = source_backend.open_read(&source.location).await?;
    let mut writer = destination_backend.create(destination, overwrite).await?;

    let bytes = tokio::io::copy(&mut reader, &mut writer)
        .await
        .map_err(|e| BackendError::io(destination_backend.id(), destination.path(), e))?;
    writer
        .shutdown()
        .await
        .map_err(|e| BackendError::io(destination_backend.id(), destination.path(), e))?;
    drop(writer);

    if let Some(modified) = source.modified {
        destination_backend.set_modified(destination, modified).await?;
    }

    debug!("Copied {} -> {} ({} bytes)", source.location, destination, bytes);
    Ok(bytes)
}

/// Copy a file or a whole directory tree so that it ends up at `target`.
///
/// Directory structure below `source` is mirrored below `target`, including
/// empty directories.
pub async fn copy_tree(
    source_backend: &dyn Backend,
    source: &StorageLocation,
    destination_backend: &dyn Backend,
    target: &StorageLocation,
    overwrite: bool,
) -> BackendResult<TransferStats> {
    let root = source_backend.stat(source).await?;
    if !root.is_dir {
        let bytes = copy_file(source_backend, &root, destination_backend, target, overwrite).await?;
        return Ok(TransferStats { files: 1, bytes });
    }

    destination_backend.mkdirs(target).await?;

    let mut stats = TransferStats::default();
    for entry in source_backend.list_recursive(source).await? {
        let Some(relative) = entry.location.relative_to(source) else {
            continue;
        };
        let entry_target = target.join(&relative);

        if entry.is_dir {
            destination_backend.mkdirs(&entry_target).await?;
        } else {
            let bytes =
                copy_file(source_backend, &entry, destination_backend, &entry_target, overwrite)
                    .await?;
            stats.merge(TransferStats { files: 1, bytes });
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalBackend, MemoryBackend};
    use crate::models::BackendId;
    use std::time::{Duration, SystemTime};

    fn remote() -> MemoryBackend {
        MemoryBackend::new(BackendId::new("hdfs", "nn1"))
    }

    fn loc(backend: &MemoryBackend, path: &str) -> StorageLocation {
        StorageLocation::new(backend.id().clone(), path).unwrap()
    }

    #[tokio::test]
    async fn test_copy_tree_mirrors_structure_across_backends() {
        let source = remote();
        source.add_file("/src/t/a", b"aaa");
        source.add_file("/src/t/p=1/b", b"bb");
        source.add_dir("/src/t/empty");

        let dir = tempfile::tempdir().unwrap();
        let local = LocalBackend::new();
        let target = StorageLocation::local(dir.path().join("copy")).unwrap();

        let stats = copy_tree(&source, &loc(&source, "/src/t"), &local, &target, true)
            .await
            .unwrap();

        assert_eq!(stats, TransferStats { files: 2, bytes: 5 });
        assert_eq!(std::fs::read(dir.path().join("copy/a")).unwrap(), b"aaa");
        assert_eq!(std::fs::read(dir.path().join("copy/p=1/b")).unwrap(), b"bb");
        assert!(dir.path().join("copy/empty").is_dir());
    }

    #[tokio::test]
    async fn test_copy_file_preserves_modification_time_and_overwrites() {
        let source = remote();
        source.add_file("/f", b"new contents");
        let past = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        source.set_modified(&loc(&source, "/f"), past).await.unwrap();

        let destination = MemoryBackend::new(BackendId::new("hdfs", "nn2"));
        destination.add_file("/out/f", b"old");

        let candidate = source.stat(&loc(&source, "/f")).await.unwrap();
        let bytes = copy_file(&source, &candidate, &destination, &loc(&destination, "/out/f"), true)
            .await
            .unwrap();

        assert_eq!(bytes, 12);
        assert_eq!(destination.read_file("/out/f").unwrap(), b"new contents");
        assert_eq!(destination.modified("/out/f"), Some(past));
    }

    #[tokio::test]
    async fn test_copy_missing_source_fails() {
        let source = remote();
        let destination = remote();
        let err = copy_tree(&source, &loc(&source, "/nope"), &destination, &loc(&destination, "/x"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotFound { .. }));
    }
}
