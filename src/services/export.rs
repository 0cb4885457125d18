use crate::backend::{Backend, BackendRegistry};
use crate::error::{BackendError, ReplError, ReplResult};
use crate::models::{ExportManifestEntry, FileCandidate, StorageLocation, MANIFEST_FILE_NAME};
use crate::services::checksum::{ChecksumSource, NativeOrSha256};
use crate::utils::copy_file;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

/// What an export writes under the export root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    /// Copy every qualifying file's bytes
    Materialize,
    /// Write a manifest of checksummed references instead of copying
    ManifestOnly,
}

/// Report structure for export operations
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub mode: ExportMode,
    pub source_root: String,
    pub export_root: String,
    pub files_exported: usize,
    pub entries_excluded: usize,
    pub bytes_exported: u64,
    pub manifest: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExportReport {
    fn new(planner: &ExportPlanner, mode: ExportMode) -> Self {
        let now = Utc::now();
        Self {
            mode,
            source_root: planner.source_root.to_uri(),
            export_root: planner.export_root.to_uri(),
            files_exported: 0,
            entries_excluded: 0,
            bytes_exported: 0,
            manifest: None,
            started_at: now,
            finished_at: now,
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

/// Exports one source tree to an export root, either as copies or as a
/// manifest of references
pub struct ExportPlanner {
    source_root: StorageLocation,
    export_root: StorageLocation,
    source_backend: Arc<dyn Backend>,
    export_backend: Arc<dyn Backend>,
    checksums: Arc<dyn ChecksumSource>,
}

impl ExportPlanner {
    pub fn new(
        registry: &BackendRegistry,
        source_root: StorageLocation,
        export_root: StorageLocation,
    ) -> ReplResult<Self> {
        let source_backend = registry.resolve(&source_root)?;
        let export_backend = registry.resolve(&export_root)?;
        Ok(Self {
            source_root,
            export_root,
            source_backend,
            export_backend,
            checksums: Arc::new(NativeOrSha256),
        })
    }

    /// Replace how manifest checksums are computed
    pub fn with_checksum_source(mut self, checksums: Arc<dyn ChecksumSource>) -> Self {
        self.checksums = checksums;
        self
    }

    /// Where a manifest export writes its list of references
    pub fn manifest_location(&self) -> StorageLocation {
        self.export_root.join(MANIFEST_FILE_NAME)
    }

    pub async fn export(&self, mode: ExportMode) -> ReplResult<ExportReport> {
        // Copies under the source root would overwrite or re-list the files
        // being exported. A manifest there is fine since `_files` is excluded.
        if mode == ExportMode::Materialize
            && self.export_root.relative_to(&self.source_root).is_some()
        {
            return Err(ReplError::InvalidArgument(format!(
                "cannot materialize {} into itself or its subdirectory {}",
                self.source_root, self.export_root
            )));
        }

        info!(
            "Exporting {} to {} ({:?})",
            self.source_root, self.export_root, mode
        );
        let report = match mode {
            ExportMode::Materialize => self.copy_files().await?,
            ExportMode::ManifestOnly => self.export_files_as_list().await?,
        };
        info!(
            "Export completed. Exported: {}, Excluded: {}, Bytes: {}",
            report.files_exported, report.entries_excluded, report.bytes_exported
        );
        Ok(report)
    }

    async fn enumerate(&self) -> ReplResult<Vec<FileCandidate>> {
        self.source_backend
            .list_recursive(&self.source_root)
            .await
            .map_err(|source| ReplError::Enumeration {
                backend: self.source_root.backend().clone(),
                path: self.source_root.path().to_string(),
                source,
            })
    }

    /// Destination of `file`, mirroring its path below the source root
    fn export_target(&self, file: &FileCandidate) -> StorageLocation {
        match file.location.relative_to(&self.source_root) {
            Some(relative) if !relative.is_empty() => self.export_root.join(&relative),
            // The source root is itself a file
            _ => self.export_root.join(file.name()),
        }
    }

    async fn copy_files(&self) -> ReplResult<ExportReport> {
        let mut report = ExportReport::new(self, ExportMode::Materialize);

        for file in self.enumerate().await? {
            if !file.should_export() {
                report.entries_excluded += 1;
                continue;
            }

            let target = self.export_target(&file);
            let bytes = copy_file(
                self.source_backend.as_ref(),
                &file,
                self.export_backend.as_ref(),
                &target,
                true,
            )
            .await
            .map_err(|source| ReplError::CopyExecution {
                source_uri: file.location.to_uri(),
                destination: target.to_uri(),
                source,
            })?;

            report.files_exported += 1;
            report.bytes_exported += bytes;
        }

        Ok(report.finish())
    }

    async fn export_files_as_list(&self) -> ReplResult<ExportReport> {
        let manifest = self.manifest_location();
        let manifest_error = |source: BackendError| ReplError::CopyExecution {
            source_uri: self.source_root.to_uri(),
            destination: manifest.to_uri(),
            source,
        };

        let exists = self
            .export_backend
            .exists(&manifest)
            .await
            .map_err(manifest_error)?;
        if exists {
            return Err(self.manifest_conflict(&manifest));
        }

        debug!("Exporting data files in {} to {}", self.source_root, manifest);
        let stream = match self.export_backend.create(&manifest, false).await {
            Ok(stream) => stream,
            // Lost a race with another exporter
            Err(BackendError::AlreadyExists { .. }) => return Err(self.manifest_conflict(&manifest)),
            Err(e) => return Err(manifest_error(e)),
        };

        let mut report = ExportReport::new(self, ExportMode::ManifestOnly);
        match self.write_manifest(BufWriter::new(stream), &mut report).await {
            Ok(()) => {
                report.manifest = Some(manifest.to_uri());
                Ok(report.finish())
            }
            Err(e) => {
                // A partial manifest must never be mistaken for a complete one
                if let Err(cleanup) = self.export_backend.delete(&manifest).await {
                    warn!("Failed to remove partial manifest {}: {}", manifest, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Owns the manifest stream; it is released on every return path
    async fn write_manifest<W>(&self, mut writer: W, report: &mut ExportReport) -> ReplResult<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let manifest = self.manifest_location();
        let write_error = |source: std::io::Error| ReplError::CopyExecution {
            source_uri: self.source_root.to_uri(),
            destination: manifest.to_uri(),
            source: BackendError::io(self.export_backend.id(), manifest.path(), source),
        };

        for file in self.enumerate().await? {
            if !file.should_export() {
                report.entries_excluded += 1;
                continue;
            }

            let uri = file.location.to_uri();
            let checksum = self
                .checksums
                .checksum(self.source_backend.as_ref(), &file.location)
                .await
                .map_err(|source| ReplError::Checksum {
                    uri: uri.clone(),
                    source,
                })?;

            let line = ExportManifestEntry::new(uri, checksum).encode();
            writer.write_all(line.as_bytes()).await.map_err(write_error)?;
            writer.write_all(b"\n").await.map_err(write_error)?;

            report.files_exported += 1;
            report.bytes_exported += file.size;
        }

        writer.shutdown().await.map_err(write_error)?;
        Ok(())
    }

    fn manifest_conflict(&self, manifest: &StorageLocation) -> ReplError {
        ReplError::ManifestConflict {
            manifest: manifest.to_uri(),
            source_root: self.source_root.to_uri(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalBackend, MemoryBackend, ReadStream, WriteStream};
    use crate::error::BackendResult;
    use crate::models::{read_manifest, BackendId};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every listing while delegating everything else
    struct UnlistableBackend {
        inner: MemoryBackend,
    }

    #[async_trait]
    impl Backend for UnlistableBackend {
        fn id(&self) -> &BackendId {
            self.inner.id()
        }
        async fn stat(&self, location: &StorageLocation) -> BackendResult<FileCandidate> {
            self.inner.stat(location).await
        }
        async fn list_recursive(&self, location: &StorageLocation) -> BackendResult<Vec<FileCandidate>> {
            Err(BackendError::io(
                self.inner.id(),
                location.path(),
                std::io::Error::other("listing unavailable"),
            ))
        }
        async fn open_read(&self, location: &StorageLocation) -> BackendResult<ReadStream> {
            self.inner.open_read(location).await
        }
        async fn create(&self, location: &StorageLocation, overwrite: bool) -> BackendResult<WriteStream> {
            self.inner.create(location, overwrite).await
        }
        async fn mkdirs(&self, location: &StorageLocation) -> BackendResult<()> {
            self.inner.mkdirs(location).await
        }
        async fn delete(&self, location: &StorageLocation) -> BackendResult<()> {
            self.inner.delete(location).await
        }
    }

    /// Counts checksum requests and optionally fails on one path
    #[derive(Default)]
    struct CountingChecksums {
        calls: AtomicUsize,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl ChecksumSource for CountingChecksums {
        async fn checksum(&self, backend: &dyn Backend, location: &StorageLocation) -> BackendResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.as_deref() == Some(location.path()) {
                return Err(BackendError::io(
                    backend.id(),
                    location.path(),
                    std::io::Error::other("checksum unavailable"),
                ));
            }
            NativeOrSha256.checksum(backend, location).await
        }
    }

    fn warehouse() -> MemoryBackend {
        let fs = MemoryBackend::new(BackendId::new("hdfs", "nn1:8020"));
        fs.add_file("/warehouse/t/p=1/part-0000", b"row1\nrow2\n");
        fs.add_file("/warehouse/t/p=1/_SUCCESS", b"");
        fs.add_file("/warehouse/t/p=2/part-0000", b"row3\n");
        fs.add_file("/warehouse/t/.hidden", b"tmp");
        fs.add_file("/warehouse/t/_tmp/part-9999", b"staging");
        fs.add_file("/warehouse/t/with space ü.orc", b"orc");
        fs
    }

    fn planner(source: &MemoryBackend, export: &MemoryBackend) -> ExportPlanner {
        let registry = BackendRegistry::new();
        registry.register(Arc::new(source.clone()));
        registry.register(Arc::new(export.clone()));
        ExportPlanner::new(
            &registry,
            StorageLocation::parse("hdfs://nn1:8020/warehouse/t").unwrap(),
            StorageLocation::parse("hdfs://nn2/dump/t/data").unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_manifest_lists_qualifying_files_with_checksums() {
        let source = warehouse();
        let export = MemoryBackend::new(BackendId::new("hdfs", "nn2"));
        let report = planner(&source, &export)
            .export(ExportMode::ManifestOnly)
            .await
            .unwrap();

        let text = String::from_utf8(export.read_file("/dump/t/data/_files").unwrap()).unwrap();
        assert!(text.ends_with('\n'));
        let entries = read_manifest(&text).unwrap();
        let uris: Vec<&str> = entries.iter().map(|e| e.uri.as_str()).collect();

        // Files under an underscore directory are still exported; only the
        // base name decides
        assert_eq!(
            uris,
            vec![
                "hdfs://nn1:8020/warehouse/t/_tmp/part-9999",
                "hdfs://nn1:8020/warehouse/t/p=1/part-0000",
                "hdfs://nn1:8020/warehouse/t/p=2/part-0000",
                "hdfs://nn1:8020/warehouse/t/with space ü.orc",
            ]
        );
        assert_eq!(
            entries[1].checksum,
            crate::services::checksum::sha256_of(
                &source,
                &StorageLocation::parse(&entries[1].uri).unwrap()
            )
            .await
            .unwrap()
        );

        assert_eq!(report.files_exported, 4);
        assert_eq!(report.manifest.as_deref(), Some("hdfs://nn2/dump/t/data/_files"));
        // Nothing but the manifest was written
        assert_eq!(export.file_paths(), vec!["/dump/t/data/_files".to_string()]);
    }

    #[tokio::test]
    async fn test_existing_manifest_fails_before_any_checksum() {
        let source = warehouse();
        let export = MemoryBackend::new(BackendId::new("hdfs", "nn2"));
        export.add_file("/dump/t/data/_files", b"previous run\n");

        let checksums = Arc::new(CountingChecksums::default());
        let err = planner(&source, &export)
            .with_checksum_source(checksums.clone())
            .export(ExportMode::ManifestOnly)
            .await
            .unwrap_err();

        assert!(matches!(err, ReplError::ManifestConflict { .. }));
        assert!(!err.is_retriable());
        assert_eq!(checksums.calls.load(Ordering::SeqCst), 0);
        assert_eq!(export.read_file("/dump/t/data/_files").unwrap(), b"previous run\n");
    }

    #[tokio::test]
    async fn test_failed_checksum_removes_partial_manifest() {
        let source = warehouse();
        let export = MemoryBackend::new(BackendId::new("hdfs", "nn2"));
        let checksums = Arc::new(CountingChecksums {
            fail_on: Some("/warehouse/t/p=2/part-0000".to_string()),
            ..CountingChecksums::default()
        });

        let err = planner(&source, &export)
            .with_checksum_source(checksums.clone())
            .export(ExportMode::ManifestOnly)
            .await
            .unwrap_err();

        assert!(matches!(err, ReplError::Checksum { .. }));
        assert_eq!(checksums.calls.load(Ordering::SeqCst), 3);
        assert!(export.read_file("/dump/t/data/_files").is_none());
    }

    #[tokio::test]
    async fn test_missing_source_is_enumeration_error() {
        let source = MemoryBackend::new(BackendId::new("hdfs", "nn1:8020"));
        let export = MemoryBackend::new(BackendId::new("hdfs", "nn2"));

        let err = planner(&source, &export)
            .export(ExportMode::Materialize)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::Enumeration { .. }));
    }

    #[tokio::test]
    async fn test_materialize_mirrors_relative_paths() {
        let source = warehouse();
        let export = MemoryBackend::new(BackendId::new("hdfs", "nn2"));

        let report = planner(&source, &export)
            .export(ExportMode::Materialize)
            .await
            .unwrap();

        assert_eq!(report.files_exported, 4);
        // _SUCCESS, .hidden and the directories p=1, p=2, _tmp
        assert_eq!(report.entries_excluded, 5);
        assert_eq!(
            export.file_paths(),
            vec![
                "/dump/t/data/_tmp/part-9999".to_string(),
                "/dump/t/data/p=1/part-0000".to_string(),
                "/dump/t/data/p=2/part-0000".to_string(),
                "/dump/t/data/with space ü.orc".to_string(),
            ]
        );
        assert_eq!(
            export.read_file("/dump/t/data/p=1/part-0000").unwrap(),
            b"row1\nrow2\n"
        );
    }

    #[tokio::test]
    async fn test_materialize_on_local_disk() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("a/b/part-0000"), b"1").unwrap();
        std::fs::write(src.path().join("a/_SUCCESS"), b"").unwrap();
        std::fs::write(src.path().join(".crc"), b"x").unwrap();
        std::fs::write(src.path().join("top"), b"22").unwrap();

        let registry = BackendRegistry::new();
        registry.register(Arc::new(LocalBackend::new()));
        let planner = ExportPlanner::new(
            &registry,
            StorageLocation::local(src.path()).unwrap(),
            StorageLocation::local(dst.path()).unwrap(),
        )
        .unwrap();

        let report = planner.export(ExportMode::Materialize).await.unwrap();
        assert_eq!(report.files_exported, 2);
        assert_eq!(report.bytes_exported, 3);

        let copied: BTreeSet<String> = walkdir::WalkDir::new(dst.path())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(dst.path())
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        assert_eq!(
            copied,
            BTreeSet::from(["a/b/part-0000".to_string(), "top".to_string()])
        );
    }

    #[tokio::test]
    async fn test_single_file_source_root() {
        let source = warehouse();
        let export = MemoryBackend::new(BackendId::new("hdfs", "nn2"));
        let registry = BackendRegistry::new();
        registry.register(Arc::new(source.clone()));
        registry.register(Arc::new(export.clone()));
        let planner = ExportPlanner::new(
            &registry,
            StorageLocation::parse("hdfs://nn1:8020/warehouse/t/p=2/part-0000").unwrap(),
            StorageLocation::parse("hdfs://nn2/out").unwrap(),
        )
        .unwrap();

        planner.export(ExportMode::Materialize).await.unwrap();
        assert_eq!(export.read_file("/out/part-0000").unwrap(), b"row3\n");
    }

    #[tokio::test]
    async fn test_failed_listing_removes_partial_manifest() {
        let source = UnlistableBackend {
            inner: warehouse(),
        };
        let export = MemoryBackend::new(BackendId::new("hdfs", "nn2"));
        let registry = BackendRegistry::new();
        registry.register(Arc::new(source));
        registry.register(Arc::new(export.clone()));
        let planner = ExportPlanner::new(
            &registry,
            StorageLocation::parse("hdfs://nn1:8020/warehouse/t").unwrap(),
            StorageLocation::parse("hdfs://nn2/dump/t/data").unwrap(),
        )
        .unwrap();

        let err = planner.export(ExportMode::ManifestOnly).await.unwrap_err();
        assert!(matches!(err, ReplError::Enumeration { .. }));
        assert!(export.read_file("/dump/t/data/_files").is_none());
        assert!(export.file_paths().is_empty());
    }

    fn local_planner(source: &std::path::Path, export: &std::path::Path) -> ExportPlanner {
        ExportPlanner::new(
            &BackendRegistry::new(),
            StorageLocation::local(source).unwrap(),
            StorageLocation::local(export).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_materialize_into_source_tree_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("p=1")).unwrap();
        std::fs::write(dir.path().join("p=1/part-0000"), b"precious data").unwrap();

        for export_root in [dir.path().to_path_buf(), dir.path().join("p=1")] {
            let err = local_planner(dir.path(), &export_root)
                .export(ExportMode::Materialize)
                .await
                .unwrap_err();
            assert!(matches!(err, ReplError::InvalidArgument(_)));
        }
        assert_eq!(
            std::fs::read(dir.path().join("p=1/part-0000")).unwrap(),
            b"precious data"
        );
    }

    #[tokio::test]
    async fn test_manifest_inside_source_tree_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("part-0000"), b"abc").unwrap();

        let report = local_planner(dir.path(), dir.path())
            .export(ExportMode::ManifestOnly)
            .await
            .unwrap();
        assert_eq!(report.files_exported, 1);

        let text = std::fs::read_to_string(dir.path().join("_files")).unwrap();
        let entries = read_manifest(&text).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].uri.ends_with("/part-0000"));
        assert_eq!(std::fs::read(dir.path().join("part-0000")).unwrap(), b"abc");
    }
}
