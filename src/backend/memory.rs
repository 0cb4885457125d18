use super::{Backend, ReadStream, WriteStream};
use crate::error::{BackendError, BackendResult};
use crate::models::{BackendId, FileCandidate, StorageLocation};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::io::AsyncWrite;

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, MemoryFile>,
    dirs: BTreeSet<String>,
}

impl MemoryState {
    fn is_dir(&self, path: &str) -> bool {
        if path == "/" || self.dirs.contains(path) {
            return true;
        }
        let prefix = format!("{}/", path);
        self.files.keys().any(|p| p.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }
}

/// In-memory backend with an arbitrary identity
///
/// Clones share the same contents, so a test can register one clone with a
/// registry and inspect the other. Directories exist implicitly above every
/// file and can also be added explicitly.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    id: BackendId,
    state: Arc<Mutex<MemoryState>>,
    native_checksums: bool,
}

impl MemoryBackend {
    pub fn new(id: BackendId) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(MemoryState::default())),
            native_checksums: false,
        }
    }

    /// Report a SHA-256 based checksum from [`Backend::native_checksum`],
    /// the way a distributed filesystem exposes its own block checksums
    pub fn with_native_checksums(mut self) -> Self {
        self.native_checksums = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.state().files.insert(
            path.to_string(),
            MemoryFile {
                data: data.to_vec(),
                modified: SystemTime::now(),
            },
        );
    }

    pub fn add_dir(&self, path: &str) {
        self.state().dirs.insert(path.to_string());
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).map(|f| f.data.clone())
    }

    pub fn modified(&self, path: &str) -> Option<SystemTime> {
        self.state().files.get(path).map(|f| f.modified)
    }

    /// Paths of all stored files, sorted
    pub fn file_paths(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    fn not_found(&self, location: &StorageLocation) -> BackendError {
        BackendError::NotFound {
            backend: self.id.clone(),
            path: location.path().to_string(),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn stat(&self, location: &StorageLocation) -> BackendResult<FileCandidate> {
        let state = self.state();
        if let Some(file) = state.files.get(location.path()) {
            return Ok(FileCandidate::file(
                location.clone(),
                file.data.len() as u64,
                Some(file.modified),
            ));
        }
        if state.is_dir(location.path()) {
            return Ok(FileCandidate::directory(location.clone(), None));
        }
        Err(self.not_found(location))
    }

    async fn list_recursive(&self, location: &StorageLocation) -> BackendResult<Vec<FileCandidate>> {
        let root = self.stat(location).await?;
        if !root.is_dir {
            return Ok(vec![root]);
        }

        let state = self.state();
        let prefix = if location.path() == "/" {
            "/".to_string()
        } else {
            format!("{}/", location.path())
        };

        let mut dirs: BTreeSet<String> = state
            .dirs
            .iter()
            .filter(|d| d.starts_with(&prefix))
            .cloned()
            .collect();
        let mut entries: BTreeMap<String, FileCandidate> = BTreeMap::new();

        for (path, file) in state.files.range(prefix.clone()..) {
            if !path.starts_with(&prefix) {
                break;
            }
            // Every ancestor between the root and the file is a directory
            let mut idx = prefix.len();
            while let Some(offset) = path[idx..].find('/') {
                dirs.insert(path[..idx + offset].to_string());
                idx += offset + 1;
            }
            let file_location = location.join(&path[prefix.len()..]);
            entries.insert(
                path.clone(),
                FileCandidate::file(file_location, file.data.len() as u64, Some(file.modified)),
            );
        }

        for dir in dirs {
            let dir_location = location.join(&dir[prefix.len()..]);
            entries.insert(dir, FileCandidate::directory(dir_location, None));
        }

        Ok(entries.into_values().collect())
    }

    async fn open_read(&self, location: &StorageLocation) -> BackendResult<ReadStream> {
        let data = self
            .state()
            .files
            .get(location.path())
            .map(|f| f.data.clone())
            .ok_or_else(|| self.not_found(location))?;
        Ok(Box::new(io::Cursor::new(data)))
    }

    async fn create(&self, location: &StorageLocation, overwrite: bool) -> BackendResult<WriteStream> {
        let mut state = self.state();
        let path = location.path().to_string();

        if state.is_dir(&path) {
            return Err(BackendError::io(
                &self.id,
                path,
                io::Error::other("is a directory"),
            ));
        }
        if !overwrite && state.files.contains_key(&path) {
            return Err(BackendError::AlreadyExists {
                backend: self.id.clone(),
                path,
            });
        }

        state.files.insert(
            path.clone(),
            MemoryFile {
                data: Vec::new(),
                modified: SystemTime::now(),
            },
        );

        Ok(Box::new(MemoryWriter {
            state: Arc::clone(&self.state),
            path,
            buffer: Vec::new(),
        }))
    }

    async fn mkdirs(&self, location: &StorageLocation) -> BackendResult<()> {
        let mut state = self.state();
        if state.files.contains_key(location.path()) {
            return Err(BackendError::AlreadyExists {
                backend: self.id.clone(),
                path: location.path().to_string(),
            });
        }
        state.dirs.insert(location.path().to_string());
        Ok(())
    }

    async fn delete(&self, location: &StorageLocation) -> BackendResult<()> {
        let mut state = self.state();
        let path = location.path();
        if state.files.remove(path).is_some() {
            return Ok(());
        }
        if !state.is_dir(path) {
            return Err(self.not_found(location));
        }
        let prefix = format!("{}/", path);
        state.files.retain(|p, _| !p.starts_with(&prefix));
        state.dirs.retain(|d| d != path && !d.starts_with(&prefix));
        Ok(())
    }

    async fn set_modified(&self, location: &StorageLocation, modified: SystemTime) -> BackendResult<()> {
        match self.state().files.get_mut(location.path()) {
            Some(file) => {
                file.modified = modified;
                Ok(())
            }
            None => Err(self.not_found(location)),
        }
    }

    async fn native_checksum(&self, location: &StorageLocation) -> BackendResult<Option<String>> {
        if !self.native_checksums {
            return Ok(None);
        }
        let state = self.state();
        let file = state
            .files
            .get(location.path())
            .ok_or_else(|| self.not_found(location))?;
        Ok(Some(format!("SHA-256:{:x}", Sha256::digest(&file.data))))
    }
}

/// Buffers writes and publishes them to the shared state on flush,
/// shutdown and drop
struct MemoryWriter {
    state: Arc<Mutex<MemoryState>>,
    path: String,
    buffer: Vec<u8>,
}

impl MemoryWriter {
    fn publish(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = state.files.get_mut(&self.path) {
            file.data = self.buffer.clone();
            file.modified = SystemTime::now();
        }
    }
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.publish();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.publish();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn backend() -> MemoryBackend {
        MemoryBackend::new(BackendId::new("hdfs", "nn1:8020"))
    }

    fn loc(path: &str) -> StorageLocation {
        StorageLocation::new(BackendId::new("hdfs", "nn1:8020"), path).unwrap()
    }

    #[tokio::test]
    async fn test_list_recursive_synthesizes_directories() {
        let fs = backend();
        fs.add_file("/warehouse/t/p=1/part-0000", b"abc");
        fs.add_file("/warehouse/t/_SUCCESS", b"");
        fs.add_dir("/warehouse/t/empty");
        fs.add_file("/warehouse/other/x", b"x");

        let entries = fs.list_recursive(&loc("/warehouse/t")).await.unwrap();
        let listed: Vec<(&str, bool)> = entries
            .iter()
            .map(|e| (e.location.path(), e.is_dir))
            .collect();

        assert_eq!(
            listed,
            vec![
                ("/warehouse/t/_SUCCESS", false),
                ("/warehouse/t/empty", true),
                ("/warehouse/t/p=1", true),
                ("/warehouse/t/p=1/part-0000", false),
            ]
        );
    }

    #[tokio::test]
    async fn test_writer_publishes_on_shutdown() {
        let fs = backend();
        let mut writer = fs.create(&loc("/out/data"), false).await.unwrap();
        writer.write_all(b"payload").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let mut read_back = Vec::new();
        fs.open_read(&loc("/out/data"))
            .await
            .unwrap()
            .read_to_end(&mut read_back)
            .await
            .unwrap();
        assert_eq!(read_back, b"payload");
        assert!(fs.exists(&loc("/out")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_directory_removes_subtree() {
        let fs = backend();
        fs.add_file("/a/b/c", b"1");
        fs.add_file("/a/d", b"2");
        fs.add_file("/ab", b"3");

        fs.delete(&loc("/a")).await.unwrap();
        assert_eq!(fs.file_paths(), vec!["/ab".to_string()]);
    }

    #[tokio::test]
    async fn test_native_checksum_only_when_enabled() {
        let plain = backend();
        plain.add_file("/f", b"data");
        assert_eq!(plain.native_checksum(&loc("/f")).await.unwrap(), None);

        let native = backend().with_native_checksums();
        native.add_file("/f", b"data");
        let checksum = native.native_checksum(&loc("/f")).await.unwrap().unwrap();
        assert!(checksum.starts_with("SHA-256:"));
    }
}
