use crate::backend::Backend;
use crate::error::{BackendError, BackendResult};
use crate::models::StorageLocation;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const READ_BUFFER_SIZE: usize = 128 * 1024;

/// Produces the content checksum recorded for each manifest entry
#[async_trait]
pub trait ChecksumSource: Send + Sync {
    async fn checksum(&self, backend: &dyn Backend, location: &StorageLocation) -> BackendResult<String>;
}

/// Uses the backend's own checksum when it keeps one, otherwise hashes the
/// file contents with SHA-256
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOrSha256;

#[async_trait]
impl ChecksumSource for NativeOrSha256 {
    async fn checksum(&self, backend: &dyn Backend, location: &StorageLocation) -> BackendResult<String> {
        if let Some(native) = backend.native_checksum(location).await? {
            return Ok(native);
        }
        sha256_of(backend, location).await
    }
}

/// Stream a file through SHA-256 and return the lowercase hex digest
pub async fn sha256_of(backend: &dyn Backend, location: &StorageLocation) -> BackendResult<String> {
    let mut reader = backend.open_read(location).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; READ_BUFFER_SIZE];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .await
            .map_err(|e| BackendError::io(backend.id(), location.path(), e))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
