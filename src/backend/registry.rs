use super::{Backend, LocalBackend};
use crate::error::{BackendError, BackendResult};
use crate::models::{BackendId, StorageLocation};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Resolves storage locations to shared backend handles
///
/// Backends for remote clusters are registered up front; the local disk
/// backend is created on first use. Lookups are keyed by [`BackendId`], so
/// equivalent locations always share one handle.
#[derive(Default)]
pub struct BackendRegistry {
    backends: Mutex<HashMap<BackendId, Arc<dyn Backend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own identity, replacing any previous one
    pub fn register(&self, backend: Arc<dyn Backend>) {
        let id = backend.id().clone();
        debug!("Registering backend {}", id);
        self.backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, backend);
    }

    pub fn resolve(&self, location: &StorageLocation) -> BackendResult<Arc<dyn Backend>> {
        self.resolve_id(location.backend())
    }

    pub fn resolve_id(&self, id: &BackendId) -> BackendResult<Arc<dyn Backend>> {
        let mut backends = self.backends.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(backend) = backends.get(id) {
            return Ok(Arc::clone(backend));
        }

        if id.is_local() {
            let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new());
            backends.insert(id.clone(), Arc::clone(&backend));
            return Ok(backend);
        }

        Err(BackendError::UnknownBackend(id.clone()))
    }
}
