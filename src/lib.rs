pub mod backend;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use backend::{Backend, BackendRegistry, LocalBackend, MemoryBackend};
pub use error::{BackendError, BulkCopyError, ReplError, ReplResult};
pub use models::{BackendId, ExportManifestEntry, FileCandidate, StorageLocation};
pub use services::{
    BulkCopyConfig, BulkCopyJob, CopyPolicyConfig, CopyReport, CopyStrategySelector, ExportMode,
    ExportPlanner, ExportReport,
};

// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub copy_policy: CopyPolicyConfig,
    pub bulk_copy: BulkCopyConfig,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            copy_policy: CopyPolicyConfig::default(),
            bulk_copy: BulkCopyConfig::default(),
            log_level: "info".to_string(),
        }
    }
}
