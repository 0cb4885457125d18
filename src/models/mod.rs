pub mod file_candidate;
pub mod location;
pub mod manifest_entry;

pub use file_candidate::{ContentSummary, FileCandidate};
pub use location::{BackendId, StorageLocation, LOCAL_SCHEME};
pub use manifest_entry::{read_manifest, ExportManifestEntry, MANIFEST_FILE_NAME};
