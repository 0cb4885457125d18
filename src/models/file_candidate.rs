use crate::models::StorageLocation;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// An entry found while enumerating a source tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCandidate {
    pub location: StorageLocation,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl FileCandidate {
    pub fn file(location: StorageLocation, size: u64, modified: Option<SystemTime>) -> Self {
        Self {
            location,
            is_dir: false,
            size,
            modified,
        }
    }

    pub fn directory(location: StorageLocation, modified: Option<SystemTime>) -> Self {
        Self {
            location,
            is_dir: true,
            size: 0,
            modified,
        }
    }

    pub fn name(&self) -> &str {
        self.location.file_name().unwrap_or("")
    }

    /// Directories and names starting with `_` or `.` (job markers such as
    /// `_SUCCESS`, staging and hidden files) are never exported.
    pub fn should_export(&self) -> bool {
        let name = self.name();
        !(self.is_dir || name.starts_with('_') || name.starts_with('.'))
    }
}

/// Backend-reported aggregate of a subtree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSummary {
    pub length: u64,
    pub file_count: u64,
    pub directory_count: u64,
}

impl ContentSummary {
    /// Summary of a single regular file
    pub fn of_file(length: u64) -> Self {
        Self {
            length,
            file_count: 1,
            directory_count: 0,
        }
    }

    /// Fold the summary of one listed entry into this aggregate
    pub fn add_entry(&mut self, entry: &FileCandidate) {
        if entry.is_dir {
            self.directory_count += 1;
        } else {
            self.length = self.length.saturating_add(entry.size);
            self.file_count += 1;
        }
    }
}
