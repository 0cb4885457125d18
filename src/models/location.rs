use crate::error::{BackendError, BackendResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Scheme used by the local disk backend
pub const LOCAL_SCHEME: &str = "file";

/// Identity of a storage backend instance (scheme plus authority)
///
/// Two handles obtained separately for the same cluster compare equal, so
/// grouping by `BackendId` never produces duplicate groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId {
    pub scheme: String,
    pub authority: String,
}

impl BackendId {
    pub fn new(scheme: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            authority: authority.into().to_ascii_lowercase(),
        }
    }

    pub fn local() -> Self {
        Self::new(LOCAL_SCHEME, "")
    }

    pub fn is_local(&self) -> bool {
        self.scheme == LOCAL_SCHEME
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// A path on a particular storage backend
///
/// Paths are absolute, `/`-separated and carry no trailing slash except for
/// the backend root itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocation {
    backend: BackendId,
    path: String,
}

impl StorageLocation {
    pub fn new(backend: BackendId, path: &str) -> BackendResult<Self> {
        if !path.starts_with('/') {
            return Err(BackendError::invalid_location(
                path,
                "path must be absolute",
            ));
        }
        Ok(Self {
            backend,
            path: normalize_path(path),
        })
    }

    /// Parse `scheme://authority/path`, or a bare absolute path on local disk
    pub fn parse(input: &str) -> BackendResult<Self> {
        let input = input.trim();
        let Some((scheme, rest)) = input.split_once("://") else {
            return Self::new(BackendId::local(), input);
        };

        let valid_scheme = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme {
            return Err(BackendError::invalid_location(input, "invalid scheme"));
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        Self::new(BackendId::new(scheme, authority), path)
    }

    /// Location of a path on local disk
    pub fn local<P: AsRef<Path>>(path: P) -> BackendResult<Self> {
        let raw = path.as_ref().to_string_lossy().replace('\\', "/");
        if raw.starts_with('/') {
            Self::new(BackendId::local(), &raw)
        } else if cfg!(windows) && raw.chars().nth(1) == Some(':') {
            Self::new(BackendId::local(), &format!("/{}", raw))
        } else {
            Err(BackendError::invalid_location(raw, "path must be absolute"))
        }
    }

    pub fn backend(&self) -> &BackendId {
        &self.backend
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fully-qualified URI, e.g. `hdfs://nn1:8020/warehouse/t/part-0000`
    pub fn to_uri(&self) -> String {
        format!("{}{}", self.backend, self.path)
    }

    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            return self.clone();
        }
        let joined = if self.path == "/" {
            format!("/{}", relative)
        } else {
            format!("{}/{}", self.path, relative)
        };
        Self {
            backend: self.backend.clone(),
            path: normalize_path(&joined),
        }
    }

    /// Last path component; `None` for the backend root
    pub fn file_name(&self) -> Option<&str> {
        self.path.rsplit('/').next().filter(|name| !name.is_empty())
    }

    pub fn parent(&self) -> Option<Self> {
        if self.path == "/" {
            return None;
        }
        let idx = self.path.rfind('/')?;
        let parent = if idx == 0 { "/" } else { &self.path[..idx] };
        Some(Self {
            backend: self.backend.clone(),
            path: parent.to_string(),
        })
    }

    /// Path of `self` below `root`, or `None` when `self` is not inside `root`
    pub fn relative_to(&self, root: &StorageLocation) -> Option<String> {
        if self.backend != root.backend {
            return None;
        }
        if self.path == root.path {
            return Some(String::new());
        }
        let prefix = if root.path == "/" {
            "/".to_string()
        } else {
            format!("{}/", root.path)
        };
        self.path.strip_prefix(&prefix).map(str::to_string)
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

impl FromStr for StorageLocation {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    format!("/{}", segments.join("/"))
}
