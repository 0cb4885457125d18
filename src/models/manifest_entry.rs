use crate::error::{ReplError, ReplResult};
use serde::{Deserialize, Serialize};

/// Name of the manifest file written under the export root
pub const MANIFEST_FILE_NAME: &str = "_files";

/// Separator between the encoded URI and the encoded checksum. Percent
/// encoding always escapes it, so the first occurrence is the boundary.
const FIELD_SEPARATOR: char = '#';

/// One line of a lazy-export manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifestEntry {
    pub uri: String,
    pub checksum: String,
}

impl ExportManifestEntry {
    pub fn new(uri: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            checksum: checksum.into(),
        }
    }

    /// Encode as a single manifest line, without the trailing newline
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}",
            urlencoding::encode(&self.uri),
            FIELD_SEPARATOR,
            urlencoding::encode(&self.checksum)
        )
    }

    /// Decode one manifest line; `line_number` is only used for error reporting
    pub fn decode(line: &str, line_number: usize) -> ReplResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');
        let malformed = |reason: String| ReplError::MalformedManifestLine {
            line_number,
            reason,
        };

        let (uri, checksum) = line
            .split_once(FIELD_SEPARATOR)
            .ok_or_else(|| malformed(format!("missing '{}' separator", FIELD_SEPARATOR)))?;

        let uri = urlencoding::decode(uri).map_err(|e| malformed(format!("uri: {}", e)))?;
        let checksum =
            urlencoding::decode(checksum).map_err(|e| malformed(format!("checksum: {}", e)))?;

        if uri.is_empty() {
            return Err(malformed("empty uri".to_string()));
        }

        Ok(Self::new(uri.into_owned(), checksum.into_owned()))
    }
}

/// Decode every non-empty line of a manifest
pub fn read_manifest(text: &str) -> ReplResult<Vec<ExportManifestEntry>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| ExportManifestEntry::decode(line, idx + 1))
        .collect()
}
