//! Observation products as they sit in the LOP buffer.
//!
//! A product is one container file (plus companion files archived with it) inside a
//! capture directory of the buffer:
//!
//! ```text
//! <buffer root>/
//!   1555862422/                        capture block directory
//!     1555862422_sdp_l0.rdb            record-database product ...
//!     1555862422_sdp_l0.full.rdb       ... and its companion
//!     1555862422_sdp_l0.met            side-car metadata (written by the trawler)
//!   1555862422_sdp_l0/                 capture stream directory
//!   1402481532/
//!     1402481532.h5                    legacy HDF5 product
//!     1402481532.h5.md5                optional writer checksum, read during extraction
//!     1402481532.writing.h5            still being written, ignored
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

/// Capture directories: a 10-digit capture block id, optionally followed by a stream name.
pub const CAPTURE_DIR_REGEX: &str = r"^[0-9]{10}([-_].*)?$";

/// Operator token that quarantines a whole capture directory.
pub const DIR_FAILED_TOKEN: &str = "failed";

/// Token written by the upstream writer once a capture directory is complete.
pub const COMPLETE_TOKEN: &str = "complete";

/// Infix marking files that are still being written.
pub const WRITING_INFIX: &str = ".writing.";

/// Extension of the per-product failure token.
pub const FAILED_EXTENSION: &str = "failed";

/// Extension of the metadata side-car file.
pub const METADATA_EXTENSION: &str = "met";

/// Extension of the checksum file an upstream writer may leave beside a container.
pub const CHECKSUM_EXTENSION: &str = "md5";

const LEGACY_EXTENSION: &str = "h5";
const RECORD_DB_EXTENSION: &str = "rdb";
const RECORD_DB_FULL_SUFFIX: &str = ".full.rdb";

#[allow(clippy::expect_used)]
static CAPTURE_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(CAPTURE_DIR_REGEX).expect("Invalid capture directory regex"));

pub(crate) fn capture_dir_regex() -> &'static Regex {
    &CAPTURE_DIR_RE
}

/// Unique identifier of one observation product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureId(String);

impl CaptureId {
    /// Wrap an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The capture block part: the leading 10 digits.
    pub fn capture_block(&self) -> &str {
        match self.0.split_once(['_', '-']) {
            Some((block, _)) => block,
            None => &self.0,
        }
    }

    /// The stream part after the capture block, if any.
    pub fn stream(&self) -> Option<&str> {
        self.0.split_once(['_', '-']).map(|(_, stream)| stream)
    }
}

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CaptureId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The two container formats found in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    /// Legacy HDF5 container (`.h5`).
    Legacy,
    /// Record-database container: a Redis RDB dump (`.rdb`).
    RecordDb,
}

impl ContainerFormat {
    /// File signature at offset 0.
    pub fn magic(self) -> &'static [u8] {
        match self {
            ContainerFormat::Legacy => b"\x89HDF\r\n\x1a\n",
            ContainerFormat::RecordDb => b"REDIS",
        }
    }

    /// MIME type recorded in `CAS.ReferenceMimeType`.
    pub fn mime_type(self) -> &'static str {
        match self {
            ContainerFormat::Legacy => "application/x-hdf5",
            ContainerFormat::RecordDb => "application/x-redis-rdb",
        }
    }

    /// Format of a primary container file, judged by its name.
    ///
    /// Companion (`.full.rdb`), in-progress (`.writing.`) and unrelated files yield `None`.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.contains(WRITING_INFIX) || name.ends_with(RECORD_DB_FULL_SUFFIX) {
            return None;
        }
        match path.extension()?.to_str()? {
            LEGACY_EXTENSION => Some(ContainerFormat::Legacy),
            RECORD_DB_EXTENSION => Some(ContainerFormat::RecordDb),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerFormat::Legacy => f.write_str("legacy-hdf5"),
            ContainerFormat::RecordDb => f.write_str("record-db"),
        }
    }
}

/// One observation product in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    /// Unique capture identifier.
    pub capture_id: CaptureId,
    /// Primary container file.
    pub path: PathBuf,
    /// Files archived together with the primary container.
    pub companions: Vec<PathBuf>,
    /// Total size of all files in bytes.
    pub size: u64,
    /// Latest modification time across all files.
    pub modified: SystemTime,
    /// Container format of the primary file.
    pub format: ContainerFormat,
}

impl Product {
    /// Build a product description for `path` by reading filesystem metadata.
    ///
    /// Returns `Ok(None)` when the file is not a primary container, or when a required
    /// companion is not present yet.
    pub fn from_path(path: &Path) -> std::io::Result<Option<Self>> {
        let Some(format) = ContainerFormat::from_path(path) else {
            return Ok(None);
        };
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            return Ok(None);
        };

        let companions = match format {
            ContainerFormat::Legacy => Vec::new(),
            ContainerFormat::RecordDb => {
                let full = path.with_file_name(format!("{stem}{RECORD_DB_FULL_SUFFIX}"));
                if !full.is_file() {
                    return Ok(None);
                }
                vec![full]
            }
        };

        let mut size = 0u64;
        let mut modified = SystemTime::UNIX_EPOCH;
        for file in std::iter::once(path).chain(companions.iter().map(PathBuf::as_path)) {
            let meta = std::fs::metadata(file)?;
            size += meta.len();
            modified = modified.max(meta.modified()?);
        }

        Ok(Some(Self {
            capture_id: CaptureId::new(stem),
            path: path.to_path_buf(),
            companions,
            size,
            modified,
            format,
        }))
    }

    /// Describe a container file found outside the buffer workflow.
    ///
    /// Unlike [`Product::from_path`], a record-database file without its `.full.rdb`
    /// sibling is accepted on its own.
    pub fn standalone(path: &Path) -> std::io::Result<Option<Self>> {
        if let Some(product) = Self::from_path(path)? {
            return Ok(Some(product));
        }
        let (Some(format), Some(stem)) = (
            ContainerFormat::from_path(path),
            path.file_stem().and_then(|s| s.to_str()),
        ) else {
            return Ok(None);
        };
        let meta = std::fs::metadata(path)?;
        Ok(Some(Self {
            capture_id: CaptureId::new(stem),
            path: path.to_path_buf(),
            companions: Vec::new(),
            size: meta.len(),
            modified: meta.modified()?,
            format,
        }))
    }

    /// All files belonging to the product, primary first.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.path.as_path()).chain(self.companions.iter().map(PathBuf::as_path))
    }

    /// Directory holding the product.
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Path of the metadata side-car for this product.
    pub fn sidecar_path(&self) -> PathBuf {
        self.directory()
            .join(format!("{}.{}", self.capture_id, METADATA_EXTENSION))
    }

    /// Path of the optional `<file>.md5` checksum beside the primary file.
    pub fn checksum_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(CHECKSUM_EXTENSION);
        PathBuf::from(name)
    }

    /// Path of the per-product failure token.
    pub fn failed_token_path(&self) -> PathBuf {
        self.directory()
            .join(format!("{}.{}", self.capture_id, FAILED_EXTENSION))
    }

    /// Whether a failure token has been written for this product.
    pub fn is_quarantined(&self) -> bool {
        self.failed_token_path().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn capture_id_parts() {
        let id = CaptureId::new("1555862422_sdp_l0");
        assert_eq!(id.capture_block(), "1555862422");
        assert_eq!(id.stream(), Some("sdp_l0"));

        let legacy = CaptureId::new("1402481532");
        assert_eq!(legacy.capture_block(), "1402481532");
        assert_eq!(legacy.stream(), None);
    }

    #[test]
    fn capture_directory_pattern() {
        let re = capture_dir_regex();
        assert!(re.is_match("1555862422"));
        assert!(re.is_match("1555862422_sdp_l0"));
        assert!(re.is_match("1555862422-sdp-l1-flags"));
        assert!(!re.is_match("failed"));
        assert!(!re.is_match("155586242"));
    }

    #[test]
    fn format_from_path() {
        assert_eq!(
            ContainerFormat::from_path(Path::new("/b/1402481532.h5")),
            Some(ContainerFormat::Legacy)
        );
        assert_eq!(
            ContainerFormat::from_path(Path::new("/b/1555862422_sdp_l0.rdb")),
            Some(ContainerFormat::RecordDb)
        );
        assert_eq!(
            ContainerFormat::from_path(Path::new("/b/1555862422_sdp_l0.full.rdb")),
            None
        );
        assert_eq!(
            ContainerFormat::from_path(Path::new("/b/1402481532.writing.h5")),
            None
        );
        assert_eq!(ContainerFormat::from_path(Path::new("/b/notes.txt")), None);
    }

    #[test]
    fn record_db_product_needs_companion() {
        let dir = tempfile::tempdir().unwrap();
        let lite = dir.path().join("1555862422_sdp_l0.rdb");
        fs::write(&lite, b"REDIS0009").unwrap();
        assert!(Product::from_path(&lite).unwrap().is_none());

        fs::write(dir.path().join("1555862422_sdp_l0.full.rdb"), b"REDIS0009xx").unwrap();
        let product = Product::from_path(&lite).unwrap().unwrap();
        assert_eq!(product.capture_id.as_str(), "1555862422_sdp_l0");
        assert_eq!(product.companions.len(), 1);
        assert_eq!(product.size, 9 + 11);
        assert_eq!(
            product.sidecar_path(),
            dir.path().join("1555862422_sdp_l0.met")
        );
    }
}
