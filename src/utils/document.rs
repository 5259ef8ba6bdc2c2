//! Source and signed documents on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Extension every input must carry.
pub const XML_EXTENSION: &str = "xml";

/// Suffix appended to the file stem of a signed output.
pub const SIGNED_SUFFIX: &str = "_signed";

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An in-memory document: a name and its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    name: String,
    bytes: Vec<u8>,
}

impl Document {
    pub fn new(name: String, bytes: Vec<u8>) -> Self {
        Self { name, bytes }
    }

    /// Read a document, naming it after the file name of `path`.
    pub fn from_file(path: &Path) -> Result<Self, DocumentError> {
        let bytes = fs::read(path).map_err(|source| DocumentError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, bytes })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Write the document to `path`.
    ///
    /// Content goes to a temporary file in the same directory that is
    /// renamed over `path` only once fully written, so a failed write
    /// never leaves a truncated file at `path`.
    pub fn save(&self, path: &Path) -> Result<(), DocumentError> {
        let write_error = |source| DocumentError::Write {
            path: path.to_path_buf(),
            source,
        };

        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(directory).map_err(write_error)?;
        file.write_all(&self.bytes).map_err(write_error)?;
        file.as_file().sync_all().map_err(write_error)?;
        file.persist(path).map_err(|e| write_error(e.error))?;
        Ok(())
    }
}

/// Whether `path` names an `.xml` file.
pub fn is_xml_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == XML_EXTENSION)
}

/// Output path for the signed version of `input`: `<stem>_signed.xml` in the
/// same directory. `None` when `input` is not an `.xml` file.
///
/// Only the file name's own extension is replaced; `.xml` elsewhere in the
/// path is left alone.
pub fn signed_output_path(input: &Path) -> Option<PathBuf> {
    if !is_xml_file(input) {
        return None;
    }
    let stem = input.file_stem()?.to_string_lossy();
    Some(input.with_file_name(format!("{stem}{SIGNED_SUFFIX}.{XML_EXTENSION}")))
}
