//! Error types for the CPK crate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when working with CPK archives.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error with the offending path attached.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Common library error.
    #[error("{0}")]
    Common(#[from] crifs_common::Error),

    /// Input does not start with the expected format magic.
    #[error("bad magic: expected {expected:?}, got {actual:02x?}")]
    BadMagic {
        expected: &'static str,
        actual: Vec<u8>,
    },

    /// Buffer shorter than a structure that must be read from it.
    #[error("truncated {what}: needed {needed} bytes, {available} available")]
    Truncated {
        what: &'static str,
        needed: u64,
        available: u64,
    },

    /// Entry payload extends past the end of the archive.
    #[error("entry {name} at {offset:#x}+{size} exceeds archive length {archive_len}")]
    TruncatedEntry {
        name: String,
        offset: u64,
        size: u64,
        archive_len: u64,
    },

    /// The directory tables are inconsistent; no partial listing is returned.
    #[error("corrupt directory: {0}")]
    CorruptDirectory(String),

    /// A UTF table's schema is malformed.
    #[error("invalid UTF table: {0}")]
    InvalidTable(String),

    /// CRILAYLA stream violated a codec invariant.
    #[error("decompression error: {0}")]
    Decompression(String),

    /// No candidate key produced a recognizable magic.
    #[error("no cipher key found for {file_name} after {attempts} candidates")]
    UnknownKey { file_name: String, attempts: usize },

    /// Entry output path would escape the output root.
    #[error("path escapes output directory: {0}")]
    PathTraversal(String),

    /// Bytes written do not match the size recorded in the directory.
    #[error("integrity check failed for {name}: expected {expected} bytes, wrote {actual}")]
    IntegrityMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// A second entry resolves to an output path another entry already claimed.
    #[error("another entry already extracts to {0}")]
    DuplicateOutput(String),

    /// Entry not found.
    #[error("entry not found: {0}")]
    EntryNotFound(String),
}

impl Error {
    /// Wrap an I/O error together with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error makes the whole archive unusable, as opposed to one entry.
    pub fn is_archive_fatal(&self) -> bool {
        matches!(
            self,
            Error::BadMagic { .. } | Error::CorruptDirectory(_) | Error::UnknownKey { .. }
        )
    }
}

/// Result type for CPK operations.
pub type Result<T> = std::result::Result<T, Error>;
