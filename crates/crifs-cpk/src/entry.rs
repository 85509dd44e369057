//! CPK directory entry.

use std::path::{Path, PathBuf};

/// A file stored in a CPK archive.
///
/// This is directory metadata only. Use [`CpkArchive::read`](crate::CpkArchive::read)
/// to get the contents.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpkEntry {
    /// Directory inside the archive. Empty for root-level files.
    pub directory: String,
    /// File name.
    pub file_name: String,
    /// Absolute offset of the payload in the archive.
    pub file_offset: u64,
    /// Stored size (possibly compressed).
    pub file_size: u64,
    /// Size after decompression. Equal to `file_size` for stored entries.
    pub extract_size: u64,
    /// File ID from the directory table.
    pub id: u32,
    /// Optional user string attached by the packer.
    pub user_string: Option<String>,
}

impl CpkEntry {
    pub fn new(
        directory: impl Into<String>,
        file_name: impl Into<String>,
        file_offset: u64,
        file_size: u64,
        extract_size: u64,
    ) -> Self {
        Self {
            directory: directory.into(),
            file_name: file_name.into(),
            file_offset,
            file_size,
            extract_size,
            id: 0,
            user_string: None,
        }
    }

    /// Set the file ID.
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Virtual path inside the archive, always `/`-separated.
    pub fn relative_path(&self) -> String {
        let directory = self.directory.trim_matches(|c| c == '/' || c == '\\');
        if directory.is_empty() {
            self.file_name.clone()
        } else {
            format!("{directory}/{}", self.file_name)
        }
    }

    /// Relative output path using the host separator.
    ///
    /// This does not validate the path; the extractor rejects entries that
    /// would escape the output directory.
    pub fn output_path(&self) -> PathBuf {
        self.relative_path()
            .split(['/', '\\'])
            .filter(|part| !part.is_empty())
            .collect()
    }

    /// Whether the directory marks this entry as compressed.
    ///
    /// The payload magic is authoritative; this is the size-based hint.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.extract_size != self.file_size
    }

    /// End of the payload in the archive.
    #[inline]
    pub fn end_offset(&self) -> Option<u64> {
        self.file_offset.checked_add(self.file_size)
    }

    /// Get the file extension, if any.
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path() {
        assert_eq!(CpkEntry::new("", "a.bin", 0, 1, 1).relative_path(), "a.bin");
        assert_eq!(
            CpkEntry::new("sound/bgm", "a.acb", 0, 1, 1).relative_path(),
            "sound/bgm/a.acb"
        );
        assert_eq!(CpkEntry::new("/data/", "b", 0, 1, 1).relative_path(), "data/b");
    }

    #[test]
    fn test_output_path_uses_components() {
        let entry = CpkEntry::new("a\\b", "c.txt", 0, 1, 1);
        let expected: PathBuf = ["a", "b", "c.txt"].iter().collect();
        assert_eq!(entry.output_path(), expected);
    }

    #[test]
    fn test_compression_hint() {
        assert!(!CpkEntry::new("", "a", 0, 10, 10).is_compressed());
        assert!(CpkEntry::new("", "a", 0, 10, 300).is_compressed());
        assert_eq!(CpkEntry::new("", "a", 5, 10, 10).end_offset(), Some(15));
        assert_eq!(CpkEntry::new("", "a.usm", 0, 1, 1).extension(), Some("usm"));
    }
}
