//! Resume policies.

use std::path::Path;

use crate::entry::CpkEntry;

/// Decides whether an entry is already present in the output, and is told
/// about every entry that gets written.
pub trait SkipPolicy: Send + Sync {
    /// `relative` is the `/`-separated archive path, `target` the output file.
    fn should_skip(&self, relative: &str, target: &Path, entry: &CpkEntry) -> bool;

    /// Called after `entry` was written to `target` in full. `data` holds
    /// exactly the bytes that were written.
    fn record_extracted(&self, relative: &str, target: &Path, entry: &CpkEntry, data: &[u8]) {
        let _ = (relative, target, entry, data);
    }
}

/// Skip when the output exists with the extracted or the stored size.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeMatch;

impl SkipPolicy for SizeMatch {
    fn should_skip(&self, _relative: &str, target: &Path, entry: &CpkEntry) -> bool {
        match std::fs::metadata(target) {
            Ok(meta) => {
                meta.is_file() && (meta.len() == entry.extract_size || meta.len() == entry.file_size)
            }
            Err(_) => false,
        }
    }
}

/// Never skip.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSkip;

impl SkipPolicy for NeverSkip {
    fn should_skip(&self, _relative: &str, _target: &Path, _entry: &CpkEntry) -> bool {
        false
    }
}
