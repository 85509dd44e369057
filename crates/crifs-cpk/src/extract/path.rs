//! Output path resolution.

use std::path::{Component, Path, PathBuf};

use crate::entry::CpkEntry;
use crate::{Error, Result};

/// Map an entry to a file under `root`.
///
/// Both separators are accepted. Parent, root and drive components are
/// rejected rather than normalized away, so a crafted directory never
/// lands outside `root`.
pub fn resolve_output(root: &Path, entry: &CpkEntry) -> Result<PathBuf> {
    let relative = format!("{}/{}", entry.directory, entry.file_name);
    let mut out = root.to_path_buf();
    let mut depth = 0;

    for part in relative.split(['/', '\\']) {
        if part.is_empty() || part == "." {
            continue;
        }

        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => {
                out.push(name);
                depth += 1;
            }
            _ => return Err(Error::PathTraversal(relative)),
        }
    }

    if depth == 0 || entry.file_name.trim_matches(['/', '\\', '.']).is_empty() {
        return Err(Error::PathTraversal(relative));
    }

    Ok(out)
}
