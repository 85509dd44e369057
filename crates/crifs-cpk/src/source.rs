//! Archive byte sources.
//!
//! An archive is read either through a memory map or through positioned
//! reads on a shared file handle. The strategy is picked once when the archive
//! is opened; everything above this module only sees [`ArchiveSource`].

use std::borrow::Cow;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::{Error, Result};

/// Which I/O strategy backs a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Mapped,
    Buffered,
}

/// Random-access, read-only archive bytes shared across threads.
pub trait ArchiveSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> SourceKind;

    /// Fill `buf` with the bytes at `offset`.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Bytes at `offset..offset + len`, borrowed when the source allows it.
    fn bytes_at(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(Cow::Owned(buf))
    }
}

fn check_range(offset: u64, len: usize, total: u64) -> Result<()> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= total => Ok(()),
        _ => Err(Error::Truncated {
            what: "archive range",
            needed: offset.saturating_add(len as u64),
            available: total,
        }),
    }
}

/// Memory-mapped archive.
pub struct MappedSource {
    mmap: Mmap,
}

impl MappedSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        // SAFETY: the map is read-only and archives are not modified while open.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
        Ok(Self { mmap })
    }

    /// The whole mapping.
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }
}

impl ArchiveSource for MappedSource {
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Mapped
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes_at(offset, buf.len())?;
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    fn bytes_at(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        check_range(offset, len, self.len())?;
        let start = offset as usize;
        Ok(Cow::Borrowed(&self.mmap[start..start + len]))
    }
}

/// Archive read with positioned reads on one shared handle.
pub struct FileSource {
    file: File,
    path: PathBuf,
    len: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }
}

impl ArchiveSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Buffered
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        read_exact_at(&self.file, buf, offset).map_err(|e| Error::io(&self.path, e))
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Open `path` with the strategy its size calls for.
///
/// Files of at least `mmap_threshold` bytes are mapped; smaller (and empty)
/// files use positioned reads.
pub fn open_source(path: &Path, mmap_threshold: u64) -> Result<Box<dyn ArchiveSource>> {
    let len = std::fs::metadata(path).map_err(|e| Error::io(path, e))?.len();

    let source: Box<dyn ArchiveSource> = if len > 0 && len >= mmap_threshold {
        Box::new(MappedSource::open(path)?)
    } else {
        Box::new(FileSource::open(path)?)
    };

    tracing::debug!(len, kind = ?source.kind(), "opened {}", path.display());
    Ok(source)
}
