//! CPK archive reader.
//!
//! Opening an archive resolves its cipher key from the first 16 bytes and
//! parses the `CPK ` header. The file listing is parsed on first use and
//! cached for the lifetime of the handle, so repeated listings and bulk
//! extractions share one parse.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::crypto::{CipherKey, CriCipher, Decryptor};
use crate::decompress;
use crate::entry::CpkEntry;
use crate::key::{self, KnownMagic, PROBE_LEN};
use crate::source::{self, ArchiveSource, SourceKind};
use crate::toc::{self, CpkHeader};
use crate::{Error, Result};

/// Archives at least this large are memory-mapped by default.
pub const DEFAULT_MMAP_THRESHOLD: u64 = 256 * 1024 * 1024;

/// How to open an archive.
#[derive(Clone)]
pub struct OpenOptions {
    /// Use this key instead of deriving one from the file name.
    pub key: Option<CipherKey>,
    /// Extra names to derive candidate keys from.
    pub aliases: Vec<String>,
    /// Replace the CRI cipher with a custom hook. Takes precedence over `key`.
    pub decryptor: Option<Arc<dyn Decryptor>>,
    pub mmap_threshold: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            key: None,
            aliases: Vec::new(),
            decryptor: None,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
        }
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("key", &self.key)
            .field("aliases", &self.aliases)
            .field("decryptor", &self.decryptor.as_ref().map(|_| "custom"))
            .field("mmap_threshold", &self.mmap_threshold)
            .finish()
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: CipherKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn with_mmap_threshold(mut self, threshold: u64) -> Self {
        self.mmap_threshold = threshold;
        self
    }
}

/// Bytes of one extracted entry.
#[derive(Debug, Clone)]
pub struct ExtractedEntry<'a> {
    /// Final bytes. Borrowed straight from the mapping when possible.
    pub data: Cow<'a, [u8]>,
    /// Whether the payload was CRILAYLA-compressed.
    pub decompressed: bool,
}

impl ExtractedEntry<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_owned(self) -> Vec<u8> {
        self.data.into_owned()
    }
}

/// Per-worker scratch space for [`CpkArchive::read_with`].
#[derive(Debug, Default)]
pub struct ReadBuffers {
    raw: Vec<u8>,
    inflated: Vec<u8>,
}

impl ReadBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size the raw buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: Vec::with_capacity(capacity),
            inflated: Vec::new(),
        }
    }
}

/// An open CPK archive.
///
/// The handle is `Sync`; entries can be read from many threads at once.
pub struct CpkArchive {
    path: PathBuf,
    name: String,
    source: Box<dyn ArchiveSource>,
    key: Option<CipherKey>,
    decryptor: Option<Arc<dyn Decryptor>>,
    header: CpkHeader,
    entries: RwLock<Option<Arc<[CpkEntry]>>>,
}

impl fmt::Debug for CpkArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpkArchive")
            .field("path", &self.path)
            .field("len", &self.source.len())
            .field("source", &self.source.kind())
            .field("key", &self.key)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl CpkArchive {
    /// Open an archive, deriving its key from the file name when encrypted.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, OpenOptions::default())
    }

    /// Open an archive with explicit options.
    pub fn open_with<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let source = source::open_source(path, options.mmap_threshold)?;

        if source.len() < PROBE_LEN as u64 {
            return Err(Error::Truncated {
                what: "CPK header",
                needed: PROBE_LEN as u64,
                available: source.len(),
            });
        }
        let mut probe = [0u8; PROBE_LEN];
        source.read_into(0, &mut probe)?;

        let (key, decryptor) = resolve_cipher(&name, &probe, &options)?;

        let header = toc::read_header(source.as_ref(), decryptor.as_deref())?;

        tracing::info!(
            archive = %name,
            len = source.len(),
            source = ?source.kind(),
            encrypted = decryptor.is_some(),
            "opened archive"
        );

        Ok(Self {
            path: path.to_path_buf(),
            name,
            source,
            key,
            decryptor,
            header,
            entries: RwLock::new(None),
        })
    }

    /// Get the archive file name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archive length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.source.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    #[inline]
    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    /// The CRI key in use, if the archive is encrypted with one.
    #[inline]
    pub fn key(&self) -> Option<CipherKey> {
        self.key
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.decryptor.is_some()
    }

    #[inline]
    pub fn header(&self) -> &CpkHeader {
        &self.header
    }

    /// The file listing, parsed once and shared.
    pub fn entries(&self) -> Result<Arc<[CpkEntry]>> {
        if let Some(entries) = self.entries.read().as_ref() {
            return Ok(Arc::clone(entries));
        }

        let mut guard = self.entries.write();
        if let Some(entries) = guard.as_ref() {
            return Ok(Arc::clone(entries));
        }

        let parsed: Arc<[CpkEntry]> =
            toc::read_entries(self.source.as_ref(), &self.header, self.decryptor.as_deref())?
                .into();
        tracing::debug!(archive = %self.name, entries = parsed.len(), "parsed directory");
        *guard = Some(Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Find an entry by its virtual path (case-insensitive, either separator).
    pub fn find(&self, path: &str) -> Result<Option<CpkEntry>> {
        let wanted = normalize(path);
        Ok(self
            .entries()?
            .iter()
            .find(|e| normalize(&e.relative_path()).eq_ignore_ascii_case(&wanted))
            .cloned())
    }

    /// Read an entry, decrypting and decompressing as needed.
    pub fn read(&self, entry: &CpkEntry) -> Result<ExtractedEntry<'_>> {
        let size = self.checked_size(entry)?;
        let mut payload = self.source.bytes_at(entry.file_offset, size)?;

        if let Some(decryptor) = &self.decryptor {
            decryptor.decrypt(entry.file_offset, payload.to_mut());
        }

        if decompress::is_compressed(&payload) {
            check_announced_size(entry, &payload)?;
            let inflated = decompress::decompress(&payload)?;
            return Ok(ExtractedEntry {
                data: Cow::Owned(inflated),
                decompressed: true,
            });
        }

        Ok(ExtractedEntry {
            data: payload,
            decompressed: false,
        })
    }

    /// Read an entry reusing caller-owned buffers.
    ///
    /// Plain entries of a mapped archive are returned without copying.
    pub fn read_with<'a>(
        &'a self,
        entry: &CpkEntry,
        buffers: &'a mut ReadBuffers,
    ) -> Result<ExtractedEntry<'a>> {
        let size = self.checked_size(entry)?;
        let ReadBuffers { raw, inflated } = buffers;

        let payload: &'a [u8] =
            if self.decryptor.is_none() && self.source.kind() == SourceKind::Mapped {
                match self.source.bytes_at(entry.file_offset, size)? {
                    Cow::Borrowed(slice) => slice,
                    Cow::Owned(bytes) => {
                        *raw = bytes;
                        &raw[..]
                    }
                }
            } else {
                raw.clear();
                raw.resize(size, 0);
                self.source.read_into(entry.file_offset, raw)?;
                if let Some(decryptor) = &self.decryptor {
                    decryptor.decrypt(entry.file_offset, raw);
                }
                &raw[..]
            };

        if decompress::is_compressed(payload) {
            check_announced_size(entry, payload)?;
            decompress::decompress_into(payload, inflated)?;
            return Ok(ExtractedEntry {
                data: Cow::Borrowed(&inflated[..]),
                decompressed: true,
            });
        }

        Ok(ExtractedEntry {
            data: Cow::Borrowed(payload),
            decompressed: false,
        })
    }

    /// Read an entry by virtual path into an owned buffer.
    pub fn read_path(&self, path: &str) -> Result<Vec<u8>> {
        let entry = self
            .find(path)?
            .ok_or_else(|| Error::EntryNotFound(path.to_string()))?;
        Ok(self.read(&entry)?.into_owned())
    }

    fn checked_size(&self, entry: &CpkEntry) -> Result<usize> {
        let archive_len = self.source.len();
        let truncated = || Error::TruncatedEntry {
            name: entry.relative_path(),
            offset: entry.file_offset,
            size: entry.file_size,
            archive_len,
        };

        match entry.end_offset() {
            Some(end) if end <= archive_len => {
                usize::try_from(entry.file_size).map_err(|_| truncated())
            }
            _ => Err(truncated()),
        }
    }
}

/// A compressed entry must announce the size its directory row records.
/// Rows without a separate extract size are not checked.
fn check_announced_size(entry: &CpkEntry, payload: &[u8]) -> Result<()> {
    if !entry.is_compressed() {
        return Ok(());
    }
    match decompress::decompressed_size(payload) {
        Some(size) if size as u64 == entry.extract_size => Ok(()),
        announced => Err(Error::Decompression(format!(
            "{} announces {} bytes but the directory records {}",
            entry.relative_path(),
            announced.unwrap_or(0),
            entry.extract_size
        ))),
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

type ResolvedCipher = (Option<CipherKey>, Option<Arc<dyn Decryptor>>);

/// Work out how the archive header is encrypted.
fn resolve_cipher(name: &str, probe: &[u8], options: &OpenOptions) -> Result<ResolvedCipher> {
    if let Some(decryptor) = &options.decryptor {
        let mut window = probe.to_vec();
        decryptor.decrypt(0, &mut window);
        if KnownMagic::detect(&window) != Some(KnownMagic::Cpk) {
            return Err(Error::BadMagic {
                expected: "CPK ",
                actual: window[..window.len().min(4)].to_vec(),
            });
        }
        return Ok((None, Some(Arc::clone(decryptor))));
    }

    if KnownMagic::detect(probe) == Some(KnownMagic::Cpk) {
        if options.key.is_some() {
            tracing::debug!("ignoring explicit key for plaintext archive {name}");
        }
        return Ok((None, None));
    }

    let key = match options.key {
        Some(key) => {
            key::verify_key(key, probe)?;
            key
        }
        None => key::find_key(name, probe, &options.aliases)?
            .ok_or_else(|| Error::BadMagic {
                expected: "CPK ",
                actual: probe[..probe.len().min(4)].to_vec(),
            })?,
    };

    let cipher: Arc<dyn Decryptor> = Arc::new(CriCipher::new(key));
    Ok((Some(key), Some(cipher)))
}

/// Decrypt (or encrypt) a whole archive file.
///
/// Without an explicit key, the key is derived from the input's file name.
/// Returns the key used, or `None` when the input is already plaintext and
/// nothing was written.
pub fn decrypt_file(
    input: &Path,
    output: &Path,
    key: Option<CipherKey>,
    aliases: &[String],
    buffer_size: usize,
) -> Result<Option<CipherKey>> {
    let key = match key {
        Some(key) => key,
        None => {
            let mut probe = [0u8; PROBE_LEN];
            let source = source::FileSource::open(input)?;
            let len = (source.len() as usize).min(PROBE_LEN);
            source.read_into(0, &mut probe[..len])?;

            let name = input
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            match key::find_key(name, &probe[..len], aliases)? {
                Some(key) => key,
                None => return Ok(None),
            }
        }
    };

    crate::crypto::transcode_file(input, output, key, buffer_size)?;
    tracing::info!(key = %key, "transcoded {} -> {}", input.display(), output.display());
    Ok(Some(key))
}
