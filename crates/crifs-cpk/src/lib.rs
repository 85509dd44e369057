//! CPK archive reader for CRI Middleware game files.
//!
//! A CPK archive is a packet container whose directory is stored in `@UTF`
//! tables. This crate supports:
//!
//! - `@UTF` table parsing, including masked tables and Shift-JIS pools
//! - TOC and ITOC (ID-indexed) directories
//! - Whole-file XOR encryption keyed by the CRC-32 of the archive name
//! - CRILAYLA decompression (and compression, for round trips)
//! - Memory-mapped or buffered positional reads
//! - Parallel bulk extraction with resume, cancellation and progress
//!
//! # Example
//!
//! ```no_run
//! use crifs_cpk::CpkArchive;
//!
//! let archive = CpkArchive::open("movie.cpk")?;
//!
//! for entry in archive.entries()?.iter() {
//!     println!("{}: {} bytes", entry.relative_path(), entry.extract_size);
//! }
//!
//! // Read a specific file
//! if let Some(entry) = archive.find("sound/bgm.acb")? {
//!     let data = archive.read(&entry)?;
//!     println!("{} bytes", data.len());
//! }
//! # Ok::<(), crifs_cpk::Error>(())
//! ```

mod archive;
mod entry;
mod error;

pub mod crypto;
pub mod decompress;
pub mod extract;
pub mod key;
pub mod source;
pub mod toc;
pub mod utf;

pub use archive::{
    decrypt_file, CpkArchive, ExtractedEntry, OpenOptions, ReadBuffers, DEFAULT_MMAP_THRESHOLD,
};
pub use crypto::{CipherKey, CriCipher, Decryptor};
pub use entry::CpkEntry;
pub use error::{Error, Result};
pub use extract::{
    dump_cpk, CancellationToken, ExtractionOptions, ExtractionProgress, ExtractionSummary,
    Extractor, ProgressSink, SkipPolicy,
};
pub use source::SourceKind;
pub use toc::CpkHeader;
