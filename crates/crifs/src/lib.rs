//! Crifs - CRI Middleware CPK archive extraction library.
//!
//! This crate provides a unified interface to the crifs crates.
//!
//! # Crates
//!
//! - [`crifs_common`] - Common utilities (binary reading, CRC-32)
//! - [`crifs_cpk`] - CPK archives (`@UTF` tables, XOR cipher, CRILAYLA, extraction)
//!
//! # Example
//!
//! ```no_run
//! use crifs::prelude::*;
//!
//! // Open an archive; encrypted ones are keyed by their file name
//! let archive = CpkArchive::open("voice.cpk")?;
//!
//! // Extract everything with the default worker count
//! let summary = Extractor::new(&archive, ExtractionOptions::default())
//!     .extract_all("out".as_ref(), &NoProgress)?;
//! println!("{} extracted, {} failed", summary.extracted, summary.failed);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub use crifs_common as common;
pub use crifs_cpk as cpk;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crifs_common::crc;
    pub use crifs_cpk::extract::{NeverSkip, NoProgress, SizeMatch};
    pub use crifs_cpk::{
        CancellationToken, CipherKey, CpkArchive, CpkEntry, ExtractionOptions,
        ExtractionProgress, ExtractionSummary, Extractor, OpenOptions, ProgressSink, SkipPolicy,
    };
}

pub use crifs_cpk::{Error, Result};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
