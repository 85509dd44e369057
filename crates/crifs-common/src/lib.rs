//! Common utilities for crifs.
//!
//! This crate provides the foundational pieces shared by the CRI crates:
//!
//! - [`BinaryReader`] - Zero-copy binary reading from byte slices, in both
//!   little-endian (CPK packet headers, CRILAYLA) and big-endian (`@UTF` tables)
//! - [`crc`] - CRC-32 (ISO-HDLC) hashing and the compile-time lookup table the
//!   CRI keystream is built from

mod error;
mod reader;

pub mod crc;

pub use error::{Error, Result};
pub use reader::BinaryReader;

/// Re-export zerocopy traits for convenience
pub use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Re-export memchr for SIMD-accelerated byte searching
pub use memchr;
