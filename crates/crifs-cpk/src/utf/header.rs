//! `@UTF` table header.
//!
//! Every CRI table starts with a fixed 0x20-byte big-endian header. All pool
//! and row offsets in it are relative to byte 8 (just past the magic and the
//! size field) and are normalized to table-absolute offsets here.

use std::borrow::Cow;

use crifs_common::BinaryReader;
use zerocopy::byteorder::big_endian::{I32, U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::{Error, Result};

/// `@UTF` as a big-endian word.
pub const UTF_MAGIC: u32 = 0x4055_5446;

/// Table offsets are stored relative to this base.
pub const BASE_OFFSET: usize = 0x08;

/// Size of the fixed header; the column schema starts right after it.
pub const HEADER_SIZE: usize = 0x20;

/// `@UTF` after masking with [`mask_in_place`].
pub const MASKED_MAGIC: [u8; 4] = [0x1F, 0x9E, 0xF3, 0xF5];

const MASK_SEED: u32 = 0x0000_655F;
const MASK_MULTIPLIER: u32 = 0x0000_4115;

/// Raw on-disk header layout.
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawUtfHeader {
    magic: U32,
    table_size: U32,
    _unknown: u8,
    encoding: u8,
    rows_offset: U16,
    string_pool_offset: I32,
    data_pool_offset: I32,
    table_name_offset: U32,
    column_count: U16,
    row_stride: U16,
    row_count: I32,
}

/// How strings in a table's string pool are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    /// CP932.
    ShiftJis,
    Utf8,
}

impl StringEncoding {
    /// Header flag 0 selects Shift-JIS; anything else is UTF-8.
    pub fn from_flag(flag: u8) -> Self {
        if flag == 0 {
            StringEncoding::ShiftJis
        } else {
            StringEncoding::Utf8
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            StringEncoding::ShiftJis => 0,
            StringEncoding::Utf8 => 1,
        }
    }

    /// Decode raw pool bytes. Invalid sequences become U+FFFD.
    pub fn decode(self, bytes: &[u8]) -> Cow<'_, str> {
        match self {
            StringEncoding::Utf8 => String::from_utf8_lossy(bytes),
            StringEncoding::ShiftJis => encoding_rs::SHIFT_JIS.decode_without_bom_handling(bytes).0,
        }
    }
}

/// Parsed header of one `@UTF` table.
///
/// Offsets are absolute within the table buffer (base offset already added).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtfTableMetadata {
    /// Size of the table after the first 8 bytes.
    pub table_size: u32,
    pub encoding: StringEncoding,
    pub rows_offset: usize,
    pub string_pool_offset: usize,
    pub data_pool_offset: usize,
    /// Offset of the table name inside the string pool.
    pub table_name_offset: u32,
    pub column_count: u16,
    pub row_stride: u16,
    pub row_count: u32,
}

impl UtfTableMetadata {
    /// Absolute offset of the first byte of `row`.
    #[inline]
    pub fn row_start(&self, row: usize) -> usize {
        self.rows_offset + row * self.row_stride as usize
    }

    /// Absolute end of the row region.
    pub fn rows_end(&self) -> Option<usize> {
        (self.row_count as usize)
            .checked_mul(self.row_stride as usize)
            .and_then(|len| len.checked_add(self.rows_offset))
    }
}

/// Parse the header of a `@UTF` table.
///
/// Only the header is decoded; rows and columns are left to the caller.
pub fn parse_table(data: &[u8]) -> Result<UtfTableMetadata> {
    if data.len() < 4 {
        return Err(Error::Truncated {
            what: "UTF magic",
            needed: 4,
            available: data.len() as u64,
        });
    }

    let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if magic != UTF_MAGIC {
        return Err(Error::BadMagic {
            expected: "@UTF",
            actual: data[..4].to_vec(),
        });
    }

    if data.len() < HEADER_SIZE {
        return Err(Error::Truncated {
            what: "UTF header",
            needed: HEADER_SIZE as u64,
            available: data.len() as u64,
        });
    }

    let raw: RawUtfHeader = BinaryReader::new(data).read_struct()?;

    let string_pool = non_negative(raw.string_pool_offset.get(), "string pool offset")?;
    let data_pool = non_negative(raw.data_pool_offset.get(), "data pool offset")?;
    let row_count = non_negative(raw.row_count.get(), "row count")?;

    Ok(UtfTableMetadata {
        table_size: raw.table_size.get(),
        encoding: StringEncoding::from_flag(raw.encoding),
        rows_offset: raw.rows_offset.get() as usize + BASE_OFFSET,
        string_pool_offset: string_pool as usize + BASE_OFFSET,
        data_pool_offset: data_pool as usize + BASE_OFFSET,
        table_name_offset: raw.table_name_offset.get(),
        column_count: raw.column_count.get(),
        row_stride: raw.row_stride.get(),
        row_count,
    })
}

fn non_negative(value: i32, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::InvalidTable(format!("negative {field}: {value}")))
}

/// Whether a table buffer starts with the masked `@UTF` magic.
#[inline]
pub fn is_masked(data: &[u8]) -> bool {
    data.starts_with(&MASKED_MAGIC)
}

/// Apply (or remove) the table mask in place.
///
/// The mask is a plain XOR stream, so masking twice restores the input.
pub fn mask_in_place(data: &mut [u8]) {
    let mut m = MASK_SEED;
    for byte in data.iter_mut() {
        *byte ^= m as u8;
        m = m.wrapping_mul(MASK_MULTIPLIER);
    }
}
