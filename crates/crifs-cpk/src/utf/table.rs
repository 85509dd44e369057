//! Column schema and row value decoding for `@UTF` tables.

use std::borrow::Cow;

use crifs_common::BinaryReader;

use super::header::{parse_table, StringEncoding, UtfTableMetadata, HEADER_SIZE};
use crate::{Error, Result};

const STORAGE_MASK: u8 = 0xF0;
const TYPE_MASK: u8 = 0x0F;

/// Column value type (low nibble of the column flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    U8 = 0x0,
    I8 = 0x1,
    U16 = 0x2,
    I16 = 0x3,
    U32 = 0x4,
    I32 = 0x5,
    U64 = 0x6,
    I64 = 0x7,
    F32 = 0x8,
    F64 = 0x9,
    /// Offset into the string pool.
    String = 0xA,
    /// Offset and size into the data pool.
    Data = 0xB,
}

impl ColumnType {
    pub fn from_nibble(value: u8) -> Option<Self> {
        Some(match value {
            0x0 => ColumnType::U8,
            0x1 => ColumnType::I8,
            0x2 => ColumnType::U16,
            0x3 => ColumnType::I16,
            0x4 => ColumnType::U32,
            0x5 => ColumnType::I32,
            0x6 => ColumnType::U64,
            0x7 => ColumnType::I64,
            0x8 => ColumnType::F32,
            0x9 => ColumnType::F64,
            0xA => ColumnType::String,
            0xB => ColumnType::Data,
            _ => return None,
        })
    }

    /// Encoded size of one value in a row or constant slot.
    pub const fn size(self) -> usize {
        match self {
            ColumnType::U8 | ColumnType::I8 => 1,
            ColumnType::U16 | ColumnType::I16 => 2,
            ColumnType::U32 | ColumnType::I32 | ColumnType::F32 | ColumnType::String => 4,
            ColumnType::U64 | ColumnType::I64 | ColumnType::F64 | ColumnType::Data => 8,
        }
    }
}

/// Where a column's value lives (high nibble of the column flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnStorage {
    /// No value; reads yield nothing.
    Zero,
    /// One value stored in the schema, shared by every row.
    Constant,
    /// One value per row.
    PerRow,
}

impl ColumnStorage {
    pub fn from_flags(flags: u8) -> Option<Self> {
        match flags & STORAGE_MASK {
            0x10 => Some(ColumnStorage::Zero),
            0x30 | 0x70 => Some(ColumnStorage::Constant),
            0x50 => Some(ColumnStorage::PerRow),
            _ => None,
        }
    }

    pub const fn flag(self) -> u8 {
        match self {
            ColumnStorage::Zero => 0x10,
            ColumnStorage::Constant => 0x30,
            ColumnStorage::PerRow => 0x50,
        }
    }
}

/// A decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum UtfValue<'a> {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    String(Cow<'a, str>),
    Data(&'a [u8]),
}

impl<'a> UtfValue<'a> {
    /// Widen any non-negative integer cell to `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            UtfValue::U8(v) => Some(v as u64),
            UtfValue::U16(v) => Some(v as u64),
            UtfValue::U32(v) => Some(v as u64),
            UtfValue::U64(v) => Some(v),
            UtfValue::I8(v) => u64::try_from(v).ok(),
            UtfValue::I16(v) => u64::try_from(v).ok(),
            UtfValue::I32(v) => u64::try_from(v).ok(),
            UtfValue::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            UtfValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&'a [u8]> {
        match *self {
            UtfValue::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            UtfValue::String(s) => Some(s.into_owned()),
            _ => None,
        }
    }
}

/// One entry of a table's column schema.
#[derive(Debug, Clone)]
pub struct UtfColumn<'a> {
    pub name: Cow<'a, str>,
    pub column_type: ColumnType,
    pub storage: ColumnStorage,
    constant: Option<UtfValue<'a>>,
    /// Byte offset inside a row, for per-row columns.
    row_offset: usize,
}

/// A fully parsed `@UTF` table borrowing from its buffer.
#[derive(Debug, Clone)]
pub struct UtfTable<'a> {
    data: &'a [u8],
    meta: UtfTableMetadata,
    name: Cow<'a, str>,
    columns: Vec<UtfColumn<'a>>,
}

impl<'a> UtfTable<'a> {
    /// Parse the header, schema, and table name.
    ///
    /// Row values are decoded lazily through [`UtfTable::value`].
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let meta = parse_table(data)?;

        if meta.string_pool_offset > data.len() || meta.data_pool_offset > data.len() {
            return Err(Error::Truncated {
                what: "UTF pools",
                needed: meta.string_pool_offset.max(meta.data_pool_offset) as u64,
                available: data.len() as u64,
            });
        }

        let rows_end = meta
            .rows_end()
            .ok_or_else(|| Error::InvalidTable("row region overflows".into()))?;
        if rows_end > data.len() {
            return Err(Error::Truncated {
                what: "UTF rows",
                needed: rows_end as u64,
                available: data.len() as u64,
            });
        }

        let mut reader = BinaryReader::new_at(data, HEADER_SIZE);
        let mut columns = Vec::with_capacity(meta.column_count as usize);
        let mut row_offset = 0usize;

        for index in 0..meta.column_count {
            let flags = reader.read_u8()?;
            let storage = ColumnStorage::from_flags(flags).ok_or_else(|| {
                Error::InvalidTable(format!("column {index}: unknown storage flags {flags:#04x}"))
            })?;
            let column_type = ColumnType::from_nibble(flags & TYPE_MASK).ok_or_else(|| {
                Error::InvalidTable(format!("column {index}: unknown type flags {flags:#04x}"))
            })?;

            let name_offset = reader.read_u32_be()?;
            let name = read_string(data, &meta, name_offset)?;

            let mut column = UtfColumn {
                name,
                column_type,
                storage,
                constant: None,
                row_offset,
            };

            match storage {
                ColumnStorage::Zero => {}
                ColumnStorage::Constant => {
                    column.constant = Some(read_value(data, &meta, column_type, reader.position())?);
                    reader.advance(column_type.size());
                }
                ColumnStorage::PerRow => row_offset += column_type.size(),
            }

            columns.push(column);
        }

        if reader.position() > meta.rows_offset {
            return Err(Error::InvalidTable(format!(
                "column schema ends at {:#x}, past row data at {:#x}",
                reader.position(),
                meta.rows_offset
            )));
        }
        if row_offset > meta.row_stride as usize {
            return Err(Error::InvalidTable(format!(
                "per-row columns need {row_offset} bytes but stride is {}",
                meta.row_stride
            )));
        }

        let name = read_string(data, &meta, meta.table_name_offset)?;

        Ok(Self {
            data,
            meta,
            name,
            columns,
        })
    }

    pub fn metadata(&self) -> &UtfTableMetadata {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[UtfColumn<'a>] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.meta.row_count as usize
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Decode one cell. Zero-storage columns yield `None`.
    pub fn value(&self, row: usize, column: usize) -> Result<Option<UtfValue<'a>>> {
        if row >= self.row_count() {
            return Err(Error::InvalidTable(format!(
                "row {row} out of range ({} rows)",
                self.row_count()
            )));
        }
        let col = self
            .columns
            .get(column)
            .ok_or_else(|| Error::InvalidTable(format!("column {column} out of range")))?;

        match col.storage {
            ColumnStorage::Zero => Ok(None),
            ColumnStorage::Constant => Ok(col.constant.clone()),
            ColumnStorage::PerRow => {
                let pos = self.meta.row_start(row) + col.row_offset;
                read_value(self.data, &self.meta, col.column_type, pos).map(Some)
            }
        }
    }

    /// Decode a cell by column name. Missing columns yield `None`.
    pub fn get(&self, row: usize, name: &str) -> Result<Option<UtfValue<'a>>> {
        match self.column_index(name) {
            Some(column) => self.value(row, column),
            None => Ok(None),
        }
    }

    pub fn get_u64(&self, row: usize, name: &str) -> Result<Option<u64>> {
        Ok(self.get(row, name)?.and_then(|v| v.as_u64()))
    }

    pub fn get_string(&self, row: usize, name: &str) -> Result<Option<String>> {
        Ok(self.get(row, name)?.and_then(UtfValue::into_string))
    }

    pub fn get_data(&self, row: usize, name: &str) -> Result<Option<&'a [u8]>> {
        Ok(self.get(row, name)?.and_then(|v| v.as_data()))
    }
}

fn read_string<'a>(data: &'a [u8], meta: &UtfTableMetadata, offset: u32) -> Result<Cow<'a, str>> {
    let start = meta.string_pool_offset + offset as usize;
    if start >= data.len() {
        return Err(Error::Truncated {
            what: "UTF string",
            needed: start as u64 + 1,
            available: data.len() as u64,
        });
    }
    let bytes = BinaryReader::new_at(data, start).read_cstring_bytes()?;
    Ok(meta.encoding.decode(bytes))
}

fn read_value<'a>(
    data: &'a [u8],
    meta: &UtfTableMetadata,
    column_type: ColumnType,
    pos: usize,
) -> Result<UtfValue<'a>> {
    let mut r = BinaryReader::new_at(data, pos);
    Ok(match column_type {
        ColumnType::U8 => UtfValue::U8(r.read_u8()?),
        ColumnType::I8 => UtfValue::I8(r.read_i8()?),
        ColumnType::U16 => UtfValue::U16(r.read_u16_be()?),
        ColumnType::I16 => UtfValue::I16(r.read_i16_be()?),
        ColumnType::U32 => UtfValue::U32(r.read_u32_be()?),
        ColumnType::I32 => UtfValue::I32(r.read_i32_be()?),
        ColumnType::U64 => UtfValue::U64(r.read_u64_be()?),
        ColumnType::I64 => UtfValue::I64(r.read_i64_be()?),
        ColumnType::F32 => UtfValue::F32(r.read_f32_be()?),
        ColumnType::F64 => UtfValue::F64(r.read_f64_be()?),
        ColumnType::String => UtfValue::String(read_string(data, meta, r.read_u32_be()?)?),
        ColumnType::Data => {
            let offset = r.read_u32_be()? as usize;
            let size = r.read_u32_be()? as usize;
            let start = meta.data_pool_offset + offset;
            let bytes = r.slice_at(start, size).map_err(|_| Error::Truncated {
                what: "UTF data cell",
                needed: (start + size) as u64,
                available: data.len() as u64,
            })?;
            UtfValue::Data(bytes)
        }
    })
}
