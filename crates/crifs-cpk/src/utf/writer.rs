//! `@UTF` table writer.
//!
//! Produces tables the reader accepts: header, schema, rows, a string pool
//! that starts with `<NULL>`, then the data pool. Used to rebuild directory
//! tables and to fabricate archives in tests.

use byteorder::{BigEndian, WriteBytesExt};
use hashbrown::HashMap;

use super::header::{StringEncoding, BASE_OFFSET, HEADER_SIZE};
use super::table::{ColumnStorage, ColumnType};

/// Owned cell value for [`UtfTableBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub enum UtfCell {
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
    String(String),
    Data(Vec<u8>),
}

impl UtfCell {
    pub fn column_type(&self) -> ColumnType {
        match self {
            UtfCell::U8(_) => ColumnType::U8,
            UtfCell::I8(_) => ColumnType::I8,
            UtfCell::U16(_) => ColumnType::U16,
            UtfCell::I16(_) => ColumnType::I16,
            UtfCell::U32(_) => ColumnType::U32,
            UtfCell::I32(_) => ColumnType::I32,
            UtfCell::U64(_) => ColumnType::U64,
            UtfCell::I64(_) => ColumnType::I64,
            UtfCell::F32(_) => ColumnType::F32,
            UtfCell::F64(_) => ColumnType::F64,
            UtfCell::String(_) => ColumnType::String,
            UtfCell::Data(_) => ColumnType::Data,
        }
    }
}

#[derive(Debug, Clone)]
struct ColumnSpec {
    name: String,
    column_type: ColumnType,
    storage: ColumnStorage,
    constant: Option<UtfCell>,
}

/// Builder for `@UTF` tables.
///
/// Rows supply one cell per per-row column, in declaration order. A cell
/// whose variant does not match its column's type is coerced to the
/// column's zero value.
#[derive(Debug, Clone)]
pub struct UtfTableBuilder {
    name: String,
    encoding: StringEncoding,
    columns: Vec<ColumnSpec>,
    rows: Vec<Vec<UtfCell>>,
}

impl UtfTableBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            encoding: StringEncoding::Utf8,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn encoding(&mut self, encoding: StringEncoding) -> &mut Self {
        self.encoding = encoding;
        self
    }

    /// Declare a per-row column.
    pub fn column(&mut self, name: impl Into<String>, column_type: ColumnType) -> &mut Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            column_type,
            storage: ColumnStorage::PerRow,
            constant: None,
        });
        self
    }

    /// Declare a column whose single value is shared by every row.
    pub fn constant(&mut self, name: impl Into<String>, value: UtfCell) -> &mut Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            column_type: value.column_type(),
            storage: ColumnStorage::Constant,
            constant: Some(value),
        });
        self
    }

    /// Declare a column with no stored value.
    pub fn zero(&mut self, name: impl Into<String>, column_type: ColumnType) -> &mut Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            column_type,
            storage: ColumnStorage::Zero,
            constant: None,
        });
        self
    }

    pub fn row(&mut self, cells: Vec<UtfCell>) -> &mut Self {
        self.rows.push(cells);
        self
    }

    /// Serialize the table.
    pub fn build(&self) -> Vec<u8> {
        let mut strings = StringPool::new(self.encoding);
        let mut data_pool = Vec::new();

        let name_offset = strings.intern(&self.name);

        // Schema
        let mut schema = Vec::new();
        for column in &self.columns {
            let flags = column.storage.flag() | column.column_type as u8;
            schema.push(flags);
            let offset = strings.intern(&column.name);
            push_u32(&mut schema, offset);
            if let Some(value) = &column.constant {
                encode_cell(&mut schema, column.column_type, value, &mut strings, &mut data_pool);
            }
        }

        // Rows
        let per_row: Vec<&ColumnSpec> = self
            .columns
            .iter()
            .filter(|c| c.storage == ColumnStorage::PerRow)
            .collect();
        let stride: usize = per_row.iter().map(|c| c.column_type.size()).sum();

        let mut rows = Vec::with_capacity(stride * self.rows.len());
        for cells in &self.rows {
            for (index, column) in per_row.iter().enumerate() {
                match cells.get(index) {
                    Some(cell) => {
                        encode_cell(&mut rows, column.column_type, cell, &mut strings, &mut data_pool)
                    }
                    None => rows.resize(rows.len() + column.column_type.size(), 0),
                }
            }
        }

        let rows_offset = HEADER_SIZE + schema.len();
        let string_pool_offset = rows_offset + rows.len();
        let mut data_pool_offset = string_pool_offset + strings.bytes.len();
        // Data pool is 8-aligned when present.
        if !data_pool.is_empty() {
            data_pool_offset = (data_pool_offset + 7) & !7;
        }
        let total = data_pool_offset + data_pool.len();

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(b"@UTF");
        push_u32(&mut out, (total - BASE_OFFSET) as u32);
        out.push(0);
        out.push(self.encoding.flag());
        push_u16(&mut out, (rows_offset - BASE_OFFSET) as u16);
        push_u32(&mut out, (string_pool_offset - BASE_OFFSET) as u32);
        push_u32(&mut out, (data_pool_offset - BASE_OFFSET) as u32);
        push_u32(&mut out, name_offset);
        push_u16(&mut out, self.columns.len() as u16);
        push_u16(&mut out, stride as u16);
        push_u32(&mut out, self.rows.len() as u32);

        out.extend_from_slice(&schema);
        out.extend_from_slice(&rows);
        out.extend_from_slice(&strings.bytes);
        out.resize(data_pool_offset, 0);
        out.extend_from_slice(&data_pool);
        out
    }
}

struct StringPool {
    encoding: StringEncoding,
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringPool {
    fn new(encoding: StringEncoding) -> Self {
        let mut pool = Self {
            encoding,
            bytes: Vec::new(),
            offsets: HashMap::new(),
        };
        pool.intern("<NULL>");
        pool
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&offset) = self.offsets.get(s) {
            return offset;
        }
        let offset = self.bytes.len() as u32;
        match self.encoding {
            StringEncoding::Utf8 => self.bytes.extend_from_slice(s.as_bytes()),
            StringEncoding::ShiftJis => {
                let (encoded, _, _) = encoding_rs::SHIFT_JIS.encode(s);
                self.bytes.extend_from_slice(&encoded);
            }
        }
        self.bytes.push(0);
        self.offsets.insert(s.to_owned(), offset);
        offset
    }
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    // Writing into a Vec cannot fail.
    let _ = out.write_u16::<BigEndian>(value);
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    let _ = out.write_u32::<BigEndian>(value);
}

fn encode_cell(
    out: &mut Vec<u8>,
    column_type: ColumnType,
    cell: &UtfCell,
    strings: &mut StringPool,
    data_pool: &mut Vec<u8>,
) {
    if cell.column_type() != column_type {
        out.resize(out.len() + column_type.size(), 0);
        return;
    }
    let _ = match cell {
        UtfCell::U8(v) => out.write_u8(*v),
        UtfCell::I8(v) => out.write_i8(*v),
        UtfCell::U16(v) => out.write_u16::<BigEndian>(*v),
        UtfCell::I16(v) => out.write_i16::<BigEndian>(*v),
        UtfCell::U32(v) => out.write_u32::<BigEndian>(*v),
        UtfCell::I32(v) => out.write_i32::<BigEndian>(*v),
        UtfCell::U64(v) => out.write_u64::<BigEndian>(*v),
        UtfCell::I64(v) => out.write_i64::<BigEndian>(*v),
        UtfCell::F32(v) => out.write_f32::<BigEndian>(*v),
        UtfCell::F64(v) => out.write_f64::<BigEndian>(*v),
        UtfCell::String(s) => {
            let offset = strings.intern(s);
            out.write_u32::<BigEndian>(offset)
        }
        UtfCell::Data(bytes) => {
            let offset = if bytes.is_empty() { 0 } else { data_pool.len() as u32 };
            data_pool.extend_from_slice(bytes);
            out.write_u32::<BigEndian>(offset)
                .and_then(|_| out.write_u32::<BigEndian>(bytes.len() as u32))
        }
    };
}
