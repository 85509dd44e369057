//! CRI `@UTF` tables.
//!
//! Every CPK directory (header, TOC, ITOC, ETOC, GTOC) is stored as one of
//! these column-oriented tables. [`parse_table`] reads only the fixed header;
//! [`UtfTable`] adds schema and row access on top of it.

mod header;
mod table;
mod writer;

pub use header::{
    is_masked, mask_in_place, parse_table, StringEncoding, UtfTableMetadata, BASE_OFFSET,
    HEADER_SIZE, MASKED_MAGIC, UTF_MAGIC,
};
pub use table::{ColumnStorage, ColumnType, UtfColumn, UtfTable, UtfValue};
pub use writer::{UtfCell, UtfTableBuilder};
