//! CPK directory tables.
//!
//! A CPK starts with a `CPK ` packet whose `@UTF` table (one row) locates the
//! other directory packets. File entries come from the `TOC ` packet when
//! present, otherwise from the ID-only `ITOC` packet.
//!
//! Every packet is a 16-byte little-endian header (magic, flags, u64 table
//! length) followed by the table. Encrypted archives run the whole range,
//! headers included, through the cipher at its absolute offset.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::Decryptor;
use crate::entry::CpkEntry;
use crate::source::ArchiveSource;
use crate::utf::{self, UtfTable};
use crate::{Error, Result};

/// Size of a packet header.
pub const PACKET_HEADER_LEN: usize = 0x10;

/// Packet tables larger than this are treated as corrupt.
const MAX_TABLE_LEN: u64 = 256 * 1024 * 1024;

/// Upper bound of the base added to TOC file offsets.
const TOC_BASE_LIMIT: u64 = 0x800;

const DEFAULT_ALIGN: u64 = 0x800;

/// Values from the `CPK ` header table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpkHeader {
    pub content_offset: Option<u64>,
    pub content_size: Option<u64>,
    pub toc_offset: Option<u64>,
    pub toc_size: Option<u64>,
    pub itoc_offset: Option<u64>,
    pub itoc_size: Option<u64>,
    pub etoc_offset: Option<u64>,
    pub gtoc_offset: Option<u64>,
    /// File count announced by the header.
    pub files: Option<u64>,
    pub align: u64,
    /// Whether the table packets were stored with the `@UTF` mask.
    pub masked: bool,
}

impl CpkHeader {
    /// Base added to `FileOffset` values in the TOC.
    pub fn toc_base(&self) -> u64 {
        let toc = self.toc_offset.map(|t| t.min(TOC_BASE_LIMIT));
        match (self.content_offset, toc) {
            (Some(content), Some(toc)) => content.min(toc),
            (Some(content), None) => content,
            (None, Some(toc)) => toc,
            (None, None) => 0,
        }
    }
}

/// Read and parse a packet table at `offset`.
///
/// Returns the plain table bytes (decrypted and unmasked) and whether the
/// table was masked.
fn read_packet(
    source: &dyn ArchiveSource,
    offset: u64,
    magic: &'static str,
    decryptor: Option<&dyn Decryptor>,
) -> Result<(Vec<u8>, bool)> {
    let mut head = [0u8; PACKET_HEADER_LEN];
    source.read_into(offset, &mut head).map_err(|e| match e {
        Error::Truncated { needed, available, .. } => Error::Truncated {
            what: "packet header",
            needed,
            available,
        },
        other => other,
    })?;
    if let Some(decryptor) = decryptor {
        decryptor.decrypt(offset, &mut head);
    }

    if &head[..4] != magic.as_bytes() {
        return Err(Error::BadMagic {
            expected: magic,
            actual: head[..4].to_vec(),
        });
    }

    let table_len = LittleEndian::read_u64(&head[8..16]);
    let table_offset = offset + PACKET_HEADER_LEN as u64;
    if table_len > MAX_TABLE_LEN || table_offset.saturating_add(table_len) > source.len() {
        return Err(Error::Truncated {
            what: "packet table",
            needed: table_offset.saturating_add(table_len),
            available: source.len(),
        });
    }

    let mut table = vec![0u8; table_len as usize];
    source.read_into(table_offset, &mut table)?;
    if let Some(decryptor) = decryptor {
        decryptor.decrypt(table_offset, &mut table);
    }

    let masked = utf::is_masked(&table);
    if masked {
        utf::mask_in_place(&mut table);
    }

    tracing::debug!(magic, offset, table_len, masked, "read packet");
    Ok((table, masked))
}

/// Parse the header table row.
pub fn parse_header(table: &UtfTable<'_>) -> Result<CpkHeader> {
    if table.row_count() == 0 {
        return Err(Error::CorruptDirectory("CPK header table has no rows".into()));
    }

    // Zero offsets mean "absent" in real headers.
    let offset = |name: &str| -> Result<Option<u64>> {
        Ok(table.get_u64(0, name)?.filter(|&v| v != 0))
    };

    Ok(CpkHeader {
        content_offset: offset("ContentOffset")?,
        content_size: table.get_u64(0, "ContentSize")?,
        toc_offset: offset("TocOffset")?,
        toc_size: table.get_u64(0, "TocSize")?,
        itoc_offset: offset("ItocOffset")?,
        itoc_size: table.get_u64(0, "ItocSize")?,
        etoc_offset: offset("EtocOffset")?,
        gtoc_offset: offset("GtocOffset")?,
        files: table.get_u64(0, "Files")?,
        align: table
            .get_u64(0, "Align")?
            .filter(|&a| a != 0)
            .unwrap_or(DEFAULT_ALIGN),
        masked: false,
    })
}

/// Build entries from a `TOC ` table.
pub fn parse_toc(table: &UtfTable<'_>, base: u64) -> Result<Vec<CpkEntry>> {
    if !table.has_column("FileName") {
        return Err(Error::CorruptDirectory("TOC has no FileName column".into()));
    }

    let mut entries = Vec::with_capacity(table.row_count());

    for row in 0..table.row_count() {
        let file_name = table
            .get_string(row, "FileName")?
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::CorruptDirectory(format!("TOC row {row} has no file name")))?;
        let directory = table.get_string(row, "DirName")?.unwrap_or_default();

        let file_size = table
            .get_u64(row, "FileSize")?
            .ok_or_else(|| Error::CorruptDirectory(format!("TOC row {row} has no file size")))?;
        let extract_size = table.get_u64(row, "ExtractSize")?.unwrap_or(file_size);
        let relative = table
            .get_u64(row, "FileOffset")?
            .ok_or_else(|| Error::CorruptDirectory(format!("TOC row {row} has no file offset")))?;
        let file_offset = relative.checked_add(base).ok_or_else(|| {
            Error::CorruptDirectory(format!("TOC row {row} offset {relative:#x} overflows"))
        })?;

        let raw_id = table.get_u64(row, "ID")?.unwrap_or(row as u64);
        let id = u32::try_from(raw_id).map_err(|_| {
            Error::CorruptDirectory(format!("TOC row {row} id {raw_id:#x} does not fit 32 bits"))
        })?;
        let user_string = table
            .get_string(row, "UserString")?
            .filter(|s| !s.is_empty() && s != "<NULL>");

        entries.push(CpkEntry {
            directory,
            file_name,
            file_offset,
            file_size,
            extract_size,
            id,
            user_string,
        });
    }

    Ok(entries)
}

/// Build entries from an `ITOC` table.
///
/// ITOC only records sizes by ID; payloads are laid out back to back from
/// the content offset, each start aligned to `align`.
pub fn parse_itoc(table: &UtfTable<'_>, content_offset: u64, align: u64) -> Result<Vec<CpkEntry>> {
    if table.row_count() == 0 {
        return Err(Error::CorruptDirectory("ITOC table has no rows".into()));
    }

    let mut sizes: BTreeMap<u32, (u64, Option<u64>)> = BTreeMap::new();

    for column in ["DataL", "DataH"] {
        let Some(bytes) = table.get_data(0, column)? else {
            continue;
        };
        if bytes.is_empty() {
            continue;
        }

        let nested = UtfTable::parse(bytes)?;
        for row in 0..nested.row_count() {
            let Some(id) = nested.get_u64(row, "ID")? else {
                continue;
            };
            let Some(file_size) = nested.get_u64(row, "FileSize")? else {
                continue;
            };
            let extract_size = nested.get_u64(row, "ExtractSize")?;
            let id = u32::try_from(id).map_err(|_| {
                Error::CorruptDirectory(format!("ITOC id {id:#x} does not fit 32 bits"))
            })?;
            sizes.insert(id, (file_size, extract_size));
        }
    }

    let align = align.max(1);
    let mut offset = content_offset;
    let mut entries = Vec::with_capacity(sizes.len());

    for (id, (file_size, extract_size)) in sizes {
        entries.push(
            CpkEntry::new(
                "",
                format!("{id:05}"),
                offset,
                file_size,
                extract_size.unwrap_or(file_size),
            )
            .with_id(id),
        );
        offset = offset
            .checked_add(file_size.div_ceil(align) * align)
            .ok_or_else(|| Error::CorruptDirectory(format!("ITOC id {id} overflows")))?;
    }

    Ok(entries)
}

/// Read the `CPK ` header packet at the start of the archive.
pub fn read_header(
    source: &dyn ArchiveSource,
    decryptor: Option<&dyn Decryptor>,
) -> Result<CpkHeader> {
    let (table, masked) = read_packet(source, 0, "CPK ", decryptor)?;
    let header_table = UtfTable::parse(&table).map_err(|e| match e {
        e @ Error::BadMagic { .. } => e,
        other => corrupt("CPK header", other),
    })?;
    let mut header = parse_header(&header_table)?;
    header.masked = masked;

    tracing::debug!(?header, "parsed CPK header");
    Ok(header)
}

/// Read the file entries the header points at.
pub fn read_entries(
    source: &dyn ArchiveSource,
    header: &CpkHeader,
    decryptor: Option<&dyn Decryptor>,
) -> Result<Vec<CpkEntry>> {
    let entries = if let Some(toc_offset) = header.toc_offset {
        let (toc, _) =
            read_packet(source, toc_offset, "TOC ", decryptor).map_err(|e| corrupt("TOC", e))?;
        let toc = UtfTable::parse(&toc).map_err(|e| corrupt("TOC", e))?;
        parse_toc(&toc, header.toc_base()).map_err(|e| corrupt("TOC", e))?
    } else if let Some(itoc_offset) = header.itoc_offset {
        let (itoc, _) =
            read_packet(source, itoc_offset, "ITOC", decryptor).map_err(|e| corrupt("ITOC", e))?;
        let itoc = UtfTable::parse(&itoc).map_err(|e| corrupt("ITOC", e))?;
        let content = header.content_offset.unwrap_or(0);
        parse_itoc(&itoc, content, header.align).map_err(|e| corrupt("ITOC", e))?
    } else {
        return Err(Error::CorruptDirectory(
            "header has neither a TOC nor an ITOC offset".into(),
        ));
    };

    if let Some(files) = header.files {
        if files != entries.len() as u64 {
            tracing::warn!(
                announced = files,
                listed = entries.len(),
                "file count mismatch between header and directory"
            );
        }
    }

    Ok(entries)
}

/// Wrap a table-level failure as a directory failure. I/O errors pass through.
fn corrupt(what: &str, error: Error) -> Error {
    match error {
        e @ (Error::Io { .. } | Error::CorruptDirectory(_)) => e,
        other => Error::CorruptDirectory(format!("{what}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utf::{ColumnType, UtfCell, UtfTableBuilder};

    fn toc_table(rows: &[(&str, &str, u64, u64, u64)]) -> Vec<u8> {
        let mut builder = UtfTableBuilder::new("CpkTocInfo");
        builder
            .column("DirName", ColumnType::String)
            .column("FileName", ColumnType::String)
            .column("FileSize", ColumnType::U32)
            .column("ExtractSize", ColumnType::U32)
            .column("FileOffset", ColumnType::U64)
            .column("ID", ColumnType::U32)
            .zero("UserString", ColumnType::String);
        for (i, (dir, name, offset, size, extract)) in rows.iter().enumerate() {
            builder.row(vec![
                UtfCell::String(dir.to_string()),
                UtfCell::String(name.to_string()),
                UtfCell::U32(*size as u32),
                UtfCell::U32(*extract as u32),
                UtfCell::U64(*offset),
                UtfCell::U32(i as u32),
            ]);
        }
        builder.build()
    }

    #[test]
    fn test_toc_base() {
        let header = CpkHeader {
            content_offset: Some(0x4000),
            toc_offset: Some(0x10000),
            ..Default::default()
        };
        assert_eq!(header.toc_base(), 0x800);

        let header = CpkHeader {
            content_offset: Some(0x200),
            toc_offset: Some(0x800),
            ..Default::default()
        };
        assert_eq!(header.toc_base(), 0x200);

        let header = CpkHeader {
            content_offset: None,
            toc_offset: Some(0x400),
            ..Default::default()
        };
        assert_eq!(header.toc_base(), 0x400);
    }

    #[test]
    fn test_parse_toc_rows() {
        let data = toc_table(&[("", "root.bin", 0, 10, 10), ("se/voice", "a.acb", 0x10, 20, 64)]);
        let table = UtfTable::parse(&data).unwrap();
        let entries = parse_toc(&table, 0x800).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].relative_path(), "root.bin");
        assert_eq!(entries[0].file_offset, 0x800);
        assert_eq!(entries[1].directory, "se/voice");
        assert_eq!(entries[1].file_offset, 0x810);
        assert_eq!(entries[1].file_size, 20);
        assert_eq!(entries[1].extract_size, 64);
        assert_eq!(entries[1].id, 1);
        assert_eq!(entries[1].user_string, None);
    }

    #[test]
    fn test_toc_without_names() {
        let mut builder = UtfTableBuilder::new("CpkTocInfo");
        builder.column("FileSize", ColumnType::U32);
        builder.row(vec![UtfCell::U32(1)]);
        let data = builder.build();
        let table = UtfTable::parse(&data).unwrap();

        assert!(matches!(parse_toc(&table, 0), Err(Error::CorruptDirectory(_))));
    }

    #[test]
    fn test_wide_id_rejected() {
        let mut builder = UtfTableBuilder::new("CpkTocInfo");
        builder
            .column("FileName", ColumnType::String)
            .column("FileSize", ColumnType::U32)
            .column("FileOffset", ColumnType::U64)
            .column("ID", ColumnType::U64);
        builder.row(vec![
            UtfCell::String("a.bin".into()),
            UtfCell::U32(1),
            UtfCell::U64(0),
            UtfCell::U64(0x1_0000_0001),
        ]);
        let data = builder.build();
        let table = UtfTable::parse(&data).unwrap();

        assert!(matches!(parse_toc(&table, 0), Err(Error::CorruptDirectory(_))));
    }

    #[test]
    fn test_parse_itoc_layout() {
        let mut low = UtfTableBuilder::new("CpkItocL");
        low.column("ID", ColumnType::U16)
            .column("FileSize", ColumnType::U16)
            .column("ExtractSize", ColumnType::U16);
        low.row(vec![UtfCell::U16(2), UtfCell::U16(100), UtfCell::U16(100)]);
        low.row(vec![UtfCell::U16(0), UtfCell::U16(0x900), UtfCell::U16(0x1000)]);

        let mut high = UtfTableBuilder::new("CpkItocH");
        high.column("ID", ColumnType::U16)
            .column("FileSize", ColumnType::U32)
            .column("ExtractSize", ColumnType::U32);
        high.row(vec![UtfCell::U16(1), UtfCell::U32(0x20000), UtfCell::U32(0x20000)]);

        let mut itoc = UtfTableBuilder::new("CpkItocInfo");
        itoc.column("FilesL", ColumnType::U32)
            .column("FilesH", ColumnType::U32)
            .column("DataL", ColumnType::Data)
            .column("DataH", ColumnType::Data);
        itoc.row(vec![
            UtfCell::U32(2),
            UtfCell::U32(1),
            UtfCell::Data(low.build()),
            UtfCell::Data(high.build()),
        ]);
        let data = itoc.build();
        let table = UtfTable::parse(&data).unwrap();

        let entries = parse_itoc(&table, 0x4000, 0x800).unwrap();
        let layout: Vec<_> = entries
            .iter()
            .map(|e| (e.file_name.as_str(), e.file_offset, e.file_size, e.extract_size))
            .collect();

        assert_eq!(
            layout,
            vec![
                ("00000", 0x4000, 0x900, 0x1000),
                ("00001", 0x5000, 0x20000, 0x20000),
                ("00002", 0x25000, 100, 100),
            ]
        );
    }
}
