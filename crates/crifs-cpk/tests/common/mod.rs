//! Synthetic CPK archives for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use crifs_cpk::utf::{ColumnType, UtfCell, UtfTableBuilder};
use crifs_cpk::{crypto, decompress, key, CipherKey};

const TOC_OFFSET: u64 = 0x800;
const ALIGN: u64 = 0x800;

struct TestFile {
    dir: String,
    name: String,
    data: Vec<u8>,
    compress: bool,
    extract_size: Option<u64>,
}

/// Builds a TOC-based archive: `CPK ` packet at 0, `TOC ` packet at 0x800,
/// payloads from the next aligned offset.
#[derive(Default)]
pub struct CpkBuilder {
    files: Vec<TestFile>,
}

impl CpkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, dir: &str, name: &str, data: &[u8]) -> Self {
        self.files.push(TestFile {
            dir: dir.into(),
            name: name.into(),
            data: data.to_vec(),
            compress: false,
            extract_size: None,
        });
        self
    }

    /// Store `data` CRILAYLA-compressed. Needs at least 0x100 bytes.
    pub fn compressed(mut self, dir: &str, name: &str, data: &[u8]) -> Self {
        self.files.push(TestFile {
            dir: dir.into(),
            name: name.into(),
            data: data.to_vec(),
            compress: true,
            extract_size: None,
        });
        self
    }

    /// Like [`compressed`](Self::compressed), but record `extract_size` in
    /// the TOC instead of the real length.
    pub fn compressed_sized(mut self, dir: &str, name: &str, data: &[u8], extract_size: u64) -> Self {
        self.files.push(TestFile {
            dir: dir.into(),
            name: name.into(),
            data: data.to_vec(),
            compress: true,
            extract_size: Some(extract_size),
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let stored: Vec<Vec<u8>> = self
            .files
            .iter()
            .map(|f| {
                if f.compress {
                    decompress::compress(&f.data).unwrap()
                } else {
                    f.data.clone()
                }
            })
            .collect();

        // Numeric cells are fixed-size, so a dry run gives the final TOC length.
        let toc_len = self.toc_table(&stored, &vec![0; stored.len()]).len() as u64;
        let content_offset = align(TOC_OFFSET + 0x10 + toc_len);

        let mut offsets = Vec::with_capacity(stored.len());
        let mut cursor = content_offset;
        for data in &stored {
            offsets.push(cursor);
            cursor = align(cursor + data.len() as u64);
        }

        // TOC offsets are relative to min(content, toc).
        let relative: Vec<u64> = offsets.iter().map(|o| o - TOC_OFFSET).collect();
        let toc = self.toc_table(&stored, &relative);
        let content_size = cursor - content_offset;
        let header = header_table(content_offset, content_size, toc.len() as u64, stored.len());

        let mut out = packet(b"CPK ", &header);
        assert!(out.len() as u64 <= TOC_OFFSET);
        out.resize(TOC_OFFSET as usize, 0);
        out.extend_from_slice(&packet(b"TOC ", &toc));

        for (offset, data) in offsets.iter().zip(&stored) {
            out.resize(*offset as usize, 0);
            out.extend_from_slice(data);
        }
        out
    }

    /// Build and encrypt the whole image with `key`.
    pub fn build_encrypted(&self, key: CipherKey) -> Vec<u8> {
        let mut image = self.build();
        crypto::apply(&mut image, 0, &key.bytes());
        image
    }

    /// Write a plaintext archive to `dir/file_name`.
    pub fn write(&self, dir: &Path, file_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        fs::write(&path, self.build()).unwrap();
        path
    }

    /// Write an archive encrypted with the key derived from `file_name`.
    pub fn write_encrypted(&self, dir: &Path, file_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        fs::write(&path, self.build_encrypted(key::derive_key(file_name))).unwrap();
        path
    }

    fn toc_table(&self, stored: &[Vec<u8>], offsets: &[u64]) -> Vec<u8> {
        let mut builder = UtfTableBuilder::new("CpkTocInfo");
        builder
            .column("DirName", ColumnType::String)
            .column("FileName", ColumnType::String)
            .column("FileSize", ColumnType::U32)
            .column("ExtractSize", ColumnType::U32)
            .column("FileOffset", ColumnType::U64)
            .column("ID", ColumnType::U32)
            .zero("UserString", ColumnType::String);

        for (id, ((file, data), offset)) in self.files.iter().zip(stored).zip(offsets).enumerate() {
            builder.row(vec![
                UtfCell::String(file.dir.clone()),
                UtfCell::String(file.name.clone()),
                UtfCell::U32(data.len() as u32),
                UtfCell::U32(file.extract_size.unwrap_or(file.data.len() as u64) as u32),
                UtfCell::U64(*offset),
                UtfCell::U32(id as u32),
            ]);
        }
        builder.build()
    }
}

fn header_table(content_offset: u64, content_size: u64, toc_size: u64, files: usize) -> Vec<u8> {
    let mut builder = UtfTableBuilder::new("CpkHeader");
    builder
        .column("ContentOffset", ColumnType::U64)
        .column("ContentSize", ColumnType::U64)
        .column("TocOffset", ColumnType::U64)
        .column("TocSize", ColumnType::U64)
        .zero("ItocOffset", ColumnType::U64)
        .column("Files", ColumnType::U32)
        .column("Align", ColumnType::U16)
        .row(vec![
            UtfCell::U64(content_offset),
            UtfCell::U64(content_size),
            UtfCell::U64(TOC_OFFSET),
            UtfCell::U64(toc_size + 0x10),
            UtfCell::U32(files as u32),
            UtfCell::U16(ALIGN as u16),
        ]);
    builder.build()
}

fn packet(magic: &[u8; 4], table: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(0x10 + table.len());
    out.extend_from_slice(magic);
    out.extend_from_slice(&0xFFu32.to_le_bytes());
    out.extend_from_slice(&(table.len() as u64).to_le_bytes());
    out.extend_from_slice(table);
    out
}

fn align(value: u64) -> u64 {
    value.div_ceil(ALIGN) * ALIGN
}

/// Deterministic incompressible-ish bytes.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Repetitive text that CRILAYLA shrinks well.
pub fn text(len: usize) -> Vec<u8> {
    b"the quick brown fox jumps over the lazy dog. "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

/// Every file under `root`, as sorted `/`-separated relative paths with contents.
pub fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let relative = path
                    .strip_prefix(root)
                    .unwrap()
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((relative, fs::read(&path).unwrap()));
            }
        }
    }

    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}
