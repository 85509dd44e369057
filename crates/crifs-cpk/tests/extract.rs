//! End-to-end tests against synthetic archives.

mod common;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{noise, snapshot, text, CpkBuilder};
use crifs_cpk::extract::{NoProgress, SizeMatch};
use crifs_cpk::{
    decrypt_file, key, CancellationToken, CpkArchive, CpkEntry, Error, ExtractionOptions,
    ExtractionProgress, Extractor, OpenOptions, ReadBuffers, SkipPolicy, SourceKind,
};
use tempfile::tempdir;

fn sample() -> CpkBuilder {
    CpkBuilder::new()
        .file("", "readme.txt", b"hello cpk")
        .file("sound/bgm", "title.acb", &noise(0x1234, 1))
        .compressed("movie", "op.usm", &text(0x3000))
        .file("sound\\se", "click.awb", &noise(0x801, 2))
}

// ---------- listing and reads ----------

#[test]
fn listing_is_complete() {
    let dir = tempdir().unwrap();
    let path = sample().write(dir.path(), "data.cpk");

    let archive = CpkArchive::open(&path).unwrap();
    assert!(!archive.is_encrypted());
    assert_eq!(archive.header().files, Some(4));

    let entries = archive.entries().unwrap();
    let names: Vec<String> = entries.iter().map(CpkEntry::relative_path).collect();
    assert_eq!(
        names,
        ["readme.txt", "sound/bgm/title.acb", "movie/op.usm", "sound\\se/click.awb"]
    );

    let movie = &entries[2];
    assert_eq!(movie.extract_size, 0x3000);
    assert!(movie.is_compressed());
}

#[test]
fn find_and_read() {
    let dir = tempdir().unwrap();
    let path = sample().write(dir.path(), "data.cpk");
    let archive = CpkArchive::open(&path).unwrap();

    let entry = archive.find("SOUND\\BGM\\Title.acb").unwrap().unwrap();
    let read = archive.read(&entry).unwrap();
    assert!(!read.decompressed);
    assert_eq!(read.data.as_ref(), noise(0x1234, 1).as_slice());

    let movie = archive.read_path("movie/op.usm").unwrap();
    assert_eq!(movie, text(0x3000));

    assert!(matches!(
        archive.read_path("missing.bin"),
        Err(Error::EntryNotFound(_))
    ));
}

#[test]
fn mapped_and_buffered_reads_match() {
    let dir = tempdir().unwrap();
    let path = sample().write(dir.path(), "data.cpk");

    let mapped = CpkArchive::open_with(&path, OpenOptions::new().with_mmap_threshold(0)).unwrap();
    let buffered =
        CpkArchive::open_with(&path, OpenOptions::new().with_mmap_threshold(u64::MAX)).unwrap();
    assert_eq!(mapped.source_kind(), SourceKind::Mapped);
    assert_eq!(buffered.source_kind(), SourceKind::Buffered);

    let entries = mapped.entries().unwrap();
    assert_eq!(entries.as_ref(), buffered.entries().unwrap().as_ref());
    for entry in entries.iter() {
        assert_eq!(
            mapped.read(entry).unwrap().into_owned(),
            buffered.read(entry).unwrap().into_owned(),
            "{}",
            entry.relative_path()
        );
    }
}

// ---------- encryption ----------

#[test]
fn encrypted_archive_keyed_by_file_name() {
    let dir = tempdir().unwrap();
    let path = sample().write_encrypted(dir.path(), "secret.cpk");

    let archive = CpkArchive::open(&path).unwrap();
    assert!(archive.is_encrypted());
    assert_eq!(archive.key(), Some(key::derive_key("secret.cpk")));
    assert_eq!(archive.entries().unwrap().len(), 4);
    assert_eq!(archive.read_path("readme.txt").unwrap(), b"hello cpk");
    assert_eq!(archive.read_path("movie/op.usm").unwrap(), text(0x3000));
}

#[test]
fn renamed_archive_needs_alias_or_key() {
    let dir = tempdir().unwrap();
    let image = sample().build_encrypted(key::derive_key("secret.cpk"));
    let path = dir.path().join("renamed.cpk");
    fs::write(&path, image).unwrap();

    assert!(matches!(
        CpkArchive::open(&path),
        Err(Error::UnknownKey { .. })
    ));

    let by_alias = CpkArchive::open_with(&path, OpenOptions::new().with_alias("secret.cpk")).unwrap();
    assert_eq!(by_alias.key(), Some(key::derive_key("secret.cpk")));

    let by_key = CpkArchive::open_with(
        &path,
        OpenOptions::new().with_key(key::derive_key("secret.cpk")),
    )
    .unwrap();
    assert_eq!(by_key.read_path("readme.txt").unwrap(), b"hello cpk");

    assert!(CpkArchive::open_with(
        &path,
        OpenOptions::new().with_key(key::derive_key("wrong.cpk"))
    )
    .is_err());
}

#[test]
fn decrypt_file_round_trip() {
    let dir = tempdir().unwrap();
    let plain = sample().build();
    let encrypted = sample().write_encrypted(dir.path(), "secret.cpk");

    let out = dir.path().join("plain.cpk");
    let used = decrypt_file(&encrypted, &out, None, &[], 4096).unwrap();
    assert_eq!(used, Some(key::derive_key("secret.cpk")));
    assert_eq!(fs::read(&out).unwrap(), plain);

    // Already plaintext: nothing to do.
    let again = dir.path().join("again.cpk");
    assert_eq!(decrypt_file(&out, &again, None, &[], 4096).unwrap(), None);
    assert!(!again.exists());

    // An explicit key transcodes in either direction.
    let reencrypted = dir.path().join("re.cpk");
    decrypt_file(&out, &reencrypted, used, &[], 1000).unwrap();
    assert_eq!(fs::read(&reencrypted).unwrap(), fs::read(&encrypted).unwrap());
}

#[test]
fn custom_decryptor_sees_absolute_offsets() {
    let dir = tempdir().unwrap();
    let scramble = |offset: u64, data: &mut [u8]| {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= (offset + i as u64) as u8 ^ 0x5A;
        }
    };

    let mut image = sample().build();
    scramble(0, &mut image);
    let path = dir.path().join("custom.cpk");
    fs::write(&path, image).unwrap();

    let archive =
        CpkArchive::open_with(&path, OpenOptions::new().with_decryptor(Arc::new(scramble))).unwrap();
    assert!(archive.is_encrypted());
    assert_eq!(archive.key(), None);
    assert_eq!(archive.read_path("sound/bgm/title.acb").unwrap(), noise(0x1234, 1));
    assert_eq!(archive.read_path("movie/op.usm").unwrap(), text(0x3000));
}

#[test]
fn tiny_and_foreign_files_are_rejected() {
    let dir = tempdir().unwrap();

    let tiny = dir.path().join("tiny.cpk");
    fs::write(&tiny, b"CPK ").unwrap();
    assert!(matches!(CpkArchive::open(&tiny), Err(Error::Truncated { .. })));

    let foreign = dir.path().join("foreign.cpk");
    fs::write(&foreign, noise(0x100, 9)).unwrap();
    assert!(matches!(
        CpkArchive::open(&foreign),
        Err(Error::UnknownKey { .. })
    ));
}

// ---------- bulk extraction ----------

#[test]
fn extract_all_writes_every_entry() {
    let dir = tempdir().unwrap();
    let path = sample().write(dir.path(), "data.cpk");
    let out = dir.path().join("out");

    let archive = CpkArchive::open(&path).unwrap();
    let summary = Extractor::new(&archive, ExtractionOptions::new())
        .extract_all(&out, &NoProgress)
        .unwrap();

    assert!(summary.is_clean(), "{:?}", summary.failures);
    assert_eq!(summary.total, 4);
    assert_eq!(summary.extracted, 4);
    assert_eq!(
        summary.bytes_written,
        (b"hello cpk".len() + 0x1234 + 0x3000 + 0x801) as u64
    );

    let files = snapshot(&out);
    let names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        [
            "movie/op.usm",
            "readme.txt",
            "sound/bgm/title.acb",
            "sound/se/click.awb"
        ]
    );
    assert_eq!(files[0].1, text(0x3000));
}

#[test]
fn parallelism_does_not_change_output() {
    let dir = tempdir().unwrap();
    let mut builder = CpkBuilder::new();
    for i in 0..40u32 {
        builder = builder.file(&format!("d{}", i % 5), &format!("f{i}.bin"), &noise(100 + i as usize * 37, i));
    }
    let path = builder.write(dir.path(), "many.cpk");
    let archive = CpkArchive::open(&path).unwrap();

    let serial = dir.path().join("serial");
    let parallel = dir.path().join("parallel");
    let one = Extractor::new(&archive, ExtractionOptions::new().with_max_parallelism(1))
        .extract_all(&serial, &NoProgress)
        .unwrap();
    let eight = Extractor::new(&archive, ExtractionOptions::new().with_max_parallelism(8))
        .extract_all(&parallel, &NoProgress)
        .unwrap();

    assert_eq!(one.extracted, 40);
    assert_eq!(eight.extracted, 40);
    assert_eq!(snapshot(&serial), snapshot(&parallel));
}

#[derive(Default)]
struct CountingPolicy {
    writes: AtomicUsize,
}

impl SkipPolicy for CountingPolicy {
    fn should_skip(&self, relative: &str, target: &std::path::Path, entry: &CpkEntry) -> bool {
        SizeMatch.should_skip(relative, target, entry)
    }

    fn record_extracted(&self, _relative: &str, _target: &std::path::Path, _entry: &CpkEntry, _data: &[u8]) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn resume_skips_completed_entries() {
    let dir = tempdir().unwrap();
    let path = sample().write(dir.path(), "data.cpk");
    let out = dir.path().join("out");
    let archive = CpkArchive::open(&path).unwrap();
    let options = ExtractionOptions::new().with_skip_existing(true);

    let first_policy = Arc::new(CountingPolicy::default());
    let first = Extractor::new(&archive, options.clone())
        .with_skip_policy(first_policy.clone())
        .extract_all(&out, &NoProgress)
        .unwrap();
    assert_eq!(first.extracted, 4);
    assert_eq!(first_policy.writes.load(Ordering::Relaxed), 4);
    let before = snapshot(&out);

    let second_policy = Arc::new(CountingPolicy::default());
    let second = Extractor::new(&archive, options.clone())
        .with_skip_policy(second_policy.clone())
        .extract_all(&out, &NoProgress)
        .unwrap();
    assert_eq!(second.skipped, 4);
    assert_eq!(second.extracted, 0);
    assert_eq!(second_policy.writes.load(Ordering::Relaxed), 0);
    assert_eq!(snapshot(&out), before);

    // A damaged output file is rewritten.
    fs::write(out.join("readme.txt"), b"x").unwrap();
    let third = Extractor::new(&archive, options)
        .extract_all(&out, &NoProgress)
        .unwrap();
    assert_eq!(third.extracted, 1);
    assert_eq!(third.skipped, 3);
    assert_eq!(fs::read(out.join("readme.txt")).unwrap(), b"hello cpk");
}

#[test]
fn traversal_entries_are_rejected() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("nested");
    fs::create_dir(&root).unwrap();
    let path = CpkBuilder::new()
        .file("../../evil", "x.bin", b"bad")
        .file("ok", "y.bin", b"good")
        .write(&root, "data.cpk");
    let out = root.join("out");

    let archive = CpkArchive::open(&path).unwrap();
    let summary = Extractor::new(&archive, ExtractionOptions::new())
        .extract_all(&out, &NoProgress)
        .unwrap();

    assert_eq!(summary.extracted, 1);
    assert_eq!(summary.failed, 1);
    assert!(summary.failures[0].path.contains("evil"));
    assert!(!dir.path().join("evil").exists());
    assert!(!root.join("evil").exists());
    assert_eq!(snapshot(&out), vec![("ok/y.bin".to_string(), b"good".to_vec())]);
}

#[test]
fn truncated_entry_is_contained() {
    let dir = tempdir().unwrap();
    let mut image = CpkBuilder::new()
        .file("", "a.bin", &noise(0x900, 1))
        .file("", "b.bin", &noise(0x900, 2))
        .build();
    image.truncate(image.len() - 0x10);
    let path = dir.path().join("cut.cpk");
    fs::write(&path, image).unwrap();

    let archive = CpkArchive::open(&path).unwrap();
    let entries = archive.entries().unwrap();
    assert!(matches!(
        archive.read(&entries[1]),
        Err(Error::TruncatedEntry { .. })
    ));

    let out = dir.path().join("out");
    let summary = Extractor::new(&archive, ExtractionOptions::new())
        .extract_all(&out, &NoProgress)
        .unwrap();
    assert_eq!(summary.extracted, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].path, "b.bin");
    assert_eq!(fs::read(out.join("a.bin")).unwrap(), noise(0x900, 1));
    assert_eq!(snapshot(&out), vec![("a.bin".to_string(), noise(0x900, 1))]);
}

#[test]
fn duplicate_output_paths_have_one_writer() {
    let dir = tempdir().unwrap();
    let first = noise(0x4000, 1);
    let mut builder = CpkBuilder::new().file("d", "same.bin", &first);
    for i in 0..7u32 {
        builder = builder.file("d", "same.bin", &noise(0x4000 + i as usize, 10 + i));
    }
    let path = builder.file("d", "other.bin", b"other").write(dir.path(), "dup.cpk");
    let out = dir.path().join("out");

    let archive = CpkArchive::open(&path).unwrap();
    let summary = Extractor::new(&archive, ExtractionOptions::new().with_max_parallelism(8))
        .extract_all(&out, &NoProgress)
        .unwrap();

    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.failed, 7);
    assert!(summary
        .failures
        .iter()
        .all(|f| f.path == "d/same.bin" && f.error.contains("already extracts")));
    assert_eq!(
        snapshot(&out),
        vec![
            ("d/other.bin".to_string(), b"other".to_vec()),
            ("d/same.bin".to_string(), first),
        ]
    );
}

#[test]
fn mapped_and_buffered_extractions_match() {
    let dir = tempdir().unwrap();
    let plain = sample().write(dir.path(), "data.cpk");
    let encrypted = sample().write_encrypted(dir.path(), "secret.cpk");

    for path in [&plain, &encrypted] {
        let stem = path.file_stem().unwrap().to_string_lossy().into_owned();
        let mapped_out = dir.path().join(format!("{stem}-mapped"));
        let buffered_out = dir.path().join(format!("{stem}-buffered"));

        let mapped = crifs_cpk::dump_cpk(
            path,
            &mapped_out,
            ExtractionOptions::new().with_mmap_threshold(0),
            &NoProgress,
        )
        .unwrap();
        let buffered = crifs_cpk::dump_cpk(
            path,
            &buffered_out,
            ExtractionOptions::new().with_mmap_threshold(u64::MAX),
            &NoProgress,
        )
        .unwrap();

        assert!(mapped.is_clean(), "{:?}", mapped.failures);
        assert!(buffered.is_clean(), "{:?}", buffered.failures);
        let files = snapshot(&mapped_out);
        assert_eq!(files.len(), 4);
        assert_eq!(files[0], ("movie/op.usm".to_string(), text(0x3000)));
        assert_eq!(files[2], ("sound/bgm/title.acb".to_string(), noise(0x1234, 1)));
        assert_eq!(files, snapshot(&buffered_out));
    }
}

#[test]
fn compressed_size_must_match_directory() {
    let dir = tempdir().unwrap();
    let path = CpkBuilder::new()
        .compressed_sized("", "lie.bin", &text(0x1000), 0x800)
        .compressed("", "ok.bin", &text(0x1000))
        .write(dir.path(), "data.cpk");

    let archive = CpkArchive::open_with(&path, OpenOptions::new().with_mmap_threshold(0)).unwrap();
    let entries = archive.entries().unwrap();
    assert!(matches!(archive.read(&entries[0]), Err(Error::Decompression(_))));

    let mut buffers = ReadBuffers::new();
    assert!(matches!(
        archive.read_with(&entries[0], &mut buffers),
        Err(Error::Decompression(_))
    ));
    assert_eq!(
        archive.read_with(&entries[1], &mut buffers).unwrap().data.as_ref(),
        text(0x1000).as_slice()
    );

    let out = dir.path().join("out");
    let summary = Extractor::new(&archive, ExtractionOptions::new())
        .extract_all(&out, &NoProgress)
        .unwrap();
    assert_eq!(summary.extracted, 1);
    assert_eq!(summary.failures[0].path, "lie.bin");
    assert_eq!(snapshot(&out), vec![("ok.bin".to_string(), text(0x1000))]);
}

#[test]
fn cancelled_before_start_writes_nothing() {
    let dir = tempdir().unwrap();
    let path = sample().write(dir.path(), "data.cpk");
    let out = dir.path().join("out");
    let archive = CpkArchive::open(&path).unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let summary = Extractor::new(&archive, ExtractionOptions::new())
        .with_cancellation(token)
        .extract_all(&out, &NoProgress)
        .unwrap();

    assert!(summary.cancelled);
    assert!(!summary.is_clean());
    assert_eq!(summary.extracted, 0);
    assert!(snapshot(&out).is_empty());
}

#[test]
fn progress_reaches_totals() {
    let dir = tempdir().unwrap();
    let path = sample().write(dir.path(), "data.cpk");
    let out = dir.path().join("out");
    let archive = CpkArchive::open(&path).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded::<ExtractionProgress>();
    Extractor::new(&archive, ExtractionOptions::new().with_max_parallelism(2))
        .extract_all(&out, &tx)
        .unwrap();
    drop(tx);

    let reports: Vec<_> = rx.iter().collect();
    assert!(!reports.is_empty());
    for pair in reports.windows(2) {
        assert!(pair[0].files_done <= pair[1].files_done);
        assert!(pair[0].bytes_done <= pair[1].bytes_done);
    }
    let last = reports.last().unwrap();
    assert!(last.is_complete());
    assert_eq!(last.files_total, 4);
    assert_eq!(last.bytes_done, last.bytes_total);
}

#[test]
fn dump_cpk_extracts_encrypted_archive() {
    let dir = tempdir().unwrap();
    let path = sample().write_encrypted(dir.path(), "secret.cpk");
    let out = dir.path().join("out");

    let summary =
        crifs_cpk::dump_cpk(&path, &out, ExtractionOptions::new(), &NoProgress).unwrap();
    assert!(summary.is_clean());
    assert_eq!(fs::read(out.join("readme.txt")).unwrap(), b"hello cpk");
    assert_eq!(fs::read(out.join("movie").join("op.usm")).unwrap(), text(0x3000));
}
