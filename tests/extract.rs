//! Extraction scenarios: type preservation, destination safety, cleanup.

use std::fs;
use std::io::Write;

use similar_asserts::assert_eq;

use arcstream::{ArchiveCursor, ArchiveError, EntryKind, PathEncoding, Phase};

fn temp_archive(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

fn open(bytes: &[u8]) -> (ArchiveCursor, tempfile::NamedTempFile) {
    let file = temp_archive(bytes);
    let cursor = ArchiveCursor::open(file.path(), PathEncoding::Utf8).unwrap();
    (cursor, file)
}

fn file_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn special_entry(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    kind: tar::EntryType,
    link: Option<&str>,
) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(0);
    if let Some(link) = link {
        header.set_link_name(link).unwrap();
    }
    builder
        .append_data(&mut header, path, std::io::empty())
        .unwrap();
}

#[test]
fn extract_streams_file_to_destination() {
    let payload = vec![0xabu8; 20_000];
    let (mut cursor, _file) = open(&file_archive(&[("blob.bin", &payload)]));
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("blob.bin");

    let mut member = cursor.next_member().unwrap().unwrap();
    member.extract(&dst, false).unwrap();
    assert_eq!(member.phase(), Phase::DataSkipped);
    assert_eq!(fs::read(&dst).unwrap(), payload);

    // The payload was consumed by the extraction.
    assert!(matches!(
        member.fetch_data(),
        Err(ArchiveError::WrongPhase {
            consumed: "skipped"
        })
    ));
    assert!(cursor.next_member().unwrap().is_none());
}

#[test]
fn missing_parent_fails_until_requested() {
    let (mut cursor, _file) = open(&file_archive(&[("mods/pack/readme.txt", b"hi")]));
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("deep/nested/readme.txt");

    let mut member = cursor.next_member().unwrap().unwrap();
    match member.extract(&dst, false) {
        Err(ArchiveError::ExtractionIOError { errno, .. }) => assert!(errno.is_some()),
        other => panic!("expected ExtractionIOError, got {other:?}"),
    }
    // Nothing was consumed; the same member extracts fine with parents.
    assert_eq!(member.phase(), Phase::Fresh);
    member.extract(&dst, true).unwrap();
    assert_eq!(fs::read(&dst).unwrap(), b"hi");
}

#[test]
fn existing_destination_is_never_overwritten() {
    let (mut cursor, _file) = open(&file_archive(&[("a.txt", b"new")]));
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("a.txt");
    fs::write(&dst, b"old").unwrap();

    let mut member = cursor.next_member().unwrap().unwrap();
    match member.extract(&dst, false) {
        Err(ArchiveError::DestinationExists { path }) => assert_eq!(path, dst),
        other => panic!("expected DestinationExists, got {other:?}"),
    }
    assert_eq!(fs::read(&dst).unwrap(), b"old");

    // Still fresh: a different destination works.
    let other = dir.path().join("b.txt");
    member.extract(&other, false).unwrap();
    assert_eq!(fs::read(&other).unwrap(), b"new");
}

#[cfg(unix)]
#[test]
fn symlinked_parent_is_refused() {
    let (mut cursor, _file) = open(&file_archive(&[("a.txt", b"payload")]));
    let dir = tempfile::tempdir().unwrap();
    let real = dir.path().join("real");
    fs::create_dir(&real).unwrap();
    let link = dir.path().join("link");
    std::os::unix::fs::symlink(&real, &link).unwrap();

    let mut member = cursor.next_member().unwrap().unwrap();
    let err = member.extract(&link.join("a.txt"), false).unwrap_err();
    assert!(matches!(err, ArchiveError::ExtractionIOError { .. }));
    assert!(real.read_dir().unwrap().next().is_none());

    member.extract(&real.join("a.txt"), false).unwrap();
}

#[cfg(unix)]
#[test]
fn directory_and_symlink_entries_are_materialized() {
    let mut builder = tar::Builder::new(Vec::new());
    special_entry(&mut builder, "sub", tar::EntryType::Directory, None);
    special_entry(
        &mut builder,
        "latest.txt",
        tar::EntryType::Symlink,
        Some("sub/current.txt"),
    );
    let (mut cursor, _file) = open(&builder.into_inner().unwrap());
    let dir = tempfile::tempdir().unwrap();

    let mut member = cursor.next_member().unwrap().unwrap();
    assert_eq!(member.entry_type().unwrap(), EntryKind::Directory);
    member.extract(&dir.path().join("sub"), false).unwrap();
    assert!(dir.path().join("sub").is_dir());

    let mut member = cursor.next_member().unwrap().unwrap();
    assert_eq!(member.entry_type().unwrap(), EntryKind::Symlink);
    let dst = dir.path().join("latest.txt");
    member.extract(&dst, false).unwrap();
    let target = fs::read_link(&dst).unwrap();
    assert_eq!(target, std::path::Path::new("sub/current.txt"));
}

#[cfg(unix)]
#[test]
fn hard_link_entries_link_to_sibling() {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(6);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder
        .append_data(&mut header, "original.txt", &b"shared"[..])
        .unwrap();
    special_entry(
        &mut builder,
        "copy.txt",
        tar::EntryType::Link,
        Some("original.txt"),
    );
    let (mut cursor, _file) = open(&builder.into_inner().unwrap());
    let dir = tempfile::tempdir().unwrap();

    let mut member = cursor.next_member().unwrap().unwrap();
    member.extract(&dir.path().join("original.txt"), false).unwrap();

    let mut member = cursor.next_member().unwrap().unwrap();
    assert_eq!(member.entry_type().unwrap(), EntryKind::HardLink);
    assert_eq!(member.link_target().unwrap(), "original.txt");
    member.extract(&dir.path().join("copy.txt"), false).unwrap();
    assert_eq!(fs::read(dir.path().join("copy.txt")).unwrap(), b"shared");
}

#[test]
fn truncated_payload_removes_partial_file() {
    let bytes = file_archive(&[("big.bin", &[5u8; 4096])]);
    // Cut off most of the payload.
    let truncated = &bytes[..512 + 600];
    let (mut cursor, _file) = open(truncated);
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("big.bin");

    let mut member = cursor.next_member().unwrap().unwrap();
    assert!(matches!(
        member.extract(&dst, false),
        Err(ArchiveError::DataReadError { .. })
    ));
    // No partial result is left behind.
    assert!(!dst.exists());
}

#[test]
fn cancelled_extraction_creates_nothing() {
    let (mut cursor, _file) = open(&file_archive(&[("a.txt", b"payload")]));
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("a.txt");

    let mut member = cursor.next_member().unwrap().unwrap();
    cursor.cancel();
    assert!(matches!(
        member.extract(&dst, false),
        Err(ArchiveError::Cancelled)
    ));
    assert!(!dst.exists());
}

#[test]
fn special_entries_are_not_extractable_but_skippable() {
    let mut builder = tar::Builder::new(Vec::new());
    special_entry(&mut builder, "pipe", tar::EntryType::Fifo, None);
    let mut header = tar::Header::new_gnu();
    header.set_size(4);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder
        .append_data(&mut header, "after.txt", &b"tail"[..])
        .unwrap();
    let (mut cursor, _file) = open(&builder.into_inner().unwrap());
    let dir = tempfile::tempdir().unwrap();

    let mut member = cursor.next_member().unwrap().unwrap();
    assert_eq!(member.entry_type().unwrap(), EntryKind::Other);
    assert!(matches!(
        member.extract(&dir.path().join("pipe"), false),
        Err(ArchiveError::ExtractionIOError { .. })
    ));
    // The entry can still be stepped over.
    assert_eq!(member.phase(), Phase::Fresh);

    let mut member = cursor.next_member().unwrap().unwrap();
    assert_eq!(member.data().unwrap(), b"tail".as_slice());
}
