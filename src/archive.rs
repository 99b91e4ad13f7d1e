//! The backup container: a gzip-compressed tar holding, in fixed order,
//! `metadata.json`, `database.sql` and (optionally) `filestore.tar.gz`.
//! Metadata comes first so an archive can be inspected and validated without
//! streaming the payload entries. Pure data-format code; no backend involved.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::types::ArchiveMetadata;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const DATABASE_ENTRY: &str = "database.sql";
pub const FILESTORE_ENTRY: &str = "filestore.tar.gz";

/// `backup_<DBNAME>_<YYYYMMDD>_<HHMMSS>.tar.gz`
pub fn archive_file_name(database_name: &str, at: DateTime<Utc>) -> String {
    format!(
        "backup_{}_{}.tar.gz",
        database_name,
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Paths of the extracted payload entries, valid as long as the scratch
/// directory they were unpacked into.
#[derive(Debug)]
pub struct ExtractedArchive {
    pub metadata: ArchiveMetadata,
    pub database_sql: PathBuf,
    pub filestore: Option<PathBuf>,
}

/// Package a database dump and an optional filestore tarball into one
/// archive under `dest_dir`. The payload files are streamed in; nothing is
/// buffered wholesale. A partially written archive is removed on failure.
pub fn build(
    dest_dir: &Path,
    db_dump: &Path,
    filestore: Option<&Path>,
    metadata: &ArchiveMetadata,
) -> Result<PathBuf> {
    let path = dest_dir.join(archive_file_name(&metadata.database_name, metadata.timestamp));
    match build_into(&path, db_dump, filestore, metadata) {
        Ok(()) => Ok(path),
        Err(e) => {
            let _ = std::fs::remove_file(&path);
            Err(e)
        }
    }
}

fn build_into(
    path: &Path,
    db_dump: &Path,
    filestore: Option<&Path>,
    metadata: &ArchiveMetadata,
) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let meta_bytes = serde_json::to_vec_pretty(metadata)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(meta_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(metadata.timestamp.timestamp().max(0) as u64);
    header.set_cksum();
    builder
        .append_data(&mut header, METADATA_ENTRY, meta_bytes.as_slice())
        .map_err(|e| Error::Archive(format!("writing metadata entry failed: {e}")))?;

    let mut db_file = File::open(db_dump).map_err(|e| Error::io(db_dump, e))?;
    builder
        .append_file(DATABASE_ENTRY, &mut db_file)
        .map_err(|e| Error::Archive(format!("writing database entry failed: {e}")))?;

    if let Some(fs_path) = filestore {
        let mut fs_file = File::open(fs_path).map_err(|e| Error::io(fs_path, e))?;
        builder
            .append_file(FILESTORE_ENTRY, &mut fs_file)
            .map_err(|e| Error::Archive(format!("writing filestore entry failed: {e}")))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::Archive(format!("finalizing archive failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::Archive(format!("compressing archive failed: {e}")))?;
    Ok(())
}

/// Read and validate the metadata entry only. Payload entries are never
/// read, so a cheap inspection works even on archives whose payloads would
/// not restore.
pub fn open(path: &Path) -> Result<ArchiveMetadata> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut entries = archive
        .entries()
        .map_err(|e| Error::Archive(format!("unreadable archive {}: {e}", path.display())))?;

    let entry = entries
        .next()
        .ok_or_else(|| Error::Archive(format!("{} is empty", path.display())))?
        .map_err(|e| Error::Archive(format!("unreadable archive {}: {e}", path.display())))?;

    let name = entry
        .path()
        .map_err(|e| Error::Archive(format!("bad entry name: {e}")))?
        .into_owned();
    if name != Path::new(METADATA_ENTRY) {
        return Err(Error::Archive(format!(
            "{} does not start with {METADATA_ENTRY} (found {})",
            path.display(),
            name.display()
        )));
    }

    serde_json::from_reader(entry)
        .map_err(|e| Error::Archive(format!("invalid metadata in {}: {e}", path.display())))
}

/// Unpack the payload entries into `scratch_dir`, streamed entry by entry.
/// The full dump is never materialized in memory.
pub fn extract(path: &Path, scratch_dir: &Path) -> Result<ExtractedArchive> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut metadata: Option<ArchiveMetadata> = None;
    let mut database_sql: Option<PathBuf> = None;
    let mut filestore: Option<PathBuf> = None;

    let entries = archive
        .entries()
        .map_err(|e| Error::Archive(format!("unreadable archive {}: {e}", path.display())))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::Archive(format!("corrupt archive {}: {e}", path.display())))?;
        let name = entry
            .path()
            .map_err(|e| Error::Archive(format!("bad entry name: {e}")))?
            .into_owned();

        if name == Path::new(METADATA_ENTRY) {
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| Error::Archive(format!("reading metadata failed: {e}")))?;
            metadata = Some(serde_json::from_slice(&buf).map_err(|e| {
                Error::Archive(format!("invalid metadata in {}: {e}", path.display()))
            })?);
        } else if name == Path::new(DATABASE_ENTRY) {
            let dest = scratch_dir.join(DATABASE_ENTRY);
            entry
                .unpack(&dest)
                .map_err(|e| Error::Archive(format!("unpacking database entry failed: {e}")))?;
            database_sql = Some(dest);
        } else if name == Path::new(FILESTORE_ENTRY) {
            let dest = scratch_dir.join(FILESTORE_ENTRY);
            entry
                .unpack(&dest)
                .map_err(|e| Error::Archive(format!("unpacking filestore entry failed: {e}")))?;
            filestore = Some(dest);
        }
        // Unknown entries are ignored for forward compatibility.
    }

    let metadata = metadata.ok_or_else(|| {
        Error::Archive(format!("{} has no {METADATA_ENTRY}", path.display()))
    })?;
    let database_sql = database_sql.ok_or_else(|| {
        Error::Archive(format!("{} has no {DATABASE_ENTRY}", path.display()))
    })?;
    if metadata.includes_filestore && filestore.is_none() {
        return Err(Error::Archive(format!(
            "{} claims a filestore entry but has none",
            path.display()
        )));
    }

    Ok(ExtractedArchive {
        metadata,
        database_sql,
        filestore,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_metadata(includes_filestore: bool) -> ArchiveMetadata {
        ArchiveMetadata {
            timestamp: "2025-06-01T12:30:45Z".parse().unwrap(),
            database_name: "demo".to_string(),
            odoo_version: Some("17.0".to_string()),
            includes_filestore,
        }
    }

    #[test]
    fn file_name_convention() {
        let meta = sample_metadata(true);
        assert_eq!(
            archive_file_name(&meta.database_name, meta.timestamp),
            "backup_demo_20250601_123045.tar.gz"
        );
    }

    #[test]
    fn round_trip_reproduces_metadata_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("dump.sql");
        let fs_tar = dir.path().join("fs.tar.gz");
        std::fs::write(&dump, b"CREATE TABLE t (id int);\n").unwrap();
        std::fs::write(&fs_tar, b"\x1f\x8b fake filestore bytes").unwrap();

        let meta = sample_metadata(true);
        let archive = build(dir.path(), &dump, Some(&fs_tar), &meta).unwrap();
        assert!(archive
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("backup_demo_"));

        let scratch = tempfile::tempdir().unwrap();
        let extracted = extract(&archive, scratch.path()).unwrap();
        assert_eq!(extracted.metadata, meta);
        assert_eq!(
            std::fs::read(&extracted.database_sql).unwrap(),
            b"CREATE TABLE t (id int);\n"
        );
        assert_eq!(
            std::fs::read(extracted.filestore.as_ref().unwrap()).unwrap(),
            b"\x1f\x8b fake filestore bytes"
        );
    }

    #[test]
    fn build_without_filestore_extracts_none() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("dump.sql");
        std::fs::write(&dump, b"-- empty\n").unwrap();

        let archive = build(dir.path(), &dump, None, &sample_metadata(false)).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let extracted = extract(&archive, scratch.path()).unwrap();
        assert!(extracted.filestore.is_none());
        assert!(!extracted.metadata.includes_filestore);
    }

    #[test]
    fn open_reads_metadata_without_touching_payload() {
        // Hand-build an archive whose payload is garbage; `open` must still
        // succeed because it never parses payload entries.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weird.tar.gz");
        let meta = sample_metadata(false);
        let meta_bytes = serde_json::to_vec(&meta).unwrap();

        let file = File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(meta_bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, METADATA_ENTRY, meta_bytes.as_slice())
            .unwrap();

        let garbage = vec![0xABu8; 4096];
        let mut header = tar::Header::new_gnu();
        header.set_size(garbage.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, DATABASE_ENTRY, garbage.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        assert_eq!(open(&path).unwrap(), meta);
    }

    #[test]
    fn open_rejects_archive_without_leading_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noorder.tar.gz");
        let file = File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let payload = b"not metadata";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, DATABASE_ENTRY, payload.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = open(&path).unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[test]
    fn open_rejects_truncated_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.tar.gz");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"\x1f\x8b\x08 definitely not a full gzip stream")
            .unwrap();

        let err = open(&path).unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[test]
    fn extract_rejects_missing_claimed_filestore() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("dump.sql");
        std::fs::write(&dump, b"select 1;\n").unwrap();

        // Metadata claims a filestore that was never appended.
        let archive = build(dir.path(), &dump, None, &sample_metadata(true)).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let err = extract(&archive, scratch.path()).unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }
}
