//! Backup orchestration: validate, dump the database and filestore through
//! an [`ExecutionBackend`], package everything with the archive module and
//! report staged progress. The engine renders nothing itself; the progress
//! channel is its only UI-facing contract.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use crate::archive;
use crate::backend::{sh_quote, ExecutionBackend};
use crate::error::{Error, Result};
use crate::pg;
use crate::progress::{CancelFlag, Reporter};
use crate::types::{ArchiveMetadata, BackupOptions, DbParams, Severity, Stage};

/// Produce an archive from a live instance. Returns the archive path.
///
/// Emits an ordered event stream as each stage begins and ends; any failure
/// emits a `Failed` event naming the stage and leaves no partial archive on
/// disk. Cancellation is honoured at stage boundaries only.
pub async fn backup(
    backend: &dyn ExecutionBackend,
    db: &DbParams,
    filestore_path: Option<&Path>,
    opts: &BackupOptions,
    reporter: &Reporter,
    cancel: &CancelFlag,
) -> Result<PathBuf> {
    let mut stage = Stage::Preparing;
    match backup_inner(backend, db, filestore_path, opts, reporter, cancel, &mut stage).await {
        Ok(path) => {
            reporter.success(Stage::Done, format!("backup written to {}", path.display()));
            Ok(path)
        }
        Err(e) => {
            reporter.failed(format!("backup failed during {stage}: {e}"));
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn backup_inner(
    backend: &dyn ExecutionBackend,
    db: &DbParams,
    filestore_path: Option<&Path>,
    opts: &BackupOptions,
    reporter: &Reporter,
    cancel: &CancelFlag,
    stage: &mut Stage,
) -> Result<PathBuf> {
    *stage = Stage::Preparing;
    reporter.emit_percent(Stage::Preparing, Severity::Info, "validating inputs", Some(0));
    validate(backend, db, filestore_path).await?;
    std::fs::create_dir_all(&opts.output_dir).map_err(|e| Error::io(&opts.output_dir, e))?;

    let scratch = tempfile::tempdir().map_err(|e| Error::io("scratch", e))?;
    let dump_path = scratch.path().join(archive::DATABASE_ENTRY);

    cancel.checkpoint(Stage::DumpingDatabase)?;
    *stage = Stage::DumpingDatabase;
    reporter.emit_percent(
        Stage::DumpingDatabase,
        Severity::Info,
        format!("dumping database {}", db.name),
        Some(10),
    );
    let out = backend
        .run_to_file(&pg::dump(db), &dump_path, opts.command_timeout)
        .await?;
    if !out.success() {
        return Err(Error::Execution(format!(
            "pg_dump of {} exited with {}: {}",
            db.name,
            out.exit_code,
            out.stderr.trim()
        )));
    }
    debug!(db = %db.name, path = %dump_path.display(), "database dump complete");

    let filestore_tar = match filestore_path {
        Some(fs_path) => {
            cancel.checkpoint(Stage::DumpingFilestore)?;
            *stage = Stage::DumpingFilestore;
            reporter.emit_percent(
                Stage::DumpingFilestore,
                Severity::Info,
                format!("archiving filestore {}", fs_path.display()),
                Some(50),
            );
            Some(dump_filestore(backend, db, fs_path, scratch.path(), opts.command_timeout).await?)
        }
        None => None,
    };

    let odoo_version = discover_version(backend, db).await;

    cancel.checkpoint(Stage::Packaging)?;
    *stage = Stage::Packaging;
    reporter.emit_percent(Stage::Packaging, Severity::Info, "packaging archive", Some(80));

    let metadata = ArchiveMetadata {
        timestamp: Utc::now(),
        database_name: db.name.clone(),
        odoo_version,
        includes_filestore: filestore_tar.is_some(),
    };

    // The tar/gzip work is blocking; keep it off the async workers.
    let output_dir = opts.output_dir.clone();
    let archive_path = tokio::task::spawn_blocking(move || {
        archive::build(
            &output_dir,
            &dump_path,
            filestore_tar.as_deref(),
            &metadata,
        )
    })
    .await
    .map_err(|e| Error::Execution(format!("packaging task failed: {e}")))??;

    Ok(archive_path)
}

async fn validate(
    backend: &dyn ExecutionBackend,
    db: &DbParams,
    filestore_path: Option<&Path>,
) -> Result<()> {
    if db.name.trim().is_empty() {
        return Err(Error::Validation("database name must not be empty".into()));
    }
    if db.host.trim().is_empty() {
        return Err(Error::Validation("database host must not be empty".into()));
    }
    if let Some(fs_path) = filestore_path {
        // Fail fast here rather than mid-stream after a long database dump.
        if !backend.dir_exists(fs_path).await? {
            return Err(Error::Validation(format!(
                "filestore path {} is not a readable directory",
                fs_path.display()
            )));
        }
    }
    Ok(())
}

/// Tar the filestore on the backend's machine, then pull the tarball to the
/// local scratch directory. One code path for both transports: the local
/// variant's `read_file` is a plain copy.
async fn dump_filestore(
    backend: &dyn ExecutionBackend,
    db: &DbParams,
    fs_path: &Path,
    scratch: &Path,
    timeout: u64,
) -> Result<PathBuf> {
    let safe_name: String = db
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let machine_tmp = format!(
        "/tmp/odoosnap_fs_{}_{}.tar.gz",
        safe_name,
        Utc::now().timestamp()
    );
    // `-C <filestore> .` keeps entries relative so the restore side can
    // unpack into a differently named destination directory.
    let tar_cmd = format!(
        "tar -czf {} -C {} .",
        sh_quote(&machine_tmp),
        sh_quote(&fs_path.to_string_lossy())
    );
    let out = backend.run(&tar_cmd, timeout).await?;
    if !out.success() {
        return Err(Error::Execution(format!(
            "filestore tar exited with {}: {}",
            out.exit_code,
            out.stderr.trim()
        )));
    }

    let local = scratch.join(archive::FILESTORE_ENTRY);
    let fetched = backend.read_file(Path::new(&machine_tmp), &local).await;
    // Remote temp cleanup happens regardless of the fetch outcome.
    let _ = backend
        .run(&format!("rm -f {}", sh_quote(&machine_tmp)), 60)
        .await;
    fetched?;
    Ok(local)
}

/// Best-effort: a missing or unqueryable `ir_module_module` never fails a
/// backup, it only leaves the version out of the metadata.
async fn discover_version(backend: &dyn ExecutionBackend, db: &DbParams) -> Option<String> {
    match backend.run(&pg::odoo_version(db), 60).await {
        Ok(out) if out.success() => {
            let version = out.stdout.trim();
            if version.is_empty() {
                None
            } else {
                Some(version.to_string())
            }
        }
        Ok(out) => {
            debug!(stderr = %out.stderr.trim(), "odoo version query failed");
            None
        }
        Err(e) => {
            debug!("odoo version query errored: {e}");
            None
        }
    }
}
