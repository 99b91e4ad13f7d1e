//! Restore orchestration: safety gate, archive validation, database and
//! filestore restore, and the destination-only neutralization procedure.
//!
//! Two restores must not target the same destination database concurrently;
//! the core does not serialize operations, that is the caller's
//! responsibility. A failed restore leaves the destination in whatever
//! partial state the failing step produced; there is deliberately no
//! rollback.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::archive;
use crate::backend::{sh_quote, ExecutionBackend};
use crate::backup;
use crate::error::{Error, Result};
use crate::pg;
use crate::progress::{CancelFlag, Reporter};
use crate::types::{BackupOptions, DbParams, RestoreOptions, SafetyGate, Severity, Stage};

/// Prefix applied to every company display name during neutralization.
pub const TEST_MARKER: &str = "[TEST] ";

/// The fixed neutralization sequence: idempotent mutations that make a
/// restored copy safe to run without contacting external services. Issued
/// against the destination database only, never the source archive.
fn neutralization_statements() -> Vec<(&'static str, String)> {
    vec![
        (
            "disable outgoing mail servers",
            "UPDATE ir_mail_server SET active = false WHERE active".to_string(),
        ),
        (
            "disable scheduled actions",
            "UPDATE ir_cron SET active = false WHERE active".to_string(),
        ),
        (
            "disable payment acquirers",
            "UPDATE payment_acquirer SET state = 'disabled' WHERE state <> 'disabled'".to_string(),
        ),
        (
            // Odoo 16.0 renamed the table; run both, skip the one that is
            // missing in this database's version.
            "disable payment providers",
            "UPDATE payment_provider SET state = 'disabled' WHERE state <> 'disabled'".to_string(),
        ),
        (
            "purge queued outgoing emails",
            "DELETE FROM mail_mail WHERE state = 'outgoing'".to_string(),
        ),
        (
            "mark companies with test prefix",
            format!(
                "UPDATE res_company SET name = '{TEST_MARKER}' || name \
                 WHERE name NOT LIKE '{TEST_MARKER}%'"
            ),
        ),
        (
            "unfreeze base url",
            "DELETE FROM ir_config_parameter \
             WHERE key IN ('web.base.url', 'web.base.url.freeze')"
                .to_string(),
        ),
    ]
}

/// Apply an archive to a target instance. The safety gate runs before any
/// backend call that could mutate the destination; archive metadata is
/// validated before the destination is touched.
#[allow(clippy::too_many_arguments)]
pub async fn restore(
    backend: &dyn ExecutionBackend,
    archive_path: &Path,
    target: &DbParams,
    filestore_dest: Option<&Path>,
    gate: &SafetyGate,
    opts: &RestoreOptions,
    reporter: &Reporter,
    cancel: &CancelFlag,
) -> Result<()> {
    check_gate(gate, &target.name)?;

    let mut stage = Stage::Preparing;
    match restore_inner(
        backend,
        archive_path,
        target,
        filestore_dest,
        opts,
        reporter,
        cancel,
        &mut stage,
    )
    .await
    {
        Ok(()) => {
            reporter.success(Stage::Done, format!("restore into {} complete", target.name));
            Ok(())
        }
        Err(e) => {
            reporter.failed(format!("restore failed during {stage}: {e}"));
            Err(e)
        }
    }
}

/// Gate rules: `allow_restore == false` fails unconditionally, no
/// confirmation token can bypass it. A production destination additionally
/// requires the caller to supply the destination database name as token.
fn check_gate(gate: &SafetyGate, target_name: &str) -> Result<()> {
    if !gate.allow_restore {
        return Err(Error::Safety(
            "destination profile does not allow restores; set allow-restore on it first".into(),
        ));
    }
    if gate.is_production {
        match gate.confirmation.as_deref() {
            Some(token) if token == target_name => {}
            Some(_) => {
                return Err(Error::Safety(format!(
                    "production confirmation token does not match destination database {target_name}"
                )))
            }
            None => {
                return Err(Error::Safety(format!(
                    "destination is marked production; confirm by supplying the destination \
                     database name ({target_name})"
                )))
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn restore_inner(
    backend: &dyn ExecutionBackend,
    archive_path: &Path,
    target: &DbParams,
    filestore_dest: Option<&Path>,
    opts: &RestoreOptions,
    reporter: &Reporter,
    cancel: &CancelFlag,
    stage: &mut Stage,
) -> Result<()> {
    *stage = Stage::Preparing;
    reporter.emit_percent(Stage::Preparing, Severity::Info, "inspecting archive", Some(0));

    // Metadata first: a malformed container must fail before the destination
    // is touched, and `open` alone is enough to prove it well-formed.
    let metadata = {
        let path = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || archive::open(&path))
            .await
            .map_err(|e| Error::Execution(format!("archive task failed: {e}")))??
    };
    reporter.stage(
        Stage::Preparing,
        format!(
            "archive of {} taken {}{}",
            metadata.database_name,
            metadata.timestamp.format("%Y-%m-%d %H:%M:%S"),
            match &metadata.odoo_version {
                Some(v) => format!(" (odoo {v})"),
                None => String::new(),
            }
        ),
    );

    let scratch = tempfile::tempdir().map_err(|e| Error::io("scratch", e))?;
    let extracted = {
        let path = archive_path.to_path_buf();
        let scratch_dir = scratch.path().to_path_buf();
        tokio::task::spawn_blocking(move || archive::extract(&path, &scratch_dir))
            .await
            .map_err(|e| Error::Execution(format!("archive task failed: {e}")))??
    };

    cancel.checkpoint(Stage::RestoringDatabase)?;
    *stage = Stage::RestoringDatabase;
    reporter.emit_percent(
        Stage::RestoringDatabase,
        Severity::Info,
        format!("restoring database {}", target.name),
        Some(20),
    );
    restore_database(backend, target, &extracted.database_sql, opts).await?;

    if opts.include_filestore {
        match (&extracted.filestore, filestore_dest) {
            (Some(fs_tar), Some(dest)) => {
                cancel.checkpoint(Stage::RestoringFilestore)?;
                *stage = Stage::RestoringFilestore;
                reporter.emit_percent(
                    Stage::RestoringFilestore,
                    Severity::Info,
                    format!("restoring filestore to {}", dest.display()),
                    Some(60),
                );
                restore_filestore(backend, fs_tar, dest, opts.command_timeout).await?;
            }
            (None, _) => {
                reporter.warn(
                    Stage::RestoringFilestore,
                    "archive contains no filestore entry, skipping",
                );
            }
            (Some(_), None) => {
                reporter.warn(
                    Stage::RestoringFilestore,
                    "no destination filestore path configured, skipping",
                );
            }
        }
    }

    if opts.neutralize {
        cancel.checkpoint(Stage::Neutralizing)?;
        *stage = Stage::Neutralizing;
        reporter.emit_percent(
            Stage::Neutralizing,
            Severity::Info,
            "neutralizing destination database",
            Some(85),
        );
        neutralize(backend, target, reporter, opts.command_timeout).await?;
    }

    Ok(())
}

async fn restore_database(
    backend: &dyn ExecutionBackend,
    target: &DbParams,
    dump: &Path,
    opts: &RestoreOptions,
) -> Result<()> {
    let probe = backend.run(&pg::database_exists(target), 60).await?;
    if !probe.success() {
        return Err(Error::Execution(format!(
            "could not probe for database {}: {}",
            target.name,
            probe.stderr.trim()
        )));
    }
    let exists = probe.stdout.trim() == "1";

    if exists {
        if !opts.overwrite {
            return Err(Error::Validation(format!(
                "destination database {} already exists; pass overwrite to replace it",
                target.name
            )));
        }
        debug!(db = %target.name, "dropping pre-existing destination database");
        let _ = backend.run(&pg::terminate_connections(target), 60).await;
        let dropped = backend.run(&pg::drop_database(target), 300).await?;
        if !dropped.success() {
            return Err(Error::Execution(format!(
                "dropping {} failed: {}",
                target.name,
                dropped.stderr.trim()
            )));
        }
    }

    let created = backend.run(&pg::create_database(target), 300).await?;
    if !created.success() {
        return Err(Error::Execution(format!(
            "creating {} failed: {}",
            target.name,
            created.stderr.trim()
        )));
    }

    let restored = backend
        .run_with_stdin_file(&pg::restore_from_stdin(target), dump, opts.command_timeout)
        .await?;
    if !restored.success() {
        return Err(Error::Execution(format!(
            "psql restore into {} exited with {}: {}",
            target.name,
            restored.exit_code,
            restored.stderr.trim()
        )));
    }
    Ok(())
}

/// Ship the filestore tarball to the backend's machine and unpack it into
/// the destination directory. The tarball entries are relative (`./...`), so
/// the destination name is free to differ from the source's.
async fn restore_filestore(
    backend: &dyn ExecutionBackend,
    fs_tar: &Path,
    dest: &Path,
    timeout: u64,
) -> Result<()> {
    let machine_tmp = format!("/tmp/odoosnap_restore_{}.tar.gz", Utc::now().timestamp());
    backend.write_file(fs_tar, Path::new(&machine_tmp)).await?;

    let dest_quoted = sh_quote(&dest.to_string_lossy());
    let unpack = format!(
        "mkdir -p {dest} && tar -xzf {tmp} -C {dest}",
        dest = dest_quoted,
        tmp = sh_quote(&machine_tmp)
    );
    let out = backend.run(&unpack, timeout).await;
    let _ = backend
        .run(&format!("rm -f {}", sh_quote(&machine_tmp)), 60)
        .await;
    let out = out?;
    if !out.success() {
        return Err(Error::Execution(format!(
            "filestore unpack exited with {}: {}",
            out.exit_code,
            out.stderr.trim()
        )));
    }
    Ok(())
}

/// Run the fixed neutralization sequence. Statements touching tables that do
/// not exist in this Odoo version are skipped with a warning; anything else
/// fails the stage.
async fn neutralize(
    backend: &dyn ExecutionBackend,
    target: &DbParams,
    reporter: &Reporter,
    timeout: u64,
) -> Result<()> {
    for (what, sql) in neutralization_statements() {
        let out = backend.run(&pg::statement(target, &sql), timeout).await?;
        if out.success() {
            reporter.stage(Stage::Neutralizing, what);
        } else if out.stderr.contains("does not exist") {
            warn!(statement = what, "table missing in this version, skipping");
            reporter.warn(Stage::Neutralizing, format!("{what}: table missing, skipped"));
        } else {
            return Err(Error::Execution(format!(
                "neutralization step '{what}' failed: {}",
                out.stderr.trim()
            )));
        }
    }
    Ok(())
}

/// Fused backup-and-restore: dump the source, immediately restore into the
/// destination, and delete the intermediate archive on success (it is kept
/// on failure for diagnosis).
#[allow(clippy::too_many_arguments)]
pub async fn backup_and_restore(
    source_backend: &dyn ExecutionBackend,
    source_db: &DbParams,
    source_filestore: Option<&Path>,
    dest_backend: &dyn ExecutionBackend,
    target: &DbParams,
    dest_filestore: Option<&Path>,
    gate: &SafetyGate,
    backup_opts: &BackupOptions,
    restore_opts: &RestoreOptions,
    reporter: &Reporter,
    cancel: &CancelFlag,
) -> Result<()> {
    // Gate up front: no point dumping the source if the destination will
    // refuse the restore anyway.
    check_gate(gate, &target.name)?;

    let archive_path = backup::backup(
        source_backend,
        source_db,
        source_filestore,
        backup_opts,
        reporter,
        cancel,
    )
    .await?;

    let result = restore(
        dest_backend,
        &archive_path,
        target,
        dest_filestore,
        gate,
        restore_opts,
        reporter,
        cancel,
    )
    .await;

    match result {
        Ok(()) => {
            if let Err(e) = std::fs::remove_file(&archive_path) {
                warn!(path = %archive_path.display(), "could not remove intermediate archive: {e}");
            }
            Ok(())
        }
        Err(e) => {
            reporter.warn(
                Stage::Failed,
                format!(
                    "intermediate archive kept at {} for diagnosis",
                    archive_path.display()
                ),
            );
            Err(e)
        }
    }
}
