use std::path::Path;

use odoosnap::archive;
use odoosnap::backend::{CommandOutput, MockExecutionBackend};
use odoosnap::backup::backup;
use odoosnap::progress::{CancelFlag, Reporter};
use odoosnap::types::{BackupOptions, DbParams, Severity, Stage};
use odoosnap::Error;

fn demo_db() -> DbParams {
    DbParams {
        host: "localhost".to_string(),
        port: 5432,
        user: "odoo".to_string(),
        password: Some("secret".to_string()),
        name: "demo".to_string(),
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[tokio::test]
async fn backup_without_filestore_produces_archive() {
    let mut mock = MockExecutionBackend::new();

    mock.expect_run_to_file()
        .withf(|cmd: &str, _dest: &Path, _t: &u64| cmd.contains("pg_dump") && cmd.contains("demo"))
        .times(1)
        .returning(|_, dest, _| {
            std::fs::write(dest, "-- PostgreSQL database dump\nCREATE TABLE t ();\n").unwrap();
            Ok(ok(""))
        });
    // Version discovery queries ir_module_module.
    mock.expect_run()
        .withf(|cmd: &str, _t: &u64| cmd.contains("ir_module_module"))
        .times(1)
        .returning(|_, _| Ok(ok("17.0.1.3\n")));

    let out_dir = tempfile::tempdir().unwrap();
    let opts = BackupOptions {
        output_dir: out_dir.path().to_path_buf(),
        command_timeout: 60,
    };
    let (reporter, mut events) = Reporter::channel();
    let cancel = CancelFlag::new();

    let path = backup(&mock, &demo_db(), None, &opts, &reporter, &cancel)
        .await
        .unwrap();
    drop(reporter);

    let file_name = path.file_name().unwrap().to_string_lossy().to_string();
    assert!(file_name.starts_with("backup_demo_"));
    assert!(file_name.ends_with(".tar.gz"));
    assert!(path.exists());

    let metadata = archive::open(&path).unwrap();
    assert_eq!(metadata.database_name, "demo");
    assert_eq!(metadata.odoo_version.as_deref(), Some("17.0.1.3"));
    assert!(!metadata.includes_filestore);

    let mut stages = Vec::new();
    while let Ok(event) = events.try_recv() {
        stages.push(event.stage);
    }
    assert_eq!(stages.first(), Some(&Stage::Preparing));
    assert_eq!(stages.last(), Some(&Stage::Done));
    assert!(stages.contains(&Stage::DumpingDatabase));
    assert!(!stages.contains(&Stage::DumpingFilestore));
}

#[tokio::test]
async fn backup_with_filestore_pulls_tarball_through_backend() {
    let mut mock = MockExecutionBackend::new();

    mock.expect_dir_exists()
        .withf(|p: &Path| p == Path::new("/var/lib/odoo/filestore/demo"))
        .times(1)
        .returning(|_| Ok(true));
    mock.expect_run_to_file()
        .withf(|cmd: &str, _dest: &Path, _t: &u64| cmd.contains("pg_dump"))
        .times(1)
        .returning(|_, dest, _| {
            std::fs::write(dest, "CREATE TABLE t ();\n").unwrap();
            Ok(ok(""))
        });
    mock.expect_run()
        .withf(|cmd: &str, _t: &u64| cmd.starts_with("tar -czf"))
        .times(1)
        .returning(|_, _| Ok(ok("")));
    mock.expect_read_file()
        .withf(|src: &Path, _dest: &Path| src.to_string_lossy().starts_with("/tmp/odoosnap_fs_demo_"))
        .times(1)
        .returning(|_, dest| {
            std::fs::write(dest, b"filestore tarball bytes").unwrap();
            Ok(())
        });
    // The machine-side temp tarball is removed after the fetch.
    mock.expect_run()
        .withf(|cmd: &str, _t: &u64| cmd.starts_with("rm -f"))
        .times(1)
        .returning(|_, _| Ok(ok("")));
    mock.expect_run()
        .withf(|cmd: &str, _t: &u64| cmd.contains("ir_module_module"))
        .times(1)
        .returning(|_, _| Ok(failed(1, "psql: connection refused")));

    let out_dir = tempfile::tempdir().unwrap();
    let opts = BackupOptions {
        output_dir: out_dir.path().to_path_buf(),
        command_timeout: 60,
    };
    let (reporter, _events) = Reporter::channel();
    let cancel = CancelFlag::new();

    let path = backup(
        &mock,
        &demo_db(),
        Some(Path::new("/var/lib/odoo/filestore/demo")),
        &opts,
        &reporter,
        &cancel,
    )
    .await
    .unwrap();

    let metadata = archive::open(&path).unwrap();
    assert!(metadata.includes_filestore);
    // Version discovery failure is tolerated.
    assert!(metadata.odoo_version.is_none());

    let scratch = tempfile::tempdir().unwrap();
    let extracted = archive::extract(&path, scratch.path()).unwrap();
    let fs_tar = extracted.filestore.unwrap();
    assert_eq!(std::fs::read(fs_tar).unwrap(), b"filestore tarball bytes");
}

#[tokio::test]
async fn failed_dump_leaves_no_archive_and_names_the_stage() {
    let mut mock = MockExecutionBackend::new();
    mock.expect_run_to_file()
        .times(1)
        .returning(|_, _, _| Ok(failed(1, "pg_dump: error: connection to server failed")));

    let out_dir = tempfile::tempdir().unwrap();
    let opts = BackupOptions {
        output_dir: out_dir.path().to_path_buf(),
        command_timeout: 60,
    };
    let (reporter, mut events) = Reporter::channel();
    let cancel = CancelFlag::new();

    let err = backup(&mock, &demo_db(), None, &opts, &reporter, &cancel)
        .await
        .unwrap_err();
    drop(reporter);

    assert!(matches!(err, Error::Execution(_)));
    assert!(std::fs::read_dir(out_dir.path()).unwrap().next().is_none());

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.stage, Stage::Failed);
    assert_eq!(last.severity, Severity::Error);
    assert!(last.message.contains("dumping-database"));
}

#[tokio::test]
async fn failed_filestore_tar_leaves_no_archive_and_names_the_stage() {
    let mut mock = MockExecutionBackend::new();
    mock.expect_dir_exists().times(1).returning(|_| Ok(true));
    mock.expect_run_to_file()
        .times(1)
        .returning(|_, dest, _| {
            std::fs::write(dest, "CREATE TABLE t ();\n").unwrap();
            Ok(ok(""))
        });
    mock.expect_run()
        .withf(|cmd: &str, _t: &u64| cmd.starts_with("tar -czf"))
        .times(1)
        .returning(|_, _| Ok(failed(2, "tar: /var/lib/odoo/filestore/demo: Permission denied")));

    let out_dir = tempfile::tempdir().unwrap();
    let opts = BackupOptions {
        output_dir: out_dir.path().to_path_buf(),
        command_timeout: 60,
    };
    let (reporter, mut events) = Reporter::channel();

    let err = backup(
        &mock,
        &demo_db(),
        Some(Path::new("/var/lib/odoo/filestore/demo")),
        &opts,
        &reporter,
        &CancelFlag::new(),
    )
    .await
    .unwrap_err();
    drop(reporter);

    assert!(matches!(err, Error::Execution(_)));
    assert!(std::fs::read_dir(out_dir.path()).unwrap().next().is_none());

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.stage, Stage::Failed);
    assert!(last.message.contains("dumping-filestore"));
}

#[tokio::test]
async fn failed_packaging_leaves_no_archive_and_names_the_stage() {
    let mut mock = MockExecutionBackend::new();
    mock.expect_dir_exists().times(1).returning(|_| Ok(true));
    mock.expect_run_to_file()
        .times(1)
        .returning(|_, dest, _| {
            std::fs::write(dest, "CREATE TABLE t ();\n").unwrap();
            Ok(ok(""))
        });
    mock.expect_run()
        .withf(|cmd: &str, _t: &u64| cmd.starts_with("tar -czf"))
        .times(1)
        .returning(|_, _| Ok(ok("")));
    // Fetch claims success but delivers nothing, so packaging finds no
    // filestore tarball to append.
    mock.expect_read_file().times(1).returning(|_, _| Ok(()));
    mock.expect_run()
        .withf(|cmd: &str, _t: &u64| cmd.starts_with("rm -f"))
        .times(1)
        .returning(|_, _| Ok(ok("")));
    mock.expect_run()
        .withf(|cmd: &str, _t: &u64| cmd.contains("ir_module_module"))
        .times(1)
        .returning(|_, _| Ok(ok("17.0.1.3\n")));

    let out_dir = tempfile::tempdir().unwrap();
    let opts = BackupOptions {
        output_dir: out_dir.path().to_path_buf(),
        command_timeout: 60,
    };
    let (reporter, mut events) = Reporter::channel();

    let err = backup(
        &mock,
        &demo_db(),
        Some(Path::new("/var/lib/odoo/filestore/demo")),
        &opts,
        &reporter,
        &CancelFlag::new(),
    )
    .await
    .unwrap_err();
    drop(reporter);

    assert!(err.kind() == "archive" || err.kind() == "io");
    assert!(std::fs::read_dir(out_dir.path()).unwrap().next().is_none());

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.stage, Stage::Failed);
    assert!(last.message.contains("packaging"));
}

#[tokio::test]
async fn missing_filestore_directory_fails_before_any_dump() {
    let mut mock = MockExecutionBackend::new();
    mock.expect_dir_exists().times(1).returning(|_| Ok(false));
    // No run_to_file expectation: the dump must never start.

    let out_dir = tempfile::tempdir().unwrap();
    let opts = BackupOptions {
        output_dir: out_dir.path().to_path_buf(),
        command_timeout: 60,
    };
    let (reporter, _events) = Reporter::channel();

    let err = backup(
        &mock,
        &demo_db(),
        Some(Path::new("/nonexistent/filestore")),
        &opts,
        &reporter,
        &CancelFlag::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn pre_cancelled_flag_stops_before_the_dump() {
    let mock = MockExecutionBackend::new();
    let out_dir = tempfile::tempdir().unwrap();
    let opts = BackupOptions {
        output_dir: out_dir.path().to_path_buf(),
        command_timeout: 60,
    };
    let (reporter, _events) = Reporter::channel();
    let cancel = CancelFlag::new();
    cancel.cancel();

    let err = backup(&mock, &demo_db(), None, &opts, &reporter, &cancel)
        .await
        .unwrap_err();
    match err {
        Error::Execution(msg) => assert!(msg.contains("cancelled before dumping-database")),
        other => panic!("unexpected error: {other}"),
    }
}
