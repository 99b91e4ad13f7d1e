use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use odoosnap::backend;
use odoosnap::backup;
use odoosnap::progress::{CancelFlag, Reporter};
use odoosnap::restore;
use odoosnap::store::ProfileStore;
use odoosnap::types::{
    BackupOptions, ConnectionProfile, DbParams, ProgressEvent, RestoreOptions, SafetyGate,
    Severity,
};

#[derive(Parser)]
#[command(
    name = "odoosnap",
    version,
    about = "Backup and restore Odoo instances, locally or over SSH"
)]
struct Cli {
    /// Path to the connection store (defaults to the per-user config dir)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Dump a database (and optionally its filestore) into a .tar.gz archive
    Backup {
        #[command(flatten)]
        conn: ConnArgs,
        /// Directory the archive is written into
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// Skip the filestore even when the profile has one configured
        #[arg(long)]
        no_filestore: bool,
        /// Per-command timeout in seconds
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },
    /// Restore an archive into a destination instance
    Restore {
        #[command(flatten)]
        conn: ConnArgs,
        /// Archive produced by `odoosnap backup`
        #[arg(long)]
        archive: PathBuf,
        /// Apply test-environment neutralization after the restore
        #[arg(long)]
        neutralize: bool,
        /// Skip filestore extraction even when the archive carries one
        #[arg(long)]
        no_filestore: bool,
        /// Drop and recreate the destination database if it already exists
        #[arg(long)]
        overwrite: bool,
        /// Confirm a restore into a production destination by repeating the
        /// destination database name
        #[arg(long, value_name = "DB_NAME")]
        confirm_production: Option<String>,
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },
    /// Backup a source profile and restore it into a destination profile in
    /// one pass; the intermediate archive is deleted on success
    BackupAndRestore {
        /// Source profile name
        #[arg(long)]
        from: String,
        /// Destination profile name
        #[arg(long)]
        to: String,
        #[arg(long)]
        neutralize: bool,
        #[arg(long)]
        no_filestore: bool,
        #[arg(long)]
        overwrite: bool,
        #[arg(long, value_name = "DB_NAME")]
        confirm_production: Option<String>,
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },
    /// Manage saved connection profiles
    Connections {
        #[command(subcommand)]
        command: ConnectionsCommand,
    },
}

/// Either a saved profile or an ad-hoc connection described by flags.
/// Flags override the corresponding profile fields when both are given.
#[derive(Args)]
struct ConnArgs {
    /// Saved profile name
    #[arg(long)]
    profile: Option<String>,
    /// SSH host (omit for a local instance)
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    ssh_port: Option<u16>,
    #[arg(long)]
    ssh_user: Option<String>,
    /// SSH password (prefer --ssh-key or an agent)
    #[arg(long)]
    ssh_password: Option<String>,
    /// Path to an SSH private key
    #[arg(long)]
    ssh_key: Option<String>,
    #[arg(long)]
    db_host: Option<String>,
    #[arg(long)]
    db_port: Option<u16>,
    #[arg(long)]
    db_user: Option<String>,
    #[arg(long)]
    db_password: Option<String>,
    #[arg(long)]
    db_name: Option<String>,
    /// Filestore directory on the target machine
    #[arg(long)]
    filestore: Option<String>,
}

#[derive(Subcommand)]
enum ConnectionsCommand {
    /// Save a new profile
    Save {
        name: String,
        #[command(flatten)]
        conn: ConnArgs,
        /// Mark the profile as production (restores require confirmation)
        #[arg(long)]
        production: bool,
        /// Allow this profile to be a restore destination
        #[arg(long)]
        allow_restore: bool,
        #[arg(long)]
        notes: Option<String>,
    },
    /// List saved profiles
    List,
    /// Delete a profile
    Delete { name: String },
    /// Print all profiles as JSON (passwords are never exported)
    Export,
    /// Import profiles from a JSON export on stdin; existing names are kept
    Import,
}

impl ConnArgs {
    /// Resolve into a full profile: load the named profile if given, then
    /// layer flag overrides on top.
    fn resolve(&self, store: &ProfileStore) -> Result<ConnectionProfile> {
        let mut profile = match &self.profile {
            Some(name) => store
                .get_profile(name)?
                .ok_or_else(|| anyhow!("no profile named '{name}'"))?,
            None => {
                let mut p = ConnectionProfile::local("ad-hoc");
                p.is_local = self.host.is_none();
                p
            }
        };
        if let Some(host) = &self.host {
            profile.host = host.clone();
            profile.is_local = false;
        }
        if let Some(port) = self.ssh_port {
            profile.ssh_port = port;
        }
        if let Some(user) = &self.ssh_user {
            profile.ssh_username = Some(user.clone());
        }
        if let Some(pw) = &self.ssh_password {
            profile.ssh_password = Some(pw.clone());
        }
        if let Some(key) = &self.ssh_key {
            profile.ssh_key_path = Some(key.clone());
        }
        if let Some(host) = &self.db_host {
            profile.db_host = host.clone();
        }
        if let Some(port) = self.db_port {
            profile.db_port = port;
        }
        if let Some(user) = &self.db_user {
            profile.db_user = user.clone();
        }
        if let Some(pw) = &self.db_password {
            profile.db_password = Some(pw.clone());
        }
        if let Some(name) = &self.db_name {
            profile.db_name = Some(name.clone());
        }
        if let Some(fs) = &self.filestore {
            profile.filestore_path = Some(fs.clone());
        }
        Ok(profile)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let store_path = cli.store.clone().unwrap_or_else(ProfileStore::default_path);
    let store = ProfileStore::open(&store_path)
        .with_context(|| format!("opening connection store at {}", store_path.display()))?;

    match cli.command {
        CliCommand::Backup {
            conn,
            output_dir,
            no_filestore,
            timeout,
        } => {
            let profile = conn.resolve(&store)?;
            let db = DbParams::from_profile(&profile)
                .ok_or_else(|| anyhow!("no database name configured; pass --db-name"))?;
            let filestore = if no_filestore {
                None
            } else {
                profile.filestore_path.clone().map(PathBuf::from)
            };
            let opts = BackupOptions {
                output_dir,
                command_timeout: timeout,
            };

            let backend = backend::connect(&profile).await?;
            let (reporter, events) = Reporter::channel();
            let cancel = arm_ctrl_c();
            let printer = tokio::spawn(print_events(events));

            let result = backup::backup(
                backend.as_ref(),
                &db,
                filestore.as_deref(),
                &opts,
                &reporter,
                &cancel,
            )
            .await;

            drop(reporter);
            let failed = printer.await.ok().flatten();
            let path = finish(result, failed)?;
            info!("archive: {}", path.display());
        }
        CliCommand::Restore {
            conn,
            archive,
            neutralize,
            no_filestore,
            overwrite,
            confirm_production,
            timeout,
        } => {
            let profile = conn.resolve(&store)?;
            let db = DbParams::from_profile(&profile).ok_or_else(|| {
                anyhow!("no destination database name configured; pass --db-name")
            })?;
            let filestore = if no_filestore {
                None
            } else {
                profile.filestore_path.clone().map(PathBuf::from)
            };
            let gate = SafetyGate::from_profile(&profile, confirm_production);
            let opts = RestoreOptions {
                include_filestore: !no_filestore,
                neutralize,
                overwrite,
                command_timeout: timeout,
            };

            let backend = backend::connect(&profile).await?;
            let (reporter, events) = Reporter::channel();
            let cancel = arm_ctrl_c();
            let printer = tokio::spawn(print_events(events));

            let result = restore::restore(
                backend.as_ref(),
                &archive,
                &db,
                filestore.as_deref(),
                &gate,
                &opts,
                &reporter,
                &cancel,
            )
            .await;

            drop(reporter);
            let failed = printer.await.ok().flatten();
            finish(result, failed)?;
        }
        CliCommand::BackupAndRestore {
            from,
            to,
            neutralize,
            no_filestore,
            overwrite,
            confirm_production,
            timeout,
        } => {
            let source = store
                .get_profile(&from)?
                .ok_or_else(|| anyhow!("no profile named '{from}'"))?;
            let dest = store
                .get_profile(&to)?
                .ok_or_else(|| anyhow!("no profile named '{to}'"))?;
            let source_db = DbParams::from_profile(&source)
                .ok_or_else(|| anyhow!("profile '{from}' has no database name"))?;
            let dest_db = DbParams::from_profile(&dest)
                .ok_or_else(|| anyhow!("profile '{to}' has no database name"))?;
            let source_fs = if no_filestore {
                None
            } else {
                source.filestore_path.clone().map(PathBuf::from)
            };
            let dest_fs = if no_filestore {
                None
            } else {
                dest.filestore_path.clone().map(PathBuf::from)
            };
            let gate = SafetyGate::from_profile(&dest, confirm_production);
            let backup_opts = BackupOptions {
                output_dir: std::env::temp_dir(),
                command_timeout: timeout,
            };
            let restore_opts = RestoreOptions {
                include_filestore: !no_filestore,
                neutralize,
                overwrite,
                command_timeout: timeout,
            };

            let source_backend = backend::connect(&source).await?;
            let dest_backend = backend::connect(&dest).await?;
            let (reporter, events) = Reporter::channel();
            let cancel = arm_ctrl_c();
            let printer = tokio::spawn(print_events(events));

            let result = restore::backup_and_restore(
                source_backend.as_ref(),
                &source_db,
                source_fs.as_deref(),
                dest_backend.as_ref(),
                &dest_db,
                dest_fs.as_deref(),
                &gate,
                &backup_opts,
                &restore_opts,
                &reporter,
                &cancel,
            )
            .await;

            drop(reporter);
            let failed = printer.await.ok().flatten();
            finish(result, failed)?;
        }
        CliCommand::Connections { command } => match command {
            ConnectionsCommand::Save {
                name,
                conn,
                production,
                allow_restore,
                notes,
            } => {
                let mut profile = conn.resolve(&store)?;
                profile.name = name.clone();
                profile.is_production = production;
                profile.allow_restore = allow_restore;
                profile.notes = notes;
                store.save_profile(&profile)?;
                info!("saved profile '{name}'");
            }
            ConnectionsCommand::List => {
                let profiles = store.list_profiles()?;
                if profiles.is_empty() {
                    info!("no saved profiles");
                }
                for p in profiles {
                    let target = if p.is_local {
                        "local".to_string()
                    } else {
                        p.host.clone()
                    };
                    let mut flags = Vec::new();
                    if p.is_production {
                        flags.push("production");
                    }
                    if p.allow_restore {
                        flags.push("restore-ok");
                    }
                    println!(
                        "{:<20} {:<24} {:<16} {}",
                        p.name,
                        target,
                        p.db_name.as_deref().unwrap_or("-"),
                        flags.join(",")
                    );
                }
            }
            ConnectionsCommand::Delete { name } => {
                if store.delete_profile(&name)? {
                    info!("deleted profile '{name}'");
                } else {
                    bail!("no profile named '{name}'");
                }
            }
            ConnectionsCommand::Export => {
                println!("{}", store.export_json()?);
            }
            ConnectionsCommand::Import => {
                let mut json = String::new();
                use std::io::Read;
                std::io::stdin()
                    .read_to_string(&mut json)
                    .context("reading export from stdin")?;
                let report = store.import_json(&json)?;
                info!("imported {} profile(s)", report.imported);
                for name in report.skipped {
                    warn!("skipped '{name}': a profile with that name already exists");
                }
            }
        },
    }

    store.close()?;
    Ok(())
}

/// Map an engine failure to the process exit path. The final line names the
/// failing stage, taken from the operation's `Failed` event when one was
/// emitted (gate and setup failures happen before any event).
fn finish<T>(result: odoosnap::Result<T>, failed: Option<String>) -> Result<T> {
    result.map_err(|e| {
        let line = failed.unwrap_or_else(|| e.to_string());
        error!("{} error: {line}", e.kind());
        anyhow::Error::new(e).context(line)
    })
}

/// Cancel the running operation on the first Ctrl-C; the engines stop at
/// the next stage boundary.
fn arm_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested, stopping at the next stage boundary");
            flag.cancel();
        }
    });
    cancel
}

/// Render progress events as log lines; returns the message of the final
/// `Failed` event, if any, so the exit path can repeat the failing stage.
async fn print_events(
    mut events: tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>,
) -> Option<String> {
    let mut failed = None;
    while let Some(event) = events.recv().await {
        let line = match event.percent {
            Some(p) => format!("[{}] {} ({p}%)", event.stage, event.message),
            None => format!("[{}] {}", event.stage, event.message),
        };
        match event.severity {
            Severity::Info | Severity::Success => info!("{line}"),
            Severity::Warning => warn!("{line}"),
            Severity::Error => error!("{line}"),
        }
        if event.stage == odoosnap::types::Stage::Failed {
            failed = Some(event.message);
        }
    }
    failed
}
