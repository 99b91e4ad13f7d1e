use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an operation reaches the machine hosting the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Local,
    Remote,
}

/// A saved connection to one Odoo instance: transport, database and safety
/// flags in a single named record. Engines only ever read these.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    pub name: String,

    // Transport
    pub host: String,
    pub ssh_port: u16,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_key_path: Option<String>,
    pub is_local: bool,

    // Database
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: Option<String>,
    pub db_name: Option<String>,

    pub filestore_path: Option<String>,

    // Safety flags. `allow_restore` defaults to false and must be set
    // explicitly; `is_production` additionally demands a confirmation token
    // before any restore targets the profile.
    pub is_production: bool,
    pub allow_restore: bool,
    pub notes: Option<String>,
}

impl ConnectionProfile {
    pub fn transport(&self) -> Transport {
        if self.is_local {
            Transport::Local
        } else {
            Transport::Remote
        }
    }

    /// A local profile pointing at a database on this machine.
    pub fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: "localhost".to_string(),
            ssh_port: 22,
            ssh_username: None,
            ssh_password: None,
            ssh_key_path: None,
            is_local: true,
            db_host: "localhost".to_string(),
            db_port: 5432,
            db_user: "odoo".to_string(),
            db_password: None,
            db_name: None,
            filestore_path: None,
            is_production: false,
            allow_restore: false,
            notes: None,
        }
    }
}

/// Summary row returned by profile listing; never carries secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub name: String,
    pub host: String,
    pub is_local: bool,
    pub db_name: Option<String>,
    pub is_production: bool,
    pub allow_restore: bool,
}

/// Database connection parameters handed to the dump/restore commands.
#[derive(Debug, Clone)]
pub struct DbParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub name: String,
}

impl DbParams {
    pub fn from_profile(profile: &ConnectionProfile) -> Option<Self> {
        Some(Self {
            host: profile.db_host.clone(),
            port: profile.db_port,
            user: profile.db_user.clone(),
            password: profile.db_password.clone(),
            name: profile.db_name.clone()?,
        })
    }
}

/// Monotonic operation stages. Every operation ends in `Done` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preparing,
    DumpingDatabase,
    DumpingFilestore,
    Packaging,
    RestoringDatabase,
    RestoringFilestore,
    Neutralizing,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preparing => "preparing",
            Stage::DumpingDatabase => "dumping-database",
            Stage::DumpingFilestore => "dumping-filestore",
            Stage::Packaging => "packaging",
            Stage::RestoringDatabase => "restoring-database",
            Stage::RestoringFilestore => "restoring-filestore",
            Stage::Neutralizing => "neutralizing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// One entry in an operation's ordered progress stream.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
    /// Rough completion estimate in percent, when the engine has one.
    pub percent: Option<u8>,
}

/// Descriptor stored as the first archive entry so readers can inspect an
/// archive without streaming the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub timestamp: DateTime<Utc>,
    pub database_name: String,
    pub odoo_version: Option<String>,
    pub includes_filestore: bool,
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Directory the finished archive lands in.
    pub output_dir: std::path::PathBuf,
    /// Per-run timeout for the dump commands, in seconds.
    pub command_timeout: u64,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            output_dir: std::path::PathBuf::from("."),
            command_timeout: 3600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub include_filestore: bool,
    pub neutralize: bool,
    /// Required when the destination database already exists.
    pub overwrite: bool,
    pub command_timeout: u64,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            include_filestore: true,
            neutralize: false,
            overwrite: false,
            command_timeout: 3600,
        }
    }
}

/// Safety flags resolved from the destination profile, checked before any
/// destructive restore step.
#[derive(Debug, Clone, Default)]
pub struct SafetyGate {
    pub allow_restore: bool,
    pub is_production: bool,
    /// Confirmation token for production destinations: the destination
    /// database name, typed back by the caller.
    pub confirmation: Option<String>,
}

impl SafetyGate {
    pub fn from_profile(profile: &ConnectionProfile, confirmation: Option<String>) -> Self {
        Self {
            allow_restore: profile.allow_restore,
            is_production: profile.is_production,
            confirmation,
        }
    }
}
