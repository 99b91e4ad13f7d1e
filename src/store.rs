//! Persisted connection-profile registry and process settings, one SQLite
//! file with an explicit open/close lifecycle so tests can construct
//! isolated instances instead of sharing an ambient singleton. Secrets are
//! encrypted with the machine-bound cipher before they hit disk.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::secrets::SecretBox;
use crate::types::{ConnectionProfile, ProfileSummary};

/// Settings keys the excluded GUI layer reads and writes. The core only
/// provides the generic key/value surface.
pub mod settings_keys {
    pub const DARK_MODE: &str = "dark_mode";
    pub const FONT_SIZE: &str = "font_size";
    pub const BACKUP_DIRECTORY: &str = "backup_directory";
    pub const WINDOW_GEOMETRY: &str = "window_geometry";
    pub const SASH_POSITION: &str = "sash_position";
    pub const LAST_TAB: &str = "last_tab";
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS profiles (
    name            TEXT PRIMARY KEY,
    host            TEXT NOT NULL DEFAULT 'localhost',
    ssh_port        INTEGER NOT NULL DEFAULT 22,
    ssh_username    TEXT,
    ssh_password    TEXT,
    ssh_key_path    TEXT,
    is_local        INTEGER NOT NULL DEFAULT 0,
    db_host         TEXT NOT NULL DEFAULT 'localhost',
    db_port         INTEGER NOT NULL DEFAULT 5432,
    db_user         TEXT NOT NULL DEFAULT 'odoo',
    db_password     TEXT,
    db_name         TEXT,
    filestore_path  TEXT,
    is_production   INTEGER NOT NULL DEFAULT 0,
    allow_restore   INTEGER NOT NULL DEFAULT 0,
    notes           TEXT,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS settings (
    key        TEXT PRIMARY KEY,
    value      TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// Profile fields that survive export. Secret fields are omitted entirely;
/// they never round-trip through import/export, even encrypted.
#[derive(Debug, Serialize, Deserialize)]
struct ExportedProfile {
    name: String,
    host: String,
    ssh_port: u16,
    ssh_username: Option<String>,
    ssh_key_path: Option<String>,
    is_local: bool,
    db_host: String,
    db_port: u16,
    db_user: String,
    db_name: Option<String>,
    filestore_path: Option<String>,
    is_production: bool,
    allow_restore: bool,
    notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportFile {
    version: String,
    profiles: Vec<ExportedProfile>,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: Vec<String>,
}

pub struct ProfileStore {
    conn: Connection,
    secrets: SecretBox,
}

impl ProfileStore {
    /// Open (creating if needed) the store at `path` with the machine-bound
    /// cipher.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_secrets(path, SecretBox::machine_bound())
    }

    /// Open with an explicit cipher; tests use this for deterministic keys.
    pub fn open_with_secrets(path: &Path, secrets: SecretBox) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, secrets })
    }

    /// Default store location: `$XDG_CONFIG_HOME/odoosnap/connections.db`.
    pub fn default_path() -> PathBuf {
        let config_home = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".config")
            });
        config_home.join("odoosnap").join("connections.db")
    }

    /// Flush and close. Every mutation is committed as it happens, so this
    /// exists for the explicit-lifecycle contract rather than durability.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| Error::Store(e))
    }

    pub fn save_profile(&self, profile: &ConnectionProfile) -> Result<()> {
        let ssh_password = self.encrypt_opt(profile.ssh_password.as_deref())?;
        let db_password = self.encrypt_opt(profile.db_password.as_deref())?;

        let result = self.conn.execute(
            "INSERT INTO profiles (
                name, host, ssh_port, ssh_username, ssh_password, ssh_key_path,
                is_local, db_host, db_port, db_user, db_password, db_name,
                filestore_path, is_production, allow_restore, notes
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                profile.name,
                profile.host,
                profile.ssh_port,
                profile.ssh_username,
                ssh_password,
                profile.ssh_key_path,
                profile.is_local,
                profile.db_host,
                profile.db_port,
                profile.db_user,
                db_password,
                profile.db_name,
                profile.filestore_path,
                profile.is_production,
                profile.allow_restore,
                profile.notes,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::Validation(format!(
                    "a profile named '{}' already exists",
                    profile.name
                )))
            }
            Err(e) => Err(Error::Store(e)),
        }
    }

    pub fn update_profile(&self, profile: &ConnectionProfile) -> Result<bool> {
        let ssh_password = self.encrypt_opt(profile.ssh_password.as_deref())?;
        let db_password = self.encrypt_opt(profile.db_password.as_deref())?;

        let changed = self.conn.execute(
            "UPDATE profiles SET
                host = ?2, ssh_port = ?3, ssh_username = ?4, ssh_password = ?5,
                ssh_key_path = ?6, is_local = ?7, db_host = ?8, db_port = ?9,
                db_user = ?10, db_password = ?11, db_name = ?12,
                filestore_path = ?13, is_production = ?14, allow_restore = ?15,
                notes = ?16, updated_at = datetime('now')
             WHERE name = ?1",
            params![
                profile.name,
                profile.host,
                profile.ssh_port,
                profile.ssh_username,
                ssh_password,
                profile.ssh_key_path,
                profile.is_local,
                profile.db_host,
                profile.db_port,
                profile.db_user,
                db_password,
                profile.db_name,
                profile.filestore_path,
                profile.is_production,
                profile.allow_restore,
                profile.notes,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_profile(&self, name: &str) -> Result<Option<ConnectionProfile>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, host, ssh_port, ssh_username, ssh_password, ssh_key_path,
                        is_local, db_host, db_port, db_user, db_password, db_name,
                        filestore_path, is_production, allow_restore, notes
                 FROM profiles WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        ConnectionProfile {
                            name: row.get(0)?,
                            host: row.get(1)?,
                            ssh_port: row.get(2)?,
                            ssh_username: row.get(3)?,
                            ssh_password: None,
                            ssh_key_path: row.get(5)?,
                            is_local: row.get(6)?,
                            db_host: row.get(7)?,
                            db_port: row.get(8)?,
                            db_user: row.get(9)?,
                            db_password: None,
                            db_name: row.get(11)?,
                            filestore_path: row.get(12)?,
                            is_production: row.get(13)?,
                            allow_restore: row.get(14)?,
                            notes: row.get(15)?,
                        },
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(mut profile, ssh_ct, db_ct)| {
            // Undecryptable secrets (store copied from another machine)
            // degrade to None instead of failing the lookup.
            profile.ssh_password = ssh_ct.and_then(|ct| self.secrets.decrypt(&ct));
            profile.db_password = db_ct.and_then(|ct| self.secrets.decrypt(&ct));
            profile
        }))
    }

    pub fn list_profiles(&self) -> Result<Vec<ProfileSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, host, is_local, db_name, is_production, allow_restore
             FROM profiles ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ProfileSummary {
                name: row.get(0)?,
                host: row.get(1)?,
                is_local: row.get(2)?,
                db_name: row.get(3)?,
                is_production: row.get(4)?,
                allow_restore: row.get(5)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::Store)
    }

    pub fn delete_profile(&self, name: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM profiles WHERE name = ?1", params![name])?;
        Ok(changed > 0)
    }

    /// Export every profile as JSON, secret fields omitted entirely.
    pub fn export_json(&self) -> Result<String> {
        let mut stmt = self.conn.prepare(
            "SELECT name, host, ssh_port, ssh_username, ssh_key_path, is_local,
                    db_host, db_port, db_user, db_name, filestore_path,
                    is_production, allow_restore, notes
             FROM profiles ORDER BY name",
        )?;
        let profiles = stmt
            .query_map([], |row| {
                Ok(ExportedProfile {
                    name: row.get(0)?,
                    host: row.get(1)?,
                    ssh_port: row.get(2)?,
                    ssh_username: row.get(3)?,
                    ssh_key_path: row.get(4)?,
                    is_local: row.get(5)?,
                    db_host: row.get(6)?,
                    db_port: row.get(7)?,
                    db_user: row.get(8)?,
                    db_name: row.get(9)?,
                    filestore_path: row.get(10)?,
                    is_production: row.get(11)?,
                    allow_restore: row.get(12)?,
                    notes: row.get(13)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let export = ExportFile {
            version: "1".to_string(),
            profiles,
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Import profiles from an export. Existing names are skipped, never
    /// overwritten; passwords are absent from exports so imported profiles
    /// start without secrets.
    pub fn import_json(&self, json: &str) -> Result<ImportReport> {
        let export: ExportFile = serde_json::from_str(json)
            .map_err(|e| Error::Validation(format!("invalid profile export: {e}")))?;

        let mut report = ImportReport::default();
        for p in export.profiles {
            let profile = ConnectionProfile {
                name: p.name.clone(),
                host: p.host,
                ssh_port: p.ssh_port,
                ssh_username: p.ssh_username,
                ssh_password: None,
                ssh_key_path: p.ssh_key_path,
                is_local: p.is_local,
                db_host: p.db_host,
                db_port: p.db_port,
                db_user: p.db_user,
                db_password: None,
                db_name: p.db_name,
                filestore_path: p.filestore_path,
                is_production: p.is_production,
                allow_restore: p.allow_restore,
                notes: p.notes,
            };
            match self.save_profile(&profile) {
                Ok(()) => report.imported += 1,
                Err(Error::Validation(_)) => report.skipped.push(p.name),
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::Store)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        if key == settings_keys::FONT_SIZE {
            let size: u32 = value
                .parse()
                .map_err(|_| Error::Validation(format!("font size '{value}' is not a number")))?;
            if !(8..=18).contains(&size) {
                return Err(Error::Validation(format!(
                    "font size {size} out of range (8-18)"
                )));
            }
        }
        self.conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    fn encrypt_opt(&self, value: Option<&str>) -> Result<Option<String>> {
        match value {
            Some(v) if !v.is_empty() => Ok(Some(self.secrets.encrypt(v)?)),
            _ => Ok(None),
        }
    }
}
