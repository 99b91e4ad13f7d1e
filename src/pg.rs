//! Command-line builders for the PostgreSQL client utilities the engines
//! drive through an `ExecutionBackend`. The core never links a database
//! driver; `pg_dump`, `psql`, `createdb` and `dropdb` are black boxes.

use crate::backend::sh_quote;
use crate::types::DbParams;

fn base_flags(db: &DbParams) -> String {
    format!(
        "-h {} -p {} -U {}",
        sh_quote(&db.host),
        db.port,
        sh_quote(&db.user)
    )
}

/// `PGPASSWORD=...` prefix, or empty when no password is configured (peer
/// auth, .pgpass and friends).
fn env_prefix(db: &DbParams) -> String {
    match &db.password {
        Some(password) => format!("PGPASSWORD={} ", sh_quote(password)),
        None => String::new(),
    }
}

/// Plain-SQL dump to stdout. `--no-owner` keeps the dump restorable under a
/// different role on the destination.
pub fn dump(db: &DbParams) -> String {
    format!(
        "{}pg_dump {} --no-owner --format=plain {}",
        env_prefix(db),
        base_flags(db),
        sh_quote(&db.name)
    )
}

/// Restore a plain-SQL dump from stdin into an existing database.
pub fn restore_from_stdin(db: &DbParams) -> String {
    format!(
        "{}psql {} -v ON_ERROR_STOP=1 -q -d {}",
        env_prefix(db),
        base_flags(db),
        sh_quote(&db.name)
    )
}

/// Run one SQL statement against the database, stopping on error.
pub fn statement(db: &DbParams, sql: &str) -> String {
    format!(
        "{}psql {} -v ON_ERROR_STOP=1 -qAt -d {} -c {}",
        env_prefix(db),
        base_flags(db),
        sh_quote(&db.name),
        sh_quote(sql)
    )
}

/// Prints `1` when the database exists; runs against the maintenance DB.
pub fn database_exists(db: &DbParams) -> String {
    let probe = format!(
        "SELECT 1 FROM pg_database WHERE datname = '{}'",
        sql_escape(&db.name)
    );
    format!(
        "{}psql {} -qAt -d postgres -c {}",
        env_prefix(db),
        base_flags(db),
        sh_quote(&probe)
    )
}

pub fn create_database(db: &DbParams) -> String {
    format!(
        "{}createdb {} {}",
        env_prefix(db),
        base_flags(db),
        sh_quote(&db.name)
    )
}

pub fn drop_database(db: &DbParams) -> String {
    format!(
        "{}dropdb {} --if-exists {}",
        env_prefix(db),
        base_flags(db),
        sh_quote(&db.name)
    )
}

/// Kick every session off the database so a drop cannot hang on open
/// connections.
pub fn terminate_connections(db: &DbParams) -> String {
    let sql = format!(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = '{}' AND pid <> pg_backend_pid()",
        sql_escape(&db.name)
    );
    format!(
        "{}psql {} -qAt -d postgres -c {}",
        env_prefix(db),
        base_flags(db),
        sh_quote(&sql)
    )
}

/// Best-effort query for the installed Odoo base-module version.
pub fn odoo_version(db: &DbParams) -> String {
    statement(
        db,
        "SELECT latest_version FROM ir_module_module WHERE name = 'base'",
    )
}

/// Escape a value for inclusion inside a single-quoted SQL literal.
pub fn sql_escape(value: &str) -> String {
    value.replace('\'', "''")
}
