use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
}

pub fn bootstrap<P: AsRef<Path>>(db_path: P) -> AppResult<DatabaseContext> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "geocoding cache store ready"
    );
    Ok(DatabaseContext { connection })
}

pub fn bootstrap_in_memory() -> AppResult<DatabaseContext> {
    let connection = Connection::open_in_memory()?;
    run_migrations(&connection)?;
    Ok(DatabaseContext { connection })
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

/// Ordered schema steps; `PRAGMA user_version` records how many have run.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS geocoding_cache (
        cache_key TEXT PRIMARY KEY,
        address TEXT NOT NULL,
        service TEXT NOT NULL,
        lat REAL,
        lng REAL,
        created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
        CHECK ((lat IS NULL) = (lng IS NULL))
    );
    "#,
    r#"
    ALTER TABLE geocoding_cache ADD COLUMN region TEXT;
    CREATE INDEX IF NOT EXISTS idx_geocoding_cache_service ON geocoding_cache(service);
    "#,
];

fn run_migrations(connection: &Connection) -> AppResult<()> {
    let applied = schema_version(connection)?;
    if applied > MIGRATIONS.len() {
        return Err(AppError::Config(format!(
            "cache schema version {applied} is newer than supported version {}",
            MIGRATIONS.len()
        )));
    }
    for (step, sql) in MIGRATIONS.iter().enumerate().skip(applied) {
        connection.execute_batch(&format!(
            "BEGIN;\n{sql}\nPRAGMA user_version = {};\nCOMMIT;",
            step + 1
        ))?;
        debug!(target: "database_bootstrap", version = step + 1, "cache schema migrated");
    }
    Ok(())
}

fn schema_version(connection: &Connection) -> AppResult<usize> {
    let version: i64 = connection.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version.max(0) as usize)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}
