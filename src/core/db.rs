use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::ModguardError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::ModguardError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::ModguardError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::ModguardError::RusqliteError)?;
    Ok(conn)
}

pub fn event_store_path(root: &Path) -> PathBuf {
    root.join(schemas::EVENT_STORE_DB_NAME)
}

pub fn initialize_event_store(root: &Path) -> Result<(), error::ModguardError> {
    fs::create_dir_all(root).map_err(error::ModguardError::IoError)?;
    let db_path = event_store_path(root);
    let conn = db_connect(&db_path.to_string_lossy())?;
    conn.execute(schemas::EVENTS_SCHEMA, [])?;
    conn.execute(schemas::DELIVERIES_SCHEMA, [])?;
    conn.execute(schemas::DELIVERIES_LISTENER_INDEX, [])?;
    conn.execute(schemas::DELIVERIES_EVENT_INDEX, [])?;
    Ok(())
}

// The event store owns its schema and initialization. The queue storage is
// deliberately the only durable state in the crate; analysis runs are pure.
