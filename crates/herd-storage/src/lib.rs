pub mod archive;
pub mod journal;
pub mod ledger;
pub mod snapshot;

pub use archive::TurnArchive;
pub use journal::TextJournal;
pub use ledger::{ConversationLedger, LedgerConfig};
pub use snapshot::{
    FileSnapshotStore, SnapshotStore, SqliteSnapshotStore, StoreBackend, StoreConfig, WriterLease,
};

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

pub const HERD_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("another writer holds {path}")]
    WriterBusy { path: String },
}

pub(crate) fn schema_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

pub(crate) fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let current = schema_version(conn)?;
    if current > HERD_SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: current,
            supported: HERD_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        let sql = include_str!("../migrations/0001_herd_schema.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
    }

    Ok(())
}

/// Opens a connection shared with other processes: WAL so readers never block
/// the writer, and a busy timeout instead of immediate `SQLITE_BUSY`.
pub(crate) fn open_shared(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_millis(2_000))?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    migrate(&conn)?;
    Ok(conn)
}

/// Replaces `path` with `payload` via a sibling temp file and a rename, so a
/// concurrent reader sees either the old or the new content.
pub fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.tmp", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };

    std::fs::write(&temp_path, payload)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_is_idempotent_and_versioned() {
        let conn = Connection::open_in_memory().expect("open db");
        migrate(&conn).expect("first migrate");
        migrate(&conn).expect("second migrate");
        assert_eq!(schema_version(&conn).expect("version"), HERD_SCHEMA_VERSION);
    }

    #[test]
    fn migration_rejects_newer_schema() {
        let conn = Connection::open_in_memory().expect("open db");
        conn.execute("PRAGMA user_version = 9", []).expect("bump");
        let err = migrate(&conn).expect_err("newer schema");
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion { found: 9, .. }
        ));
    }

    #[test]
    fn write_atomic_replaces_content_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("frame.jpg");
        write_atomic(&path, b"first").expect("first write");
        write_atomic(&path, b"second").expect("second write");
        assert_eq!(std::fs::read(&path).expect("read"), b"second");
        assert!(!dir.path().join("nested").join("frame.jpg.tmp").exists());
    }
}
