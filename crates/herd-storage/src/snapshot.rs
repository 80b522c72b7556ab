use crate::{migrate, open_shared, write_atomic, StorageError};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use herd_core::{AnalysisSnapshot, SnapshotStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const DEFAULT_SNAPSHOT_FILE: &str = "herd_analysis.json";
pub const DEFAULT_SNAPSHOT_DB: &str = "herd_analysis.sqlite3";

/// Single-slot, last-write-wins record of the latest analysis.
///
/// `read` never fails: an absent or unreadable slot comes back as a
/// `Disconnected` snapshot.
pub trait SnapshotStore: Send + Sync {
    fn publish(&self, snapshot: &AnalysisSnapshot) -> Result<(), StorageError>;
    fn read(&self) -> AnalysisSnapshot;
    fn reset(&self) -> Result<(), StorageError>;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    File,
    Sqlite,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::File => "file",
            StoreBackend::Sqlite => "sqlite",
        }
    }

    pub fn default_path(&self) -> &'static str {
        match self {
            StoreBackend::File => DEFAULT_SNAPSHOT_FILE,
            StoreBackend::Sqlite => DEFAULT_SNAPSHOT_DB,
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "file" | "json" => Ok(StoreBackend::File),
            "sqlite" | "db" => Ok(StoreBackend::Sqlite),
            other => Err(format!("Unknown store backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl StoreConfig {
    pub fn new(backend: StoreBackend, path: Option<PathBuf>) -> Self {
        let path = path
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from(backend.default_path()));
        Self { backend, path }
    }

    pub fn open(&self) -> Result<Arc<dyn SnapshotStore>, StorageError> {
        Ok(match self.backend {
            StoreBackend::File => Arc::new(FileSnapshotStore::new(&self.path)),
            StoreBackend::Sqlite => Arc::new(SqliteSnapshotStore::open(&self.path)?),
        })
    }
}

/// JSON document replaced by temp-file + rename on every publish.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        match self.path.file_name() {
            Some(name) => self
                .path
                .with_file_name(format!("{}.lock", name.to_string_lossy())),
            None => self.path.with_extension("lock"),
        }
    }

    /// Takes the advisory writer lock for this slot. Held until the lease drops.
    pub fn claim_writer(&self) -> Result<WriterLease, StorageError> {
        WriterLease::try_acquire(&self.lock_path())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn publish(&self, snapshot: &AnalysisSnapshot) -> Result<(), StorageError> {
        let payload = serde_json::to_vec_pretty(snapshot)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        write_atomic(&self.path, &payload)?;
        debug!(
            event = "snapshot_published",
            path = %self.path.display(),
            status = %snapshot.status,
            sample_index = snapshot.sample_index
        );
        Ok(())
    }

    fn read(&self) -> AnalysisSnapshot {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return AnalysisSnapshot::disconnected(None)
            }
            Err(err) => {
                warn!(event = "snapshot_unreadable", path = %self.path.display(), error = %err);
                return AnalysisSnapshot::disconnected(Some(&err.to_string()));
            }
        };
        match serde_json::from_slice::<AnalysisSnapshot>(&raw) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(event = "snapshot_corrupt", path = %self.path.display(), error = %err);
                AnalysisSnapshot::disconnected(Some(&format!("unreadable record: {err}")))
            }
        }
    }

    fn reset(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

pub struct WriterLease {
    file: File,
    path: PathBuf,
}

impl WriterLease {
    fn try_acquire(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::WriterBusy {
                path: path.display().to_string(),
            });
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// One-row table upserted in a single statement.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
    label: String,
}

impl SqliteSnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = open_shared(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            label: format!("sqlite:{}", path.display()),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            label: "sqlite::memory:".to_string(),
        })
    }

    fn load(&self) -> Result<Option<AnalysisSnapshot>, StorageError> {
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let row = conn
            .query_row(
                "SELECT ts, analysis, sample_index, status FROM analysis_snapshot WHERE slot = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((ts, analysis, sample_index, status)) = row else {
            return Ok(None);
        };

        let timestamp = DateTime::parse_from_rfc3339(&ts)
            .map_err(|err| StorageError::Timestamp(err.to_string()))?
            .with_timezone(&Utc);
        let status = status
            .parse::<SnapshotStatus>()
            .map_err(StorageError::Serialization)?;
        let sample_index = u64::try_from(sample_index)
            .map_err(|_| StorageError::Serialization(format!("negative sample index {sample_index}")))?;

        Ok(Some(AnalysisSnapshot::new(
            status,
            analysis,
            sample_index,
            timestamp,
        )))
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn publish(&self, snapshot: &AnalysisSnapshot) -> Result<(), StorageError> {
        let sample_index = i64::try_from(snapshot.sample_index).map_err(|_| {
            StorageError::Serialization(format!(
                "sample index {} exceeds storage range",
                snapshot.sample_index
            ))
        })?;
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        conn.execute(
            "
            INSERT INTO analysis_snapshot (slot, ts, analysis, sample_index, status)
            VALUES (1, ?1, ?2, ?3, ?4)
            ON CONFLICT(slot) DO UPDATE SET
                ts=excluded.ts,
                analysis=excluded.analysis,
                sample_index=excluded.sample_index,
                status=excluded.status
            ",
            params![
                snapshot.timestamp.to_rfc3339(),
                snapshot.analysis,
                sample_index,
                snapshot.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn read(&self) -> AnalysisSnapshot {
        match self.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => AnalysisSnapshot::disconnected(None),
            Err(err) => {
                warn!(event = "snapshot_unreadable", store = %self.label, error = %err);
                AnalysisSnapshot::disconnected(Some(&err.to_string()))
            }
        }
    }

    fn reset(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        conn.execute("DELETE FROM analysis_snapshot", [])?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_772_346_600_000 + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    fn sample(index: u64) -> AnalysisSnapshot {
        AnalysisSnapshot::new(
            SnapshotStatus::Running,
            format!("Cow 1: eating hay at sample {index}"),
            index,
            ts(index as i64),
        )
    }

    fn stores(dir: &Path) -> Vec<Box<dyn SnapshotStore>> {
        vec![
            Box::new(FileSnapshotStore::new(dir.join("slot.json"))),
            Box::new(SqliteSnapshotStore::open(dir.join("slot.sqlite3")).expect("open sqlite")),
            Box::new(SqliteSnapshotStore::open_in_memory().expect("open memory")),
        ]
    }

    #[test]
    fn read_before_publish_is_disconnected() {
        let dir = tempfile::tempdir().expect("tempdir");
        for store in stores(dir.path()) {
            let snapshot = store.read();
            assert_eq!(snapshot.status, SnapshotStatus::Disconnected, "{}", store.describe());
        }
    }

    #[test]
    fn publish_then_read_returns_identical_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        for store in stores(dir.path()) {
            let first = sample(90);
            store.publish(&first).expect("publish first");
            assert_eq!(store.read(), first, "{}", store.describe());

            let second = AnalysisSnapshot::new(
                SnapshotStatus::Stopped,
                "Analysis stopped",
                181,
                Utc::now(),
            );
            store.publish(&second).expect("publish second");
            assert_eq!(store.read(), second, "{}", store.describe());
        }
    }

    #[test]
    fn reset_returns_slot_to_disconnected() {
        let dir = tempfile::tempdir().expect("tempdir");
        for store in stores(dir.path()) {
            store.publish(&sample(3)).expect("publish");
            store.reset().expect("reset");
            store.reset().expect("reset twice");
            assert_eq!(store.read().status, SnapshotStatus::Disconnected);
        }
    }

    #[test]
    fn corrupt_file_reads_as_disconnected_with_reason() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slot.json");
        std::fs::write(&path, b"{\"timestamp\": \"yesterday\"").expect("write corrupt");

        let snapshot = FileSnapshotStore::new(&path).read();
        assert_eq!(snapshot.status, SnapshotStatus::Disconnected);
        assert!(snapshot.analysis.contains("unreadable record"));
    }

    #[test]
    fn file_store_writes_the_interop_json_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSnapshotStore::new(dir.path().join("slot.json"));
        store.publish(&sample(270)).expect("publish");

        let raw = std::fs::read_to_string(store.path()).expect("read raw");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["sample_index"], 270);
        assert_eq!(value["status"], "running");
        assert!(value["timestamp"].as_str().expect("ts string").starts_with("2026-"));
    }

    #[test]
    fn concurrent_reader_never_observes_partial_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slot.json");
        let writer = FileSnapshotStore::new(&path);
        writer.publish(&sample(0)).expect("seed");

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let done = Arc::clone(&done);
            let store = FileSnapshotStore::new(&path);
            thread::spawn(move || {
                let mut reads = 0usize;
                while !done.load(Ordering::SeqCst) {
                    let snapshot = store.read();
                    assert_eq!(snapshot.status, SnapshotStatus::Running);
                    reads += 1;
                }
                reads
            })
        };

        for index in 1..200 {
            writer.publish(&sample(index)).expect("publish");
        }
        done.store(true, Ordering::SeqCst);
        assert!(reader.join().expect("reader thread") > 0);
    }

    #[test]
    fn second_writer_is_refused_while_lease_is_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSnapshotStore::new(dir.path().join("slot.json"));

        let lease = store.claim_writer().expect("first lease");
        let err = store.claim_writer().err().expect("second lease refused");
        assert!(matches!(err, StorageError::WriterBusy { .. }));

        drop(lease);
        store.claim_writer().expect("lease after release");
    }

    #[test]
    fn store_config_picks_default_path_per_backend() {
        let config = StoreConfig::new(StoreBackend::Sqlite, None);
        assert_eq!(config.path, PathBuf::from(DEFAULT_SNAPSHOT_DB));
        assert_eq!("JSON".parse::<StoreBackend>(), Ok(StoreBackend::File));
        assert!("redis".parse::<StoreBackend>().is_err());
    }
}
