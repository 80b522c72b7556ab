use crate::StorageError;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only, human-readable log file (`<ts> - <label>: <text>` per line).
#[derive(Debug, Clone)]
pub struct TextJournal {
    path: PathBuf,
}

impl TextJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, at: DateTime<Utc>, label: &str, text: &str) -> Result<(), StorageError> {
        let line = format!(
            "{} - {}: {}\n",
            at.format("%Y-%m-%d %H:%M:%S"),
            label,
            text.replace('\n', " ")
        );
        self.append_raw(&line)
    }

    pub fn append_raw(&self, text: &str) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let written = file.write_all(text.as_bytes()).and_then(|_| file.flush());
        let _ = file.unlock();
        written?;
        Ok(())
    }
}
