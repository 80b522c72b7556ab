use crate::{migrate, open_shared, StorageError};
use chrono::{DateTime, Utc};
use herd_core::{ConversationTurn, TurnDirection};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Durable append-only copy of the ledger's turns.
pub struct TurnArchive {
    conn: Mutex<Connection>,
}

impl TurnArchive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = open_shared(path.as_ref())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, identity: &str, turn: &ConversationTurn) -> Result<(), StorageError> {
        self.conn().execute(
            "
            INSERT INTO conversation_turns (identity, direction, text, ts)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                identity,
                turn.direction.as_str(),
                turn.text,
                turn.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Keeps only the newest `keep` turns for `identity`.
    pub fn prune(&self, identity: &str, keep: usize) -> Result<usize, StorageError> {
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        let removed = self.conn().execute(
            "
            DELETE FROM conversation_turns
            WHERE identity = ?1
              AND turn_id NOT IN (
                SELECT turn_id FROM conversation_turns
                WHERE identity = ?1
                ORDER BY turn_id DESC
                LIMIT ?2
              )
            ",
            params![identity, keep],
        )?;
        Ok(removed)
    }

    pub fn load_all(&self) -> Result<BTreeMap<String, Vec<ConversationTurn>>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "
            SELECT identity, direction, text, ts
            FROM conversation_turns
            ORDER BY identity ASC, turn_id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut threads: BTreeMap<String, Vec<ConversationTurn>> = BTreeMap::new();
        for row in rows {
            let (identity, direction, text, ts) = row?;
            let direction = direction
                .parse::<TurnDirection>()
                .map_err(StorageError::Serialization)?;
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .map_err(|err| StorageError::Timestamp(err.to_string()))?
                .with_timezone(&Utc);
            threads.entry(identity).or_default().push(ConversationTurn {
                direction,
                text,
                timestamp,
            });
        }
        Ok(threads)
    }

    pub fn clear_identity(&self, identity: &str) -> Result<usize, StorageError> {
        Ok(self.conn().execute(
            "DELETE FROM conversation_turns WHERE identity = ?1",
            params![identity],
        )?)
    }

    pub fn clear_all(&self) -> Result<usize, StorageError> {
        Ok(self.conn().execute("DELETE FROM conversation_turns", [])?)
    }
}
