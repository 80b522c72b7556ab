use crate::{StorageError, TurnArchive};
use herd_core::ConversationTurn;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

pub const DEFAULT_MAX_TURNS_PER_IDENTITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Oldest turns beyond this count are dropped. `0` disables the cap.
    pub max_turns_per_identity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_turns_per_identity: DEFAULT_MAX_TURNS_PER_IDENTITY,
        }
    }
}

type Thread = Arc<Mutex<VecDeque<ConversationTurn>>>;

/// Per-identity conversation history. Appends for one identity are serialized
/// by that thread's mutex; different identities only share the map lock long
/// enough to look up their thread.
pub struct ConversationLedger {
    config: LedgerConfig,
    threads: RwLock<HashMap<String, Thread>>,
    archive: Option<TurnArchive>,
}

impl ConversationLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            threads: RwLock::new(HashMap::new()),
            archive: None,
        }
    }

    /// Builds a ledger backed by `archive`, hydrated with the archived turns.
    pub fn with_archive(config: LedgerConfig, archive: TurnArchive) -> Result<Self, StorageError> {
        let mut threads = HashMap::new();
        for (identity, turns) in archive.load_all()? {
            let mut thread: VecDeque<ConversationTurn> = turns.into();
            trim_to_cap(&mut thread, config.max_turns_per_identity);
            threads.insert(identity, Arc::new(Mutex::new(thread)));
        }
        info!(event = "ledger_hydrated", identities = threads.len());
        Ok(Self {
            config,
            threads: RwLock::new(threads),
            archive: Some(archive),
        })
    }

    pub fn config(&self) -> LedgerConfig {
        self.config
    }

    fn thread(&self, identity: &str) -> Option<Thread> {
        self.threads
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(identity)
            .cloned()
    }

    fn thread_or_create(&self, identity: &str) -> Thread {
        if let Some(thread) = self.thread(identity) {
            return thread;
        }
        self.threads
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(identity.to_string())
            .or_default()
            .clone()
    }

    pub fn append(&self, identity: &str, turn: ConversationTurn) {
        let thread = self.thread_or_create(identity);
        let mut turns = thread.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.record(identity, &turn) {
                warn!(event = "ledger_archive_failed", identity = %identity, error = %err);
            }
        }

        turns.push_back(turn);
        let dropped = trim_to_cap(&mut turns, self.config.max_turns_per_identity);
        if dropped > 0 {
            if let Some(archive) = &self.archive {
                if let Err(err) = archive.prune(identity, self.config.max_turns_per_identity) {
                    warn!(event = "ledger_archive_prune_failed", identity = %identity, error = %err);
                }
            }
        }
    }

    /// Ordered turns for `identity`; empty when nothing was recorded.
    pub fn get(&self, identity: &str) -> Vec<ConversationTurn> {
        match self.thread(identity) {
            Some(thread) => thread
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .iter()
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// The newest `count` turns for `identity`, oldest first.
    pub fn recent(&self, identity: &str, count: usize) -> Vec<ConversationTurn> {
        let mut turns = self.get(identity);
        let skip = turns.len().saturating_sub(count);
        turns.drain(..skip);
        turns
    }

    pub fn snapshot_all(&self) -> BTreeMap<String, Vec<ConversationTurn>> {
        let threads: Vec<(String, Thread)> = self
            .threads
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(identity, thread)| (identity.clone(), thread.clone()))
            .collect();

        threads
            .into_iter()
            .map(|(identity, thread)| {
                let turns = thread
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .iter()
                    .cloned()
                    .collect();
                (identity, turns)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.threads
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear_identity(&self, identity: &str) -> bool {
        let removed = self
            .threads
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(identity)
            .is_some();
        if let Some(archive) = &self.archive {
            if let Err(err) = archive.clear_identity(identity) {
                warn!(event = "ledger_archive_clear_failed", identity = %identity, error = %err);
            }
        }
        removed
    }

    pub fn clear_all(&self) {
        let cleared = {
            let mut threads = self
                .threads
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let count = threads.len();
            threads.clear();
            count
        };
        if let Some(archive) = &self.archive {
            if let Err(err) = archive.clear_all() {
                warn!(event = "ledger_archive_clear_failed", error = %err);
            }
        }
        info!(event = "ledger_cleared", identities = cleared);
    }
}

impl Default for ConversationLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

fn trim_to_cap(turns: &mut VecDeque<ConversationTurn>, cap: usize) -> usize {
    if cap == 0 || turns.len() <= cap {
        return 0;
    }
    let excess = turns.len() - cap;
    turns.drain(..excess);
    excess
}
