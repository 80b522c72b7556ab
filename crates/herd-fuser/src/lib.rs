mod prompt;

pub use prompt::compose_prompt;

use herd_core::oracle_contracts::{
    invoke, OracleAdapter, OracleFailureKind, OracleGuardrails, OracleRequest,
};
use herd_core::{AnalysisSnapshot, FrameFormat, SampledFrame};
use herd_storage::{ConversationLedger, SnapshotStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_HISTORY_TURNS: usize = 6;

#[derive(Debug, Clone)]
pub struct FuserConfig {
    /// Prior turns of the caller included in the prompt.
    pub history_turns: usize,
    pub attach_frame: bool,
    pub frame_path: Option<PathBuf>,
    pub guardrails: OracleGuardrails,
}

impl Default for FuserConfig {
    fn default() -> Self {
        Self {
            history_turns: DEFAULT_HISTORY_TURNS,
            attach_frame: false,
            frame_path: None,
            guardrails: OracleGuardrails::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusedReply {
    pub text: String,
    /// Set when the oracle call failed and `text` is an apology.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<OracleFailureKind>,
}

impl FusedReply {
    pub fn is_degraded(&self) -> bool {
        self.failure.is_some()
    }
}

/// Answers one farmer message from the latest snapshot and the caller's
/// recent history. Never writes to the ledger.
pub struct ContextFuser {
    store: Arc<dyn SnapshotStore>,
    ledger: Arc<ConversationLedger>,
    oracle: Arc<dyn OracleAdapter>,
    config: FuserConfig,
}

impl ContextFuser {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        ledger: Arc<ConversationLedger>,
        oracle: Arc<dyn OracleAdapter>,
        config: FuserConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            oracle,
            config,
        }
    }

    pub fn config(&self) -> &FuserConfig {
        &self.config
    }

    pub fn current_snapshot(&self) -> AnalysisSnapshot {
        self.store.read()
    }

    pub async fn respond(&self, identity: &str, utterance: &str) -> FusedReply {
        let snapshot = self.store.read();
        let history = self.ledger.recent(identity, self.config.history_turns);
        let instruction = compose_prompt(&snapshot, &history, utterance);

        let frame = if self.config.attach_frame {
            match self.config.frame_path.as_deref() {
                Some(path) => load_frame(path, snapshot.sample_index).await,
                None => None,
            }
        } else {
            None
        };

        let request = match frame {
            Some(frame) => OracleRequest::with_image(instruction, frame),
            None => OracleRequest::text(instruction),
        };

        match invoke(self.oracle.as_ref(), &request, &self.config.guardrails).await {
            Ok(text) => {
                debug!(
                    event = "fuser_reply",
                    identity = %identity,
                    status = %snapshot.status,
                    history = history.len(),
                    with_frame = request.image.is_some()
                );
                FusedReply {
                    text,
                    failure: None,
                }
            }
            Err(err) => {
                warn!(
                    event = "fuser_oracle_failed",
                    identity = %identity,
                    provider = self.oracle.provider_name(),
                    kind = %err.kind,
                    error = %err.message
                );
                FusedReply {
                    text: format!(
                        "Sorry, I couldn't process your question right now. Error: {}",
                        err
                    ),
                    failure: Some(err.kind),
                }
            }
        }
    }
}

async fn load_frame(path: &Path, sample_index: u64) -> Option<SampledFrame> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(event = "fuser_frame_unavailable", path = %path.display(), error = %err);
            return None;
        }
    };
    let format = FrameFormat::sniff(&bytes).or_else(|| FrameFormat::from_path(path))?;
    Some(SampledFrame::new(sample_index, bytes, format))
}
