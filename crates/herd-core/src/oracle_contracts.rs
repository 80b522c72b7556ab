use crate::SampledFrame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ORACLE_TIMEOUT_MS: u64 = 20_000;

pub const COW_FEEDING_INSTRUCTION: &str = "The agent's task is to detect cows. If there are \
multiple cows, check each cow individually and report whether it is eating or not. If there \
are cows, also identify the feed. Provide only that information.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OracleFailureKind {
    Encoding,
    Transport,
    Timeout,
    Provider,
    InvalidOutput,
}

impl OracleFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Encoding => "encoding",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Provider => "provider",
            Self::InvalidOutput => "invalid_output",
        }
    }
}

impl std::fmt::Display for OracleFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("oracle call failed ({kind}): {message}")]
pub struct OracleError {
    pub kind: OracleFailureKind,
    pub message: String,
}

impl OracleError {
    pub fn new(kind: OracleFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Text form published in place of an analysis when the call fails.
    pub fn to_analysis_text(&self) -> String {
        format!("Analysis error ({}): {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OracleGuardrails {
    pub timeout_ms: u64,
    pub max_image_dimension: u32,
}

impl Default for OracleGuardrails {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_ORACLE_TIMEOUT_MS,
            max_image_dimension: 1_024,
        }
    }
}

impl OracleGuardrails {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    pub instruction: String,
    pub image: Option<SampledFrame>,
}

impl OracleRequest {
    pub fn text(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            image: None,
        }
    }

    pub fn with_image(instruction: impl Into<String>, frame: SampledFrame) -> Self {
        Self {
            instruction: instruction.into(),
            image: Some(frame),
        }
    }
}

/// One external model call per invocation. Implementations never retry.
#[async_trait]
pub trait OracleAdapter: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn complete(
        &self,
        request: &OracleRequest,
        guardrails: &OracleGuardrails,
    ) -> Result<String, OracleError>;
}

/// Runs a single adapter call under the guardrail timeout. Empty replies are
/// reported as `InvalidOutput`.
pub async fn invoke(
    adapter: &dyn OracleAdapter,
    request: &OracleRequest,
    guardrails: &OracleGuardrails,
) -> Result<String, OracleError> {
    let timeout = guardrails.timeout();
    let text = match tokio::time::timeout(timeout, adapter.complete(request, guardrails)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(OracleError::new(
                OracleFailureKind::Timeout,
                format!(
                    "{} did not answer within {}ms",
                    adapter.provider_name(),
                    timeout.as_millis()
                ),
            ))
        }
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(OracleError::new(
            OracleFailureKind::InvalidOutput,
            format!("{} returned an empty reply", adapter.provider_name()),
        ));
    }
    Ok(trimmed.to_string())
}

/// Fail-soft frame analysis: always returns non-empty text, either the model's
/// answer or an error description standing in for it.
pub async fn analyze(
    adapter: &dyn OracleAdapter,
    frame: SampledFrame,
    instruction: &str,
    guardrails: &OracleGuardrails,
) -> String {
    let request = OracleRequest::with_image(instruction, frame);
    match invoke(adapter, &request, guardrails).await {
        Ok(text) => text,
        Err(err) => err.to_analysis_text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Script {
        Reply(&'static str),
        Fail(OracleFailureKind),
        Hang,
    }

    struct ScriptedOracle {
        script: Script,
        calls: AtomicUsize,
    }

    impl ScriptedOracle {
        fn new(script: Script) -> Self {
            Self {
                script,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OracleAdapter for ScriptedOracle {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _request: &OracleRequest,
            _guardrails: &OracleGuardrails,
        ) -> Result<String, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Reply(text) => Ok(text.to_string()),
                Script::Fail(kind) => Err(OracleError::new(kind, "connection reset by peer")),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok("too late".to_string())
                }
            }
        }
    }

    fn frame() -> SampledFrame {
        SampledFrame::new(90, vec![0xFF, 0xD8, 0xFF, 0xD9], FrameFormat::Jpeg)
    }

    #[tokio::test]
    async fn analyze_returns_model_text_trimmed() {
        let oracle = ScriptedOracle::new(Script::Reply("  Cow 1: eating silage \n"));
        let text = analyze(&oracle, frame(), COW_FEEDING_INSTRUCTION, &OracleGuardrails::default())
            .await;
        assert_eq!(text, "Cow 1: eating silage");
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_fault_degrades_to_error_text_without_retry() {
        let oracle = ScriptedOracle::new(Script::Fail(OracleFailureKind::Transport));
        let text = analyze(&oracle, frame(), "describe", &OracleGuardrails::default()).await;
        assert!(text.starts_with("Analysis error (transport)"));
        assert!(text.contains("connection reset by peer"));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_reply_is_reported_as_invalid_output() {
        let oracle = ScriptedOracle::new(Script::Reply("   "));
        let err = invoke(&oracle, &OracleRequest::text("hi"), &OracleGuardrails::default())
            .await
            .expect_err("empty reply");
        assert_eq!(err.kind, OracleFailureKind::InvalidOutput);

        let text = analyze(&oracle, frame(), "describe", &OracleGuardrails::default()).await;
        assert!(!text.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out() {
        let oracle = ScriptedOracle::new(Script::Hang);
        let guardrails = OracleGuardrails {
            timeout_ms: 250,
            ..OracleGuardrails::default()
        };
        let err = invoke(&oracle, &OracleRequest::text("hi"), &guardrails)
            .await
            .expect_err("timeout");
        assert_eq!(err.kind, OracleFailureKind::Timeout);
        assert!(err.message.contains("250ms"));
    }
}
