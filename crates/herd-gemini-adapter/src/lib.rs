mod encode;

pub use encode::{encode_frame, EncodedImage};

use async_trait::async_trait;
use herd_core::oracle_contracts::{
    OracleAdapter, OracleError, OracleFailureKind, OracleGuardrails, OracleRequest,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Vision-language oracle backed by the Gemini `generateContent` API.
pub struct GeminiOracle {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiOracle {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    async fn build_body(
        &self,
        request: &OracleRequest,
        guardrails: &OracleGuardrails,
    ) -> Result<GenerateContentRequest, OracleError> {
        let mut parts = vec![Part::Text {
            text: request.instruction.clone(),
        }];

        if let Some(frame) = request.image.clone() {
            let max_dimension = guardrails.max_image_dimension;
            let encoded = tokio::task::spawn_blocking(move || encode_frame(&frame, max_dimension))
                .await
                .map_err(|err| {
                    OracleError::new(
                        OracleFailureKind::Encoding,
                        format!("frame encoder worker failed: {err}"),
                    )
                })??;
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: encoded.mime_type,
                    data: encoded.base64_data,
                },
            });
        }

        Ok(GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts,
            }],
        })
    }
}

#[async_trait]
impl OracleAdapter for GeminiOracle {
    fn provider_name(&self) -> &str {
        "gemini"
    }

    async fn complete(
        &self,
        request: &OracleRequest,
        guardrails: &OracleGuardrails,
    ) -> Result<String, OracleError> {
        let body = self.build_body(request, guardrails).await?;
        let started = Instant::now();

        let response = self
            .client
            .post(self.config.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .timeout(guardrails.timeout())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let raw = response.text().await.map_err(classify_transport_error)?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorEnvelope>(&raw)
                .map(|envelope| envelope.error.message)
                .unwrap_or_else(|_| raw.chars().take(200).collect());
            warn!(
                event = "oracle_provider_error",
                model = %self.config.model,
                status = status.as_u16(),
                latency_ms
            );
            return Err(OracleError::new(
                OracleFailureKind::Provider,
                format!("HTTP {}: {}", status.as_u16(), message),
            ));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&raw).map_err(|err| {
            OracleError::new(
                OracleFailureKind::InvalidOutput,
                format!("unparseable response: {err}"),
            )
        })?;

        let text = parsed
            .candidates
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .flat_map(|content| content.parts)
            .filter_map(|part| part.text)
            .collect::<Vec<_>>()
            .join("");

        if text.trim().is_empty() {
            return Err(OracleError::new(
                OracleFailureKind::InvalidOutput,
                "response carried no text candidates",
            ));
        }

        debug!(
            event = "oracle_reply",
            model = %self.config.model,
            latency_ms,
            chars = text.len(),
            with_image = request.image.is_some()
        );
        Ok(text)
    }
}

fn classify_transport_error(err: reqwest::Error) -> OracleError {
    if err.is_timeout() {
        OracleError::new(OracleFailureKind::Timeout, err.to_string())
    } else {
        OracleError::new(OracleFailureKind::Transport, err.to_string())
    }
}
