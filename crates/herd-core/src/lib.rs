pub mod identity;
pub mod logging;
pub mod oracle_contracts;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const DISCONNECTED_ANALYSIS: &str =
    "No analysis data available. Make sure the video sampler is running.";
pub const STOPPED_ANALYSIS: &str = "Analysis stopped";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Running,
    Stopped,
    Error,
    Disconnected,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Running => "running",
            SnapshotStatus::Stopped => "stopped",
            SnapshotStatus::Error => "error",
            SnapshotStatus::Disconnected => "disconnected",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SnapshotStatus::Running)
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "running" => Ok(SnapshotStatus::Running),
            "stopped" => Ok(SnapshotStatus::Stopped),
            "error" => Ok(SnapshotStatus::Error),
            "disconnected" => Ok(SnapshotStatus::Disconnected),
            other => Err(format!("Unknown snapshot status: {other}")),
        }
    }
}

/// The single published analysis record shared between the sampler and its
/// consumers. Each publish replaces the previous record wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisSnapshot {
    pub timestamp: DateTime<Utc>,
    pub analysis: String,
    #[serde(alias = "frame_count")]
    pub sample_index: u64,
    pub status: SnapshotStatus,
}

impl AnalysisSnapshot {
    pub fn new(
        status: SnapshotStatus,
        analysis: impl Into<String>,
        sample_index: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            analysis: analysis.into(),
            sample_index,
            status,
        }
    }

    pub fn running(analysis: impl Into<String>, sample_index: u64) -> Self {
        Self::new(SnapshotStatus::Running, analysis, sample_index, Utc::now())
    }

    pub fn stopped(sample_index: u64) -> Self {
        Self::new(
            SnapshotStatus::Stopped,
            STOPPED_ANALYSIS,
            sample_index,
            Utc::now(),
        )
    }

    pub fn error(message: impl Into<String>, sample_index: u64) -> Self {
        Self::new(SnapshotStatus::Error, message, sample_index, Utc::now())
    }

    /// Placeholder handed to consumers when the slot is absent or unreadable.
    pub fn disconnected(reason: Option<&str>) -> Self {
        let analysis = match reason {
            Some(reason) if !reason.trim().is_empty() => {
                format!("{DISCONNECTED_ANALYSIS} ({reason})")
            }
            _ => DISCONNECTED_ANALYSIS.to_string(),
        };
        Self::new(SnapshotStatus::Disconnected, analysis, 0, Utc::now())
    }

    /// First `max_chars` characters of the analysis, with an ellipsis when cut.
    pub fn analysis_preview(&self, max_chars: usize) -> String {
        let mut chars = self.analysis.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{head}...")
        } else {
            head
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnDirection {
    Inbound,
    Outbound,
}

impl TurnDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnDirection::Inbound => "inbound",
            TurnDirection::Outbound => "outbound",
        }
    }
}

impl FromStr for TurnDirection {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "inbound" | "received" => Ok(TurnDirection::Inbound),
            "outbound" | "sent" => Ok(TurnDirection::Outbound),
            other => Err(format!("Unknown turn direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTurn {
    pub direction: TurnDirection,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn inbound(text: impl Into<String>) -> Self {
        Self {
            direction: TurnDirection::Inbound,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn outbound(text: impl Into<String>) -> Self {
        Self {
            direction: TurnDirection::Outbound,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

pub type ConversationThread = Vec<ConversationTurn>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Jpeg,
    Png,
}

impl FrameFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "image/jpeg",
            FrameFormat::Png => "image/png",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(FrameFormat::Jpeg),
            "png" => Some(FrameFormat::Png),
            _ => None,
        }
    }

    /// Detects the format from the leading magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(FrameFormat::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(FrameFormat::Png)
        } else {
            None
        }
    }
}

/// A frame picked for analysis. Lives for a single oracle call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampledFrame {
    pub index: u64,
    pub captured_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
    pub format: FrameFormat,
}

impl SampledFrame {
    pub fn new(index: u64, bytes: Vec<u8>, format: FrameFormat) -> Self {
        Self {
            index,
            captured_at: Utc::now(),
            bytes,
            format,
        }
    }
}
