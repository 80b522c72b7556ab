use anyhow::Result;
use chrono::Utc;
use herd_core::{AnalysisSnapshot, ConversationTurn, SnapshotStatus};
use herd_fuser::ContextFuser;
use herd_storage::{ConversationLedger, TextJournal};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Quit,
    Empty,
    Status,
    Question(String),
}

impl ChatInput {
    pub fn classify(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return ChatInput::Empty;
        }
        match trimmed.to_lowercase().as_str() {
            "quit" | "exit" | "q" => ChatInput::Quit,
            "status" => ChatInput::Status,
            _ => ChatInput::Question(trimmed.to_string()),
        }
    }
}

fn status_marker(status: SnapshotStatus) -> &'static str {
    match status {
        SnapshotStatus::Running => "🟢",
        SnapshotStatus::Error => "🔴",
        SnapshotStatus::Stopped | SnapshotStatus::Disconnected => "🟡",
    }
}

/// Status block shown before each prompt.
pub fn render_status(snapshot: &AnalysisSnapshot) -> String {
    let mut lines = vec![
        format!(
            "{} Analysis Status: {}",
            status_marker(snapshot.status),
            snapshot.status
        ),
        format!(
            "⏰ Last Update: {}",
            snapshot.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        format!(
            "📊 Current Analysis: {}",
            snapshot.analysis_preview(PREVIEW_CHARS)
        ),
    ];
    if !snapshot.status.is_live() {
        lines.push(
            "⚠  Video analyzer not running. Start `herd-sampler` in another terminal.".to_string(),
        );
    }
    lines.join("\n")
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub interactions: usize,
}

/// One interactive conversation for a single local identity.
pub struct ChatSession {
    identity: String,
    fuser: Arc<ContextFuser>,
    ledger: Arc<ConversationLedger>,
    journal: Option<TextJournal>,
    interactions: usize,
}

impl ChatSession {
    pub fn new(
        identity: impl Into<String>,
        fuser: Arc<ContextFuser>,
        ledger: Arc<ConversationLedger>,
        journal: Option<TextJournal>,
    ) -> Self {
        Self {
            identity: identity.into(),
            fuser,
            ledger,
            journal,
            interactions: 0,
        }
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(|journal| journal.path())
    }

    pub fn status(&self) -> String {
        render_status(&self.fuser.current_snapshot())
    }

    /// Asks the fuser, then records both turns and journals the exchange.
    pub async fn ask(&mut self, question: &str) -> String {
        let reply = self.fuser.respond(&self.identity, question).await;

        self.ledger
            .append(&self.identity, ConversationTurn::inbound(question));
        self.ledger
            .append(&self.identity, ConversationTurn::outbound(reply.text.clone()));
        self.interactions += 1;

        if let Some(journal) = &self.journal {
            let now = Utc::now();
            let written = journal
                .append(now, "FARMER", question)
                .and_then(|_| journal.append(now, "AI", &reply.text))
                .and_then(|_| journal.append_raw("\n"));
            if let Err(err) = written {
                warn!(event = "chat_journal_failed", error = %err);
            }
        }
        info!(
            event = "chat_exchange",
            identity = %self.identity,
            degraded = reply.is_degraded()
        );
        reply.text
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            interactions: self.interactions,
        }
    }

    /// Drives the prompt loop until a quit keyword or end of input.
    pub async fn run<R, W>(&mut self, input: R, out: &mut W) -> Result<SessionSummary>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = input.lines();
        loop {
            writeln!(out, "\n{}", self.status())?;
            write!(out, "\n🌾 Farmer: ")?;
            out.flush()?;

            let Some(line) = lines.next_line().await? else {
                writeln!(out)?;
                break;
            };
            match ChatInput::classify(&line) {
                ChatInput::Quit => {
                    writeln!(out, "👋 Ending chat session...")?;
                    break;
                }
                ChatInput::Empty | ChatInput::Status => continue,
                ChatInput::Question(question) => {
                    writeln!(out, "🤖 AI is analyzing...")?;
                    out.flush()?;
                    let answer = self.ask(&question).await;
                    writeln!(out, "\n🤖 Farm Assistant: {answer}")?;
                }
            }
        }
        Ok(self.summary())
    }

    pub fn write_summary<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(out, "\n📋 CHAT SESSION SUMMARY:")?;
        writeln!(out, "   💬 Total interactions: {}", self.interactions)?;
        if let Some(path) = self.journal_path() {
            writeln!(out, "   📁 Chat log saved to: {}", path.display())?;
        }
        writeln!(out, "   🐄 Thank you for using the cow monitoring chat!")
    }
}
