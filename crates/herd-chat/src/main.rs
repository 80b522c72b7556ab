mod session;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use herd_core::logging::{init_logging, LogTarget};
use herd_core::oracle_contracts::{OracleGuardrails, DEFAULT_ORACLE_TIMEOUT_MS};
use herd_fuser::{ContextFuser, FuserConfig};
use herd_gemini_adapter::{GeminiConfig, GeminiOracle, DEFAULT_GEMINI_MODEL};
use herd_storage::{
    ConversationLedger, LedgerConfig, SnapshotStore, StoreBackend, StoreConfig, TextJournal,
    TurnArchive,
};
use session::{render_status, ChatSession};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "herd-chat")]
#[command(about = "Ask about your cows while the sampler runs", long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    chat: ChatArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct CommonArgs {
    #[arg(long, global = true, env = "HERD_STORE_BACKEND", default_value = "file")]
    store_backend: StoreBackend,
    #[arg(long, global = true, env = "HERD_STORE_PATH")]
    store_path: Option<PathBuf>,
    #[arg(long, global = true, env = "HERD_LOG_DIR", default_value = ".herd/logs")]
    log_dir: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the latest analysis status and exit
    Status,
    /// Ask a single question and exit
    Ask { question: String },
}

#[derive(Args)]
struct ChatArgs {
    /// Identity the conversation is recorded under.
    #[arg(long, default_value = "local")]
    session: String,
    #[arg(long, default_value = "chat_log.txt")]
    journal: PathBuf,
    /// SQLite file keeping the conversation across runs.
    #[arg(long)]
    archive: Option<PathBuf>,
    /// Attach the sampler's latest frame to each question.
    #[arg(long, env = "HERD_FRAME_PATH")]
    frame_path: Option<PathBuf>,
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, env = "HERD_ORACLE_MODEL", default_value = DEFAULT_GEMINI_MODEL)]
    model: String,
    #[arg(long, env = "HERD_ORACLE_TIMEOUT_MS", default_value_t = DEFAULT_ORACLE_TIMEOUT_MS)]
    oracle_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Stdout belongs to the conversation.
    let _log_guard = init_logging("herd-chat", &cli.common.log_dir, false, LogTarget::FileOnly);

    let store = StoreConfig::new(cli.common.store_backend, cli.common.store_path.clone())
        .open()
        .context("Failed to open analysis store")?;

    match cli.command {
        Some(Commands::Status) => {
            println!("{}", render_status(&store.read()));
            Ok(())
        }
        Some(Commands::Ask { question }) => {
            let mut session = build_session(&cli.chat, store)?;
            println!("{}", session.ask(&question).await);
            Ok(())
        }
        None => interactive(&cli.chat, store).await,
    }
}

async fn interactive(chat: &ChatArgs, store: Arc<dyn SnapshotStore>) -> Result<()> {
    let mut session = build_session(chat, store)?;

    println!("\n{}", "=".repeat(70));
    println!("🌾 FARMER CHAT");
    println!("{}", "=".repeat(70));
    println!("💬 Ask questions about your cows while the sampler runs separately.");
    println!("📝 Try: 'How many cows are eating right now?' or 'What is the feeding pattern?'");
    println!("   'status' refreshes the analysis status; 'quit' exits.");
    println!("{}", "=".repeat(70));

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    tokio::select! {
        result = session.run(stdin, &mut stdout) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\n👋 Chat interrupted by user...");
        }
    }

    session.write_summary(&mut stdout)?;
    stdout.flush()?;
    Ok(())
}

fn build_session(chat: &ChatArgs, store: Arc<dyn SnapshotStore>) -> Result<ChatSession> {
    let Some(api_key) = chat.api_key.clone().filter(|key| !key.trim().is_empty()) else {
        bail!("GOOGLE_API_KEY is not set");
    };

    let ledger = match &chat.archive {
        Some(path) => {
            let archive = TurnArchive::open(path)
                .with_context(|| format!("Failed to open archive {}", path.display()))?;
            ConversationLedger::with_archive(LedgerConfig::default(), archive)
                .context("Failed to load archived conversation")?
        }
        None => ConversationLedger::default(),
    };
    let ledger = Arc::new(ledger);

    let mut gemini = GeminiConfig::new(api_key);
    gemini.model = chat.model.clone();
    let fuser = ContextFuser::new(
        store,
        ledger.clone(),
        Arc::new(GeminiOracle::new(gemini)),
        FuserConfig {
            attach_frame: chat.frame_path.is_some(),
            frame_path: chat.frame_path.clone(),
            guardrails: OracleGuardrails {
                timeout_ms: chat.oracle_timeout_ms,
                ..OracleGuardrails::default()
            },
            ..FuserConfig::default()
        },
    );

    Ok(ChatSession::new(
        chat.session.clone(),
        Arc::new(fuser),
        ledger,
        Some(TextJournal::new(&chat.journal)),
    ))
}
