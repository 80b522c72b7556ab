use anyhow::{bail, Context, Result};
use clap::Parser;
use herd_core::logging::{init_logging, LogTarget};
use herd_core::oracle_contracts::{OracleGuardrails, DEFAULT_ORACLE_TIMEOUT_MS};
use herd_gemini_adapter::{GeminiConfig, GeminiOracle, DEFAULT_GEMINI_MODEL};
use herd_sampler::{
    ImageSequenceSource, Sampler, SamplerConfig, DEFAULT_ANALYSIS_INTERVAL, DEFAULT_OPEN_TIMEOUT_MS,
};
use herd_storage::{FileSnapshotStore, StoreBackend, StoreConfig, TextJournal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "herd-sampler", about = "Samples barn camera frames and publishes cow feeding analysis")]
struct Args {
    /// Directory of still frames, or a single image.
    #[arg(long, env = "HERD_SOURCE")]
    source: PathBuf,
    /// Playback rate; defaults to 30 when the source has none.
    #[arg(long)]
    fps: Option<f64>,
    #[arg(long, default_value_t = DEFAULT_ANALYSIS_INTERVAL)]
    analysis_interval: u64,
    #[arg(long, default_value_t = DEFAULT_OPEN_TIMEOUT_MS)]
    open_timeout_ms: u64,
    #[arg(long, env = "HERD_STORE_BACKEND", default_value = "file")]
    store_backend: StoreBackend,
    #[arg(long, env = "HERD_STORE_PATH")]
    store_path: Option<PathBuf>,
    #[arg(long, env = "HERD_FRAME_PATH", default_value = "current_frame.jpg")]
    frame_path: PathBuf,
    #[arg(long, default_value = "analysis_log.txt")]
    journal: PathBuf,
    #[arg(long, env = "HERD_LOG_DIR", default_value = ".herd/logs")]
    log_dir: String,
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, env = "HERD_ORACLE_MODEL", default_value = DEFAULT_GEMINI_MODEL)]
    model: String,
    #[arg(long, env = "HERD_ORACLE_TIMEOUT_MS", default_value_t = DEFAULT_ORACLE_TIMEOUT_MS)]
    oracle_timeout_ms: u64,
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging("herd-sampler", &args.log_dir, args.debug, LogTarget::Tee);

    let Some(api_key) = args.api_key.filter(|key| !key.trim().is_empty()) else {
        bail!("GOOGLE_API_KEY is not set");
    };

    let store_config = StoreConfig::new(args.store_backend, args.store_path);
    let _writer_lease = match store_config.backend {
        StoreBackend::File => Some(
            FileSnapshotStore::new(&store_config.path)
                .claim_writer()
                .context("another sampler is already publishing to this store")?,
        ),
        StoreBackend::Sqlite => None,
    };
    let store = store_config
        .open()
        .with_context(|| format!("opening store {}", store_config.path.display()))?;

    let mut gemini = GeminiConfig::new(api_key);
    gemini.model = args.model;
    let oracle = Arc::new(GeminiOracle::new(gemini));

    let mut source = ImageSequenceSource::new(&args.source);
    if let Some(fps) = args.fps {
        source = source.with_fps(fps);
    }

    let config = SamplerConfig {
        fps: args.fps,
        analysis_interval: args.analysis_interval,
        open_timeout: Duration::from_millis(args.open_timeout_ms),
        guardrails: OracleGuardrails {
            timeout_ms: args.oracle_timeout_ms,
            ..OracleGuardrails::default()
        },
        frame_path: Some(args.frame_path),
        journal: Some(TextJournal::new(args.journal)),
        ..SamplerConfig::default()
    };

    info!(
        event = "sampler_start",
        source = %args.source.display(),
        store = %store.describe(),
        analysis_interval = config.analysis_interval
    );

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "sampler_interrupt");
            ctrl_c_cancel.cancel();
        }
    });

    let sampler = Sampler::new(Box::new(source), store, oracle, config);
    match sampler.run(cancel).await {
        Ok(report) => {
            info!(
                event = "sampler_exit",
                frames = report.frames_sampled,
                analyses = report.analyses
            );
            Ok(())
        }
        Err(err) => {
            error!(event = "sampler_exit", error = %err);
            Err(err).context("sampler stopped with an error")
        }
    }
}
