mod extract;
mod gateway;
mod routes;

use clap::Parser;
use gateway::{AfricasTalkingConfig, AfricasTalkingGateway, LogOnlyGateway, SmsGateway};
use herd_core::identity::DEFAULT_COUNTRY_CODE;
use herd_core::logging::{init_logging, LogTarget};
use herd_core::oracle_contracts::{OracleGuardrails, DEFAULT_ORACLE_TIMEOUT_MS};
use herd_fuser::{ContextFuser, FuserConfig};
use herd_gemini_adapter::{GeminiConfig, GeminiOracle, DEFAULT_GEMINI_MODEL};
use herd_storage::{ConversationLedger, LedgerConfig, StoreBackend, StoreConfig, TurnArchive};
use routes::AppState;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    log_dir: String,
    country_code: String,
    store: StoreConfig,
    frame_path: Option<PathBuf>,
    archive: Option<PathBuf>,
    max_turns: usize,
    oracle_model: String,
    oracle_timeout_ms: u64,
}

#[derive(Parser, Debug)]
#[command(name = "herd-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value = "")]
    country_code: String,
    #[arg(long, default_value = "")]
    store_backend: String,
    #[arg(long, default_value = "")]
    store_path: String,
    /// Re-attach the sampler's latest frame to every reply prompt.
    #[arg(long, default_value_t = false)]
    attach_frame: bool,
    /// SQLite file keeping conversation history across restarts.
    #[arg(long)]
    archive: Option<PathBuf>,
    #[arg(long, default_value_t = herd_storage::ledger::DEFAULT_MAX_TURNS_PER_IDENTITY)]
    max_turns: usize,
}

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err}");
            return;
        }
    };
    let _log_guard = init_logging("herd-hub", &config.log_dir, config.debug, LogTarget::Tee);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let Some(api_key) = non_empty_env("GOOGLE_API_KEY") else {
        error!(event = "hub_error", error = "GOOGLE_API_KEY is not set");
        return;
    };

    let store = match config.store.open() {
        Ok(store) => store,
        Err(err) => {
            error!(event = "hub_error", error = %err, store = %config.store.path.display());
            return;
        }
    };

    let ledger_config = LedgerConfig {
        max_turns_per_identity: config.max_turns,
    };
    let ledger = match &config.archive {
        Some(path) => match TurnArchive::open(path)
            .and_then(|archive| ConversationLedger::with_archive(ledger_config, archive))
        {
            Ok(ledger) => ledger,
            Err(err) => {
                error!(event = "hub_error", error = %err, archive = %path.display());
                return;
            }
        },
        None => ConversationLedger::new(ledger_config),
    };
    let ledger = Arc::new(ledger);

    let mut gemini = GeminiConfig::new(api_key);
    gemini.model = config.oracle_model.clone();
    let fuser = ContextFuser::new(
        store.clone(),
        ledger.clone(),
        Arc::new(GeminiOracle::new(gemini)),
        FuserConfig {
            attach_frame: config.frame_path.is_some(),
            frame_path: config.frame_path.clone(),
            guardrails: OracleGuardrails {
                timeout_ms: config.oracle_timeout_ms,
                ..OracleGuardrails::default()
            },
            ..FuserConfig::default()
        },
    );

    let gateway = resolve_gateway();
    let state = AppState {
        fuser: Arc::new(fuser),
        ledger,
        gateway: gateway.clone(),
        country_code: Arc::from(config.country_code.as_str()),
    };
    let app = routes::router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        store = %store.describe(),
        gateway = gateway.name(),
        archive = config.archive.is_some()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
    info!(event = "hub_stop");
}

fn load_config() -> Result<Config, String> {
    let args = Args::parse();
    let backend = resolve_flag(&args.store_backend, "HERD_STORE_BACKEND", "file")
        .parse::<StoreBackend>()?;
    let store_path = resolve_flag(&args.store_path, "HERD_STORE_PATH", "");
    let frame_path = if args.attach_frame || env_true("HERD_ATTACH_FRAME") {
        Some(PathBuf::from(resolve_flag(
            "",
            "HERD_FRAME_PATH",
            "current_frame.jpg",
        )))
    } else {
        None
    };
    let oracle_timeout_ms = match non_empty_env("HERD_ORACLE_TIMEOUT_MS") {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|err| format!("HERD_ORACLE_TIMEOUT_MS: {err}"))?,
        None => DEFAULT_ORACLE_TIMEOUT_MS,
    };

    Ok(Config {
        addr: resolve_flag(&args.addr, "HERD_HUB_ADDR", "0.0.0.0:5000"),
        debug: args.debug || env_true("HERD_HUB_DEBUG"),
        log_dir: resolve_flag(&args.log_dir, "HERD_LOG_DIR", ".herd/logs"),
        country_code: resolve_flag(&args.country_code, "HERD_COUNTRY_CODE", DEFAULT_COUNTRY_CODE),
        store: StoreConfig::new(backend, Some(PathBuf::from(store_path))),
        frame_path,
        archive: args.archive,
        max_turns: args.max_turns,
        oracle_model: resolve_flag("", "HERD_ORACLE_MODEL", DEFAULT_GEMINI_MODEL),
        oracle_timeout_ms,
    })
}

fn resolve_gateway() -> Arc<dyn SmsGateway> {
    match non_empty_env("AT_API_KEY") {
        Some(api_key) => Arc::new(AfricasTalkingGateway::new(AfricasTalkingConfig {
            username: non_empty_env("AT_USERNAME").unwrap_or_else(|| "sandbox".to_string()),
            api_key,
            sender: non_empty_env("AT_SENDER"),
            endpoint: non_empty_env("AT_ENDPOINT"),
        })),
        None => {
            warn!(event = "sms_gateway_disabled", reason = "AT_API_KEY is not set");
            Arc::new(LogOnlyGateway)
        }
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_flag(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    non_empty_env(env_key).unwrap_or_else(|| default.to_string())
}
