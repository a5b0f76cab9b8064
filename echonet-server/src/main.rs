//! EchoNet process entry point: loads configuration, wires up the Store,
//! Registry, State Manager, Router and ASR Worker, then serves the HTTP
//! surface. Startup order is tracing init, then load persisted state,
//! then construct the engine pieces, then warm up, then run.

mod cli;
mod config;
mod error;
mod http;

use std::sync::Arc;

use clap::Parser;
use echonet_core::inference::stub::StubTranscriber;
use echonet_core::worker::AsrWorker;
use echonet_core::{Registry, Router, StateManager, Store, TranscriberHandle};
use tracing::{error, info, warn};

use cli::{Cli, Command};
use config::Config;
use http::state::AppState;

fn init_tracing(directive: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| directive.parse().unwrap()),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config),
        Command::InspectState => inspect_state(config),
        Command::InspectRegistry => inspect_registry(config),
        Command::BackupRegistry { dest } => backup_registry(config, dest),
        Command::MigrateDb { status, migrate } => migrate_db(config, status, migrate),
    }
}

fn serve(config: Config) -> anyhow::Result<()> {
    init_tracing(&config.log_directive);
    info!("echonet starting");

    let store = Arc::new(Store::open(&config.db_path)?);
    let registry = Arc::new(Registry::new(Arc::clone(&store))?);
    let state_manager = Arc::new(StateManager::new(Arc::clone(&store)));
    let initial_mode = config.initial_listen_mode.parse().unwrap_or(echonet_core::ListenMode::Trigger);
    state_manager.ensure_initialized(initial_mode)?;
    if let Some(index) = config.audio_device_index {
        state_manager.set_audio_device_index(index, "startup")?;
    }

    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        config.cancel_phrases.clone(),
        config.session_ttl_seconds,
    ));

    // No on-disk speech model is wired up yet (§4.F Non-goals); StubTranscriber
    // keeps the rest of the pipeline exercisable end to end.
    let transcriber: TranscriberHandle = TranscriberHandle::new(StubTranscriber::new());
    if let Err(e) = transcriber.warm_up() {
        warn!("transcriber warm-up failed: {e}");
    }

    let (worker, worker_tx) = AsrWorker::new(
        Arc::clone(&state_manager),
        Arc::clone(&router),
        transcriber.clone(),
        config.worker.clone(),
    );
    // The audio device handle isn't `Send`, so the worker owns its own
    // OS thread and its own single-threaded runtime for the async Router
    // calls it makes — the rest of the process runs on Tokio's multi-thread
    // runtime below.
    let worker_handle = std::thread::Builder::new()
        .name("asr-worker".into())
        .spawn(move || worker.run())
        .expect("failed to spawn asr-worker thread");

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run_http_and_sweep(config, store, registry, state_manager, router, transcriber));

    let _ = worker_tx.send(echonet_core::worker::WorkerCommand::Stop);
    if let Err(e) = worker_handle.join() {
        error!("asr worker thread panicked: {e:?}");
    }

    result
}

async fn run_http_and_sweep(
    config: Config,
    store: Arc<Store>,
    registry: Arc<Registry>,
    state_manager: Arc<StateManager>,
    router: Arc<Router>,
    transcriber: TranscriberHandle,
) -> anyhow::Result<()> {
    let state = AppState {
        store,
        registry,
        state_manager,
        router: Arc::clone(&router),
        transcriber,
        config: Arc::new(config.clone()),
    };

    let sweep_router = Arc::clone(&router);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now().timestamp_millis();
            let swept = sweep_router.sweep_expired(now);
            if swept > 0 {
                info!(swept, "expired sessions swept");
            }
        }
    });

    let app = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    info!(bind = %config.http_bind, "http surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn inspect_state(config: Config) -> anyhow::Result<()> {
    let store = Store::open(&config.db_path)?;
    let state_manager = StateManager::new(Arc::new(store));
    println!("listen_mode: {}", state_manager.get_listen_mode().as_str());
    println!("audio_device_index: {:?}", state_manager.get_audio_device_index());
    for (name, value) in state_manager.all_settings() {
        println!("{name} = {value}");
    }
    Ok(())
}

fn inspect_registry(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(&config.db_path)?);
    let registry = Registry::new(store)?;
    for target in registry.list()? {
        println!("{} -> {} ({} phrases)", target.name, target.base_url, target.phrases.len());
        for phrase in &target.phrases {
            println!("  - {phrase}");
        }
    }
    Ok(())
}

fn backup_registry(config: Config, dest: std::path::PathBuf) -> anyhow::Result<()> {
    let store = Store::open(&config.db_path)?;
    let backup = Store::open(&dest)?;
    for target in store.list_targets()? {
        backup.upsert_target(&target)?;
    }
    println!("backed up registry to {}", dest.display());
    Ok(())
}

fn migrate_db(config: Config, status: bool, migrate: bool) -> anyhow::Result<()> {
    if status {
        let conn = rusqlite::Connection::open(&config.db_path)?;
        let version: Option<u32> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap_or(None);
        println!("current schema version: {}", version.unwrap_or(0));
        return Ok(());
    }
    if migrate {
        Store::open(&config.db_path)?;
        println!("migrations applied (or already up to date)");
        return Ok(());
    }
    println!("specify --status or --migrate");
    Ok(())
}
