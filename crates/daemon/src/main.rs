use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use image_archiver_core::{RunState, TriggerSource};
use image_archiver_daemon::config::{self, Config, Settings};
use image_archiver_daemon::scheduler::{parse_schedule, scheduler_loop};
use image_archiver_daemon::{
    build_router, AppState, HistoryWalker, ItemTransfer, RunOrchestrator, RunOutcome,
    WalkerSettings,
};
use image_archiver_providers::{DriveClient, SlackClient};
use image_archiver_storage::ArchiveRepository;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let (cfg, mode) = parse_args()?;
    let settings = Settings::resolve(&cfg, |key| env::var(key).ok());

    let repo = ArchiveRepository::init(settings.root.clone(), settings.database_url.as_deref()).await?;

    match mode.as_deref() {
        Some("unlock") => unlock(&repo).await,
        Some("run-once") => run_once(build_orchestrator(&settings, &repo)?).await,
        Some(other) => bail!("unknown mode: {other} (expected run-once or unlock)"),
        None => run_service(&settings, repo).await,
    }
}

/// Parse CLI args, returning the loaded config and optional subcommand.
fn parse_args() -> Result<(Config, Option<String>)> {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut mode: Option<String> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            other => {
                mode = Some(other.to_owned());
            }
        }
        i += 1;
    }

    let cfg = match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)?
        }
        None => Config::default(),
    };

    Ok((cfg, mode))
}

fn build_orchestrator(settings: &Settings, repo: &ArchiveRepository) -> Result<Arc<RunOrchestrator>> {
    let feed = Arc::new(SlackClient::new(settings.slack_config()?)?);
    let store = Arc::new(DriveClient::new(settings.drive_config()?)?);
    let transfer = ItemTransfer::new(feed.clone(), store, repo.scratch_dir(), settings.folder_id()?);
    let walker = HistoryWalker::new(
        feed,
        repo.ledger(),
        transfer,
        WalkerSettings {
            channel_id: settings.channel_id()?,
            page_size: settings.page_size,
            retry: settings.retry,
        },
    );
    Ok(Arc::new(RunOrchestrator::new(repo.lock(), walker)))
}

async fn unlock(repo: &ArchiveRepository) -> Result<()> {
    let lock = repo.lock();
    let before = lock.lock_state().await?;
    lock.force_release().await?;
    if before.is_running {
        warn!(previous_owner = ?before.owner, started_at = ?before.started_at, "backup lock force-released");
    } else {
        info!("backup lock was not held");
    }
    Ok(())
}

async fn run_once(orchestrator: Arc<RunOrchestrator>) -> Result<()> {
    match orchestrator.run_once(TriggerSource::Cli).await {
        RunOutcome::Completed(summary) => {
            info!(transferred = summary.transferred, "backup complete");
            Ok(())
        }
        RunOutcome::SkippedBusy => {
            info!("another backup run holds the lock");
            Ok(())
        }
        RunOutcome::Failed { error } => bail!("backup failed: {error}"),
    }
}

async fn run_service(settings: &Settings, repo: ArchiveRepository) -> Result<()> {
    let orchestrator = build_orchestrator(settings, &repo)?;

    let scheduler = match &settings.cron {
        Some(expr) => {
            let schedule = parse_schedule(expr)?;
            info!(cron = %expr, "scheduled backups enabled");
            Some(tokio::spawn(scheduler_loop(orchestrator.clone(), schedule)))
        }
        None => {
            info!("scheduled backups disabled");
            None
        }
    };

    let state = AppState {
        repo,
        orchestrator: orchestrator.clone(),
        api_token: settings.api_token.clone(),
    };

    let addr: SocketAddr = settings
        .listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", settings.listen))?;
    let app = build_router(state);

    info!(%addr, "starting archiver API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(orchestrator.clone()))
        .await?;

    // No new scheduled run may start once the in-flight one has been cancelled.
    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    orchestrator.cancel();
    wait_for_idle(&orchestrator).await;
    Ok(())
}

async fn shutdown_signal(orchestrator: Arc<RunOrchestrator>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    if orchestrator.cancel() {
        info!("cancelling in-flight backup run");
    }
}

/// Give a cancelled run time to reach an item boundary and release the lock.
async fn wait_for_idle(orchestrator: &RunOrchestrator) {
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while orchestrator.state() != RunState::Idle {
        if Instant::now() >= deadline {
            warn!("backup run still active at shutdown; lock may need `unlock`");
            return;
        }
        sleep(Duration::from_millis(200)).await;
    }
}
