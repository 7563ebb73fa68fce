//! fintx maintenance tool
//!
//! ```text
//! fintx [--env <name>] [--cleanup] [--stats]
//! ```
//!
//! Loads `config/<env>.yaml`, builds the configured token storage and
//! runs a one-shot purge of expired tokens (`--cleanup`) and/or prints
//! storage statistics as JSON (`--stats`). With neither flag it runs the
//! cleanup worker until Ctrl-C.

use anyhow::{Context, Result};

use fintx::cancel::CancelSignal;
use fintx::clock::system_clock;
use fintx::config::AppConfig;
use fintx::storage::{CleanupWorker, CleanupWorkerConfig, build_storage};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = fintx::logging::init_logging(&app_config);

    tracing::info!(
        env = %env,
        build = env!("FINTX_BUILD_ID"),
        backend = ?app_config.storage.backend,
        "Starting fintx"
    );

    let storage = build_storage(&app_config.storage, system_clock())
        .await
        .context("Failed to build token storage")?;

    let cleanup = has_flag("--cleanup");
    let stats = has_flag("--stats");

    if cleanup {
        let worker = CleanupWorker::with_defaults(storage.clone());
        let removed = worker.run_once().await?;
        println!("Removed {} expired token(s) from {}", removed, storage.backend_name());
    }

    if stats {
        let statistics = storage.get_statistics().await?;
        println!("{}", serde_json::to_string_pretty(&statistics)?);
    }

    if cleanup || stats {
        return Ok(());
    }

    let cancel = CancelSignal::new();
    let worker = CleanupWorker::new(
        storage,
        CleanupWorkerConfig {
            interval: std::time::Duration::from_secs(app_config.storage.cleanup_interval_secs),
        },
    );
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    cancel.cancel();
    handle.await.context("Cleanup worker panicked")?;

    Ok(())
}
