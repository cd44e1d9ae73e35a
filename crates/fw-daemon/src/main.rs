//! flockwork daemon: runs the automation engine until interrupted.
//!
//! Exit codes: 0 on graceful shutdown, 1 on unrecoverable init failure
//! (unreadable credential store, corrupt ledger, missing encryption key).

use anyhow::{Context, Result};
use fw_core::config::Config;
use fw_core::crypto::BlobKey;
use fw_engine::AutomationEngine;
use tracing::{error, info};

mod logging;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            // The subscriber may not be installed yet, so also write to
            // stderr directly.
            error!(error = %format!("{e:#}"), "daemon failed to start");
            eprintln!("fw-daemon: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<()> {
    // Config file path may be passed as the first argument.
    let config_path = std::env::args().nth(1);
    let mut config = match &config_path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => Config::load().context("failed to load config")?,
    };
    config.apply_env();

    if std::env::var("FLOCKWORK_LOG_JSON").is_ok() {
        logging::init_logging_json("fw-daemon", &config.general.log_level);
    } else {
        logging::init_logging("fw-daemon", &config.general.log_level);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %config.data_dir().display(),
        "flockwork daemon starting"
    );

    let key = std::env::var("FLOCKWORK_ENCRYPTION_KEY")
        .context("FLOCKWORK_ENCRYPTION_KEY is not set")?;
    let key = BlobKey::from_base64(&key).context("FLOCKWORK_ENCRYPTION_KEY is not valid")?;

    let autostart = config.general.autostart;
    let engine = AutomationEngine::open(config, key)
        .await
        .context("engine initialization failed")?;

    if autostart {
        engine.enable();
        info!("automation enabled at startup");
    }

    wait_for_stop_signal().await;

    info!("shutdown requested, draining");
    engine.shutdown().await;
    Ok(())
}

async fn wait_for_stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = term.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}
