use anyhow::{Context, Result};
use clap::Parser;
use lib_panopticon::AppContext;
use std::sync::Arc;
use tokio::signal;

mod panopticon_logic;
use panopticon_logic::{config, logger, tap};

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = signal::ctrl_c() => {
                res.context("Failed to listen for Ctrl-C")?;
                log::info!("Ctrl-C received, initiating shutdown.");
            }
            _ = term_signal.recv() => {
                log::info!("SIGTERM received, initiating shutdown.");
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
        log::info!("Ctrl-C received, initiating shutdown.");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config(config::Config::parse())?;
    let settings = config.to_settings();

    let ctx = Arc::new(AppContext::new(settings).context("Invalid connection settings")?);
    let log_path = logger::setup_logging(
        &config.log_dir(),
        config.log_level(),
        config.backup_count(),
        Some(ctx.log_feed()),
    )?;
    log::info!("Logging to {}", log_path.display());
    log::debug!("Settings: {:?}", ctx.settings());

    ctx.start();
    let subscriptions = tap::attach(&ctx, &config.channel_names()).await?;
    if subscriptions.is_empty() {
        log::warn!("No valid channels selected; only logs will be written.");
    }

    wait_for_shutdown().await?;

    tap::detach(&ctx, subscriptions).await;
    ctx.stop_all().await;

    log::info!("Shutdown complete.");
    Ok(())
}
