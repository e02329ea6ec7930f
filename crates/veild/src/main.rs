use anyhow::{Context, Result};
use veil_watch::{Config, Mode};

mod logging;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    let _guard = logging::init(config.as_ref().ok().and_then(|c| c.log_dir.as_deref()))?;
    let config = config.context("invalid configuration")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?config.mode,
        input = %config.input_dir.display(),
        "veild starting"
    );

    let mut watcher = veil_watch::bootstrap(&config).context("startup failed")?;

    match config.mode {
        Mode::Once => {
            let summary = watcher.drain().await;
            tracing::info!(
                processed = summary.processed,
                failed = summary.failed,
                skipped = summary.skipped,
                deferred = summary.deferred,
                "one-shot run complete"
            );
        }
        Mode::Watch => {
            let running = watcher.start();
            tracing::info!("veild ready");

            shutdown_signal().await?;
            tracing::info!("veild shutting down");
            running.stop().await?;
        }
    }

    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM where available.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}
