//! Startup helpers for the idle sweeper process.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;

use crate::memory::core::config::MemoryConfig;
use crate::memory::engine::{SessionBackends, SessionLifecycle};
use crate::memory::maintenance::IdleSweeper;

/// Run the sweeper (used by the `dialogue-sweeper` binary).
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting dialogue sweeper v{}", env!("CARGO_PKG_VERSION"));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(run_until_ctrl_c()) {
        tracing::error!("Sweeper error: {e:#}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Wire backends from the environment and sweep until Ctrl-C.
///
/// # Errors
/// Returns an error if the configuration is invalid or a backend cannot be
/// initialized.
pub async fn run_until_ctrl_c() -> anyhow::Result<()> {
    let config = MemoryConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        redis = %config.storage.redis_url,
        sqlite = %config.storage.sqlite_path.display(),
        "Backends configured"
    );

    let backends = SessionBackends::from_config(&config)
        .await
        .context("failed to initialize backends")?;
    let lifecycle = Arc::new(SessionLifecycle::new(&config, &backends));

    let sweeper = IdleSweeper::new(lifecycle, config.sweep.clone(), config.session.idle_timeout());
    let shutdown = sweeper.shutdown_notifier();
    let handle = sweeper.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    shutdown.notify_one();
    handle.await.context("sweeper task panicked")?;
    Ok(())
}
