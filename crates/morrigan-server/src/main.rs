use anyhow::{Context, Result};
use morrigan_core::config::Config;
use morrigan_server::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    let supervisor = Supervisor::new();
    supervisor
        .start(config)
        .await
        .context("server failed to reach Ready")?;

    let reason = wait_for_shutdown_signal().await;
    tracing::info!(reason, "shutdown signal received");
    supervisor
        .stop(reason)
        .await
        .context("server failed to stop cleanly")?;

    Ok(())
}

/// Waits for either Ctrl-C or SIGTERM and returns a short human-readable
/// reason, mirroring the teacher's daemon shutdown handling.
async fn wait_for_shutdown_signal() -> &'static str {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "ctrl-c",
        _ = terminate => "sigterm",
    }
}
