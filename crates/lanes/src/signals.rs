//! OS signal handling for graceful shutdown.

use tokio::signal;
use tracing::info;

/// Waits for a termination signal and returns its name.
///
/// Unix platforms listen for SIGHUP, SIGQUIT, SIGTERM and SIGINT; other
/// platforms for Ctrl+C.
pub async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    let name = {
        use signal::unix::{signal, SignalKind};

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sighup.recv() => "SIGHUP",
            _ = sigquit.recv() => "SIGQUIT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    };

    #[cfg(not(unix))]
    let name = {
        signal::ctrl_c().await?;
        "Ctrl+C"
    };

    info!("📡 Received {}", name);
    Ok(name)
}
