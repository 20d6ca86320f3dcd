//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
///
/// If a handler cannot be installed the corresponding signal is simply never
/// observed; Ctrl-C still works through the remaining handlers.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    fn install(kind: SignalKind, name: &'static str) -> Option<Signal> {
        signal(kind)
            .inspect_err(|e| warn!(signal = name, error = %e, "Failed to install signal handler"))
            .ok()
    }

    async fn recv(sig: Option<Signal>) {
        match sig {
            Some(mut sig) => {
                sig.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    let sigint = install(SignalKind::interrupt(), "SIGINT");
    let sigterm = install(SignalKind::terminate(), "SIGTERM");
    let sigquit = install(SignalKind::quit(), "SIGQUIT");

    tokio::select! {
        _ = recv(sigint) => info!(message = "Signal received.", signal = "SIGINT"),
        _ = recv(sigterm) => info!(message = "Signal received.", signal = "SIGTERM"),
        _ = recv(sigquit) => info!(message = "Signal received.", signal = "SIGQUIT"),
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!(message = "Signal received.", signal = "CTRL_C");
}

/// Spawn a task that cancels `token` when a shutdown signal arrives.
pub fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown requested, finishing in-flight work");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellation_propagates_through_clones() {
        let original = CancellationToken::new();
        let clone1 = original.clone();
        let clone2 = clone1.clone();

        assert!(!clone2.is_cancelled());
        original.cancel();
        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_watcher_exits_when_token_cancelled() {
        let token = CancellationToken::new();
        let handle = cancel_on_signal(token.clone());

        token.cancel();

        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("watcher should exit once the token is cancelled")
            .expect("watcher should not panic");
    }
}
