//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGINT (Ctrl+C) or SIGTERM
//! - Translate the first one into a shutdown broadcast

use crate::lifecycle::Shutdown;

/// Wait for a termination signal.
pub async fn terminate_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Trigger `shutdown` once a termination signal arrives.
pub fn spawn_signal_handler(shutdown: &Shutdown) {
    let trigger = shutdown.trigger_handle();
    tokio::spawn(async move {
        terminate_signal().await;
        tracing::info!("Termination signal received");
        let _ = trigger.send(());
    });
}
