use anyhow::Result;
use tokio::signal;

/// Wait for termination signals (Ctrl+C, SIGTERM)
pub async fn wait_for_shutdown() -> Result<()> {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(%e, "Failed to install Ctrl+C handler");
            return Err(e);
        }
        Ok(())
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal_handler) => {
                signal_handler.recv().await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(%e, "Failed to install SIGTERM handler");
                Err(e)
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            if let Err(e) = result {
                tracing::error!(%e, "Error handling Ctrl+C signal");
                return Err(e.into());
            }
            tracing::warn!(signal = "SIGINT", "receive stop signal....");
        },
        result = terminate => {
            if let Err(e) = result {
                tracing::error!(%e, "Error handling SIGTERM signal");
                return Err(e.into());
            }
            tracing::warn!(signal = "SIGTERM", "receive stop signal....");
        },
    }

    Ok(())
}
