//! Shutdown triggers for the app.
//!
//! Shutdown can be driven by OS signals, an external `CancellationToken`,
//! or an arbitrary future. Each of them ends up cancelling one shared token.

use std::{future::Future, pin::Pin};

use tokio_util::sync::CancellationToken;

/// How the app should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

impl ShutdownOptions {
    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::Future(Box::pin(fut))
    }
}

/// Turn `opts` into the shared token, spawning a waiter where needed.
pub(crate) fn shutdown_token(opts: ShutdownOptions) -> CancellationToken {
    match opts {
        ShutdownOptions::Token(t) => {
            tracing::info!("shutdown: external token will control lifecycle");
            t
        }
        ShutdownOptions::Signals => {
            let cancel = CancellationToken::new();
            let c = cancel.clone();
            tokio::spawn(async move {
                match espresso_bootstrap::wait_for_shutdown().await {
                    Ok(()) => tracing::info!("shutdown: signal received"),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "shutdown: primary waiter failed; falling back to ctrl_c()"
                        );
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
                c.cancel();
            });
            cancel
        }
        ShutdownOptions::Future(waiter) => {
            let cancel = CancellationToken::new();
            let c = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("shutdown: external future completed");
                c.cancel();
            });
            cancel
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn future_cancels_token() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let token = shutdown_token(ShutdownOptions::future(async move {
            let _ = rx.await;
        }));
        assert!(!token.is_cancelled());
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn external_token_is_shared() {
        let external = CancellationToken::new();
        let token = shutdown_token(ShutdownOptions::Token(external.clone()));
        external.cancel();
        assert!(token.is_cancelled());
    }
}
