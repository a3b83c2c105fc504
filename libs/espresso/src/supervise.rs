//! Panic-isolated task supervision.
//!
//! [`supervise`] runs a unit of work on its own tokio task. Whatever happens
//! to the work (normal return or panic), the cleanup hooks run first in
//! registration order, then the `on_exit` hook observes the outcome, then the
//! same outcome is delivered once on the returned [`Completion`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Outcome of a supervised task that did not finish cleanly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisedError {
    #[error("supervised task panicked: {reason}")]
    Panicked { reason: String },
    /// The task was dropped before reporting (runtime shut down underneath it).
    #[error("supervised task was aborted before completion")]
    Aborted,
}

/// Cleanup hook. Runs after the work returns or panics.
pub type Cleanup = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// Exit hook. Observes the final result exactly once.
pub type OnExit = Box<dyn FnOnce(&CancellationToken, &Result<(), SupervisedError>) + Send>;

/// Single-use completion signal of a supervised task.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), SupervisedError>>,
}

impl Completion {
    /// Wait until the task reports. A task torn down without reporting yields
    /// [`SupervisedError::Aborted`].
    pub async fn wait(self) -> Result<(), SupervisedError> {
        self.rx.await.unwrap_or(Err(SupervisedError::Aborted))
    }
}

/// Convenience for building a [`Cleanup`] from an async closure.
pub fn cleanup<F, Fut>(f: F) -> Cleanup
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |cancel| f(cancel).boxed())
}

/// Spawn `work` as an isolated task.
///
/// Panics inside `work` never escape: they become
/// [`SupervisedError::Panicked`]. Panics inside a cleanup are swallowed and
/// the remaining cleanups still run.
pub fn supervise<W, Fut>(
    cancel: CancellationToken,
    work: W,
    on_exit: Option<OnExit>,
    cleanups: Vec<Cleanup>,
) -> Completion
where
    W: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let token = cancel.clone();
        let outcome = AssertUnwindSafe(async move { work(token).await })
            .catch_unwind()
            .await;

        for hook in cleanups {
            let token = cancel.clone();
            if let Err(panic) = AssertUnwindSafe(async move { hook(token).await })
                .catch_unwind()
                .await
            {
                tracing::debug!(reason = %panic_message(&*panic), "cleanup panicked, ignored");
            }
        }

        let result = outcome.map_err(|panic| SupervisedError::Panicked {
            reason: panic_message(&*panic),
        });

        if let Some(on_exit) = on_exit {
            on_exit(&cancel, &result);
        }

        // Receiver may already be gone; nothing to report to.
        let _ = tx.send(result);
    });

    Completion { rx }
}

/// String form of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
