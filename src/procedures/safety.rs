//! Cancellation and panic isolation for procedure execution.
//!
//! # Cancellable waits
//!
//! Every dwell, settle and acquisition wait inside a procedure goes through
//! [`CancelToken::sleep`], which races the timer against the cancel signal. A cancel request
//! therefore interrupts a wait that is in progress instead of being noticed after it ends.
//!
//! # Panic isolation
//!
//! [`catch_panic`] runs a procedure future and converts a panic into an error, so one faulty
//! procedure cannot take down the sequencer worker.

use crate::error::{EolError, EolResult};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::watch;
use tracing::error;

/// Create a connected cancel handle and token.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx: Some(rx) })
}

/// Requests cancellation of every [`CancelToken`] cloned from its pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observes cancellation requests.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Return `Err(Cancelled)` if cancellation was requested.
    pub fn check(&self) -> EolResult<()> {
        if self.is_cancelled() {
            Err(EolError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once cancellation is requested. Pending forever if it never can be.
    pub async fn cancelled(&self) {
        match &self.rx {
            Some(rx) => {
                let mut rx = rx.clone();
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    // Handle dropped without cancelling.
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> EolResult<()> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(EolError::Cancelled),
        }
    }
}

/// Await `future`, converting a panic into `EolError::Internal`.
pub async fn catch_panic<F, T>(name: &str, future: F) -> EolResult<T>
where
    F: Future<Output = EolResult<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            error!(test = name, panic = %message, "Procedure panicked");
            Err(EolError::Internal(format!("procedure panicked: {message}")))
        }
    }
}
