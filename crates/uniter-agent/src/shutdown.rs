//! Cooperative cancellation.
//!
//! Every wait point in the mode loops selects on [`Shutdown::cancelled`]
//! alongside its event sources, and checks [`Shutdown::is_cancelled`]
//! before starting an operation.

use std::future::Future;

use tokio::sync::watch;

use crate::error::{Result, UniterError};

/// Create a linked trigger and shutdown signal.
#[must_use]
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// The sending half: asks every linked [`Shutdown`] to stop.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Trigger once `signal` resolves, e.g. `tokio::signal::ctrl_c()`.
    ///
    /// If the signal cannot be listened for, the trigger is held until the
    /// returned future is dropped, so linked signals stay live.
    pub async fn on_signal(self, signal: impl Future<Output = std::io::Result<()>>) {
        match signal.await {
            Ok(()) => {
                tracing::info!("Received interrupt, shutting down");
                self.trigger();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for interrupts");
                std::future::pending::<()>().await;
            }
        }
    }

    /// Another signal linked to this trigger.
    #[must_use]
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// The receiving half, cloned into whatever needs to observe shutdown.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Returns true once shutdown has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Fail with `UniterError::Cancelled` if shutdown has been requested.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::Cancelled` after shutdown was requested.
    pub fn ensure_alive(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(UniterError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once shutdown has been requested.
    ///
    /// A dropped trigger counts as a shutdown request.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}
