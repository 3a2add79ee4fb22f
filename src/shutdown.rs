//! Signal-driven graceful shutdown, shared by the HTTP server and the
//! reconciliation ticker so both drain in step.

use tokio::sync::watch::{self, Receiver, Sender};
use tracing::info;

pub struct Shutdown {
    sender: Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Signal every subscriber that the process is shutting down.
    pub fn shutdown(&self) {
        // Does not fail: the channel cannot close while `self` is alive.
        let _ = self.sender.send(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.sender.subscribe().borrow()
    }

    fn subscribe(&self) -> Receiver<bool> {
        self.sender.subscribe()
    }

    /// Resolves once shutdown has been signalled. Safe to cancel by dropping.
    pub async fn await_shutdown(&self) {
        let mut watch = self.subscribe();
        if *watch.borrow_and_update() {
            return;
        }
        let _ = watch.changed().await;
    }

    /// Spawns a task that signals shutdown on SIGINT/SIGTERM (or Ctrl-C on
    /// non-Unix targets).
    pub fn watch_os_signals(self: &std::sync::Arc<Self>) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            if let Err(err) = wait_for_os_signal().await {
                tracing::error!(?err, "Error waiting for shutdown signal");
            }
            info!("Shutdown signal received");
            shutdown.shutdown();
        });
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_os_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn await_shutdown_resolves_after_signal() {
        let shutdown = Arc::new(Shutdown::new());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.await_shutdown().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("await_shutdown did not resolve")
            .unwrap();
    }

    #[test]
    fn is_shutting_down_reflects_current_state() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_shutting_down());
        shutdown.shutdown();
        assert!(shutdown.is_shutting_down());
    }
}
