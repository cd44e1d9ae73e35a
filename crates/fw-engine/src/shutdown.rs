//! Cooperative halt coordination for one automation run.
//!
//! A `RunSignal` is created on enable and halted on disable or shutdown.
//! Workers observe it between suspension points and before dispatch; a halt
//! leaves queued actions in place for the next run.

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RunSignal {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl RunSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Ask every subscriber to stop. Idempotent.
    pub fn halt(&self) {
        let already = self.tx.send_replace(true);
        if !already {
            info!("run halt signalled");
        }
    }

    /// Non-blocking check, for use before dispatch.
    pub fn is_halted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the run is halted. Safe to race against other futures
    /// in `select!`.
    pub async fn halted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped: treat as halted.
                return;
            }
        }
    }
}

impl Default for RunSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fresh_signal_is_running() {
        let signal = RunSignal::new();
        assert!(!signal.is_halted());
    }

    #[test]
    fn halt_is_idempotent_and_visible_to_clones() {
        let signal = RunSignal::new();
        let observer = signal.clone();
        signal.halt();
        signal.halt();
        assert!(observer.is_halted());
    }

    #[tokio::test]
    async fn halted_future_resolves_on_halt() {
        let signal = RunSignal::new();
        let observer = signal.clone();
        let waiter = tokio::spawn(async move { observer.halted().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.halt();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("halted() should resolve promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn halted_future_resolves_immediately_when_already_halted() {
        let signal = RunSignal::new();
        signal.halt();
        tokio::time::timeout(Duration::from_millis(50), signal.halted())
            .await
            .expect("already-halted signal should resolve at once");
    }
}
