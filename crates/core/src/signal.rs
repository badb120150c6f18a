//! One-shot broadcast signals shared by the harness tasks.
//!
//! A [`Signal`] is level-triggered: once set it stays set until the owning
//! session is reset, and every waiter (including ones that arrive late)
//! observes it.

use std::sync::Arc;
use tokio::sync::watch;

/// Level-triggered, multi-reader boolean signal.
#[derive(Debug, Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Sets the signal and wakes all waiters.
    ///
    /// Returns `true` if this call flipped the signal, `false` if it was
    /// already set.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|value| {
            if *value {
                false
            } else {
                *value = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the signal is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|value| *value).await;
    }

    /// Clears the signal. Must only be called while no run is using it.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Returns a guard that sets the signal when dropped, including during
    /// unwinding.
    pub fn set_on_drop(&self) -> SetOnDrop {
        SetOnDrop(self.clone())
    }
}

/// Sets a [`Signal`] when dropped.
#[derive(Debug)]
pub struct SetOnDrop(Signal);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// The signals that coordinate startup and shutdown of one run.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    /// Set once the pty exists and its device path is published.
    pub launched: Signal,
    /// Set by whichever task first decides the run is over.
    pub terminate: Signal,
    /// Set when the build tool process is gone.
    pub exited: Signal,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.launched.reset();
        self.terminate.reset();
        self.exited.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn set_is_idempotent() {
        let signal = Signal::new();
        assert!(!signal.is_set());
        assert!(signal.set());
        assert!(!signal.set());
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_set() {
        let signal = Signal::new();
        signal.set();
        timeout(Duration::from_millis(50), signal.wait())
            .await
            .expect("wait blocked on a set signal");
    }

    #[tokio::test]
    async fn wait_wakes_all_waiters() {
        let signal = Signal::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.set();

        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter not woken")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn reset_clears_signal() {
        let signal = Signal::new();
        signal.set();
        signal.reset();
        assert!(!signal.is_set());
        assert!(
            timeout(Duration::from_millis(20), signal.wait())
                .await
                .is_err()
        );
    }

    #[test]
    fn set_on_drop_sets_signal() {
        let signal = Signal::new();
        {
            let _guard = signal.set_on_drop();
            assert!(!signal.is_set());
        }
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn set_on_drop_fires_when_task_panics() {
        let signal = Signal::new();
        let task = {
            let guard = signal.set_on_drop();
            tokio::spawn(async move {
                let _guard = guard;
                panic!("task failed");
            })
        };
        assert!(task.await.is_err());
        assert!(signal.is_set());
    }

    #[test]
    fn shutdown_signals_are_independent() {
        let shutdown = Shutdown::new();
        shutdown.terminate.set();
        assert!(!shutdown.launched.is_set());
        assert!(!shutdown.exited.is_set());

        shutdown.reset();
        assert!(!shutdown.terminate.is_set());
    }
}
