//! Shared state of one harness run.
//!
//! A [`Session`] is handed to every task of a run and can be cloned freely to
//! observe the console while the run is in progress:
//!
//! ```rust,no_run
//! # use std::time::Duration;
//! # async fn example(harness: ttyrun::Harness) -> ttyrun::Result<()> {
//! let session = ttyrun::Session::new();
//! let observer = session.clone();
//!
//! let run = tokio::spawn(async move { harness.run(&session).await });
//! assert!(observer.wait_for_output("Starting network: OK", Duration::from_secs(60)).await);
//!
//! let report = run.await.expect("run task panicked")?;
//! assert!(report.output_contains("reboot: machine restart"));
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use ttyrun_core::{CaptureBuffer, Error, Result, Shutdown};
use uuid::Uuid;

#[derive(Debug, Default)]
struct SessionInner {
    device_path: RwLock<Option<PathBuf>>,
    capture: CaptureBuffer,
    shutdown: Shutdown,
    active: AtomicBool,
    run_id: Mutex<Option<Uuid>>,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears everything left over from a previous run.
    ///
    /// Fails with [`Error::SessionActive`] while a run is in progress.
    pub fn reset(&self) -> Result<()> {
        // Holding the active flag keeps a concurrent `begin` out while
        // clearing.
        self.claim()?;
        self.clear();
        self.inner.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn claim(&self) -> Result<()> {
        self.inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(drop)
            .map_err(|_| Error::SessionActive)
    }

    fn clear(&self) {
        *self
            .inner
            .device_path
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.inner.capture.clear();
        self.inner.shutdown.reset();
    }

    /// Marks the session active and resets it for a new run.
    pub(crate) fn begin(&self) -> Result<ActiveRun> {
        self.claim()?;
        self.clear();
        let id = Uuid::new_v4();
        *self
            .inner
            .run_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);

        Ok(ActiveRun {
            session: self.clone(),
            id,
        })
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Id of the current (or most recent) run.
    pub fn run_id(&self) -> Option<Uuid> {
        *self
            .inner
            .run_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the pty device path and releases the launch barrier.
    pub(crate) fn publish_device_path(&self, path: PathBuf) {
        *self
            .inner
            .device_path
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(path);
        self.inner.shutdown.launched.set();
    }

    /// The pty device path, once the launch barrier has been released.
    pub fn device_path(&self) -> Option<PathBuf> {
        if !self.inner.shutdown.launched.is_set() {
            return None;
        }
        self.inner
            .device_path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn capture(&self) -> &CaptureBuffer {
        &self.inner.capture
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.inner.shutdown
    }

    /// Asks every task of the current run to stop.
    ///
    /// Returns `true` if this call initiated the shutdown.
    pub fn terminate(&self) -> bool {
        self.inner.shutdown.terminate.set()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.shutdown.terminate.is_set()
    }

    pub fn output(&self) -> String {
        self.inner.capture.text()
    }

    pub fn output_contains(&self, needle: &str) -> bool {
        self.inner.capture.contains(needle)
    }

    pub fn output_matches(&self, pattern: &str) -> Result<Vec<String>> {
        self.inner.capture.matches(pattern)
    }

    /// Waits until `needle` shows up in the console output.
    ///
    /// Returns `false` if it did not appear within `limit`.
    pub async fn wait_for_output(&self, needle: &str, limit: Duration) -> bool {
        let mut updates = self.inner.capture.subscribe();
        let found = async {
            loop {
                if self.output_contains(needle) {
                    return true;
                }
                if updates.changed().await.is_err() {
                    return self.output_contains(needle);
                }
            }
        };
        tokio::time::timeout(limit, found).await.unwrap_or(false)
    }
}

/// Keeps a session marked active for the duration of a run.
#[derive(Debug)]
pub(crate) struct ActiveRun {
    session: Session,
    id: Uuid,
}

impl ActiveRun {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.session.inner.active.store(false, Ordering::SeqCst);
    }
}
