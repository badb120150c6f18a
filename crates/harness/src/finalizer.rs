use crate::session::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use ttyrun_core::{Signal, TerminalHandle};

/// Releases both pty sides once the run is over.
pub(crate) struct ResourceFinalizer {
    pub(crate) session: Session,
    pub(crate) input: TerminalHandle,
    pub(crate) output: Arc<TerminalHandle>,
    pub(crate) capture_done: Signal,
    pub(crate) shutdown_grace: Duration,
    pub(crate) poll_interval: Duration,
}

impl ResourceFinalizer {
    /// Returns `true` if this task closed the output side, `false` if it was
    /// already closed.
    pub(crate) async fn run(self) -> bool {
        let shutdown = self.session.shutdown();
        shutdown.launched.wait().await;
        shutdown.terminate.wait().await;
        tracing::debug!("termination observed; finalizing pty");

        let exit_wait = self.shutdown_grace + self.poll_interval;
        if timeout(exit_wait, shutdown.exited.wait()).await.is_err() {
            tracing::warn!(waited = ?exit_wait, "build tool still running; closing pty anyway");
        }

        self.input.take_and_close();

        if timeout(self.poll_interval, self.capture_done.wait())
            .await
            .is_err()
        {
            tracing::debug!("capture still pending; forcing it off the console");
        }

        let released = self.output.take_and_close();
        tracing::debug!(released, "pty released");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use ttyrun_core::TerminalSide;

    fn finalizer(session: &Session, grace: Duration) -> (ResourceFinalizer, Arc<TerminalHandle>) {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let output = Arc::new(TerminalHandle::new(TerminalSide::Output, read_fd).unwrap());
        let task = ResourceFinalizer {
            session: session.clone(),
            input: TerminalHandle::new(TerminalSide::Input, write_fd).unwrap(),
            output: output.clone(),
            capture_done: Signal::new(),
            shutdown_grace: grace,
            poll_interval: Duration::from_millis(20),
        };
        (task, output)
    }

    #[tokio::test]
    async fn waits_for_termination_before_closing() {
        let session = Session::new();
        session.publish_device_path(PathBuf::from("/dev/null"));
        let (task, output) = finalizer(&session, Duration::from_secs(1));

        let handle = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!output.is_closed());

        session.shutdown().exited.set();
        session.terminate();
        assert!(handle.await.unwrap());
        assert!(output.is_closed());
    }

    #[tokio::test]
    async fn reports_output_already_closed() {
        let session = Session::new();
        session.publish_device_path(PathBuf::from("/dev/null"));
        session.shutdown().exited.set();
        session.terminate();

        let (task, output) = finalizer(&session, Duration::from_secs(1));
        output.take_and_close();
        assert!(!task.run().await);
    }

    #[tokio::test]
    async fn closes_even_if_tool_never_exits() {
        let session = Session::new();
        session.publish_device_path(PathBuf::from("/dev/null"));
        session.terminate();

        let (task, output) = finalizer(&session, Duration::from_millis(30));
        let released = tokio::time::timeout(Duration::from_secs(1), task.run())
            .await
            .expect("finalizer hung on a running tool");
        assert!(released);
        assert!(output.is_closed());
    }

    #[tokio::test]
    async fn wakes_pending_reader() {
        let session = Session::new();
        session.publish_device_path(PathBuf::from("/dev/null"));
        let (task, output) = finalizer(&session, Duration::from_secs(1));

        let reader = {
            let output = output.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                output.read(&mut buf).await
            })
        };

        session.shutdown().exited.set();
        session.terminate();
        task.run().await;

        let read = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader not woken by close")
            .unwrap();
        assert_eq!(read.unwrap(), 0);
    }
}
