use crate::session::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use ttyrun_core::{Result, Signal, TerminalHandle};

const READ_CHUNK: usize = 4096;

/// Pumps console output from the pty master into the session's capture
/// buffer.
pub(crate) struct OutputCapture {
    pub(crate) session: Session,
    pub(crate) output: Arc<TerminalHandle>,
    pub(crate) poll_interval: Duration,
    pub(crate) mirror_console: bool,
    pub(crate) finished: Signal,
}

impl OutputCapture {
    /// Returns the number of bytes captured.
    pub(crate) async fn run(self) -> Result<usize> {
        let _finished = self.finished.set_on_drop();
        let result = self.pump().await;
        match &result {
            Ok(total) => tracing::debug!(bytes = total, "output capture stopped"),
            Err(e) => tracing::warn!(error = %e, "output capture failed"),
        }
        result
    }

    async fn pump(&self) -> Result<usize> {
        let capture = self.session.capture();
        let shutdown = self.session.shutdown();
        let mut stdout = self.mirror_console.then(tokio::io::stdout);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut total = 0;

        loop {
            match timeout(self.poll_interval, self.output.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    tracing::debug!(closed = self.output.is_closed(), "console stream ended");
                    return Ok(total);
                }
                Ok(Ok(n)) => {
                    capture.append(&buf[..n]);
                    total += n;
                    mirror_chunk(&mut stdout, &buf[..n]).await;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    // Quiet poll boundary. Stop only once nothing can print
                    // to the console anymore.
                    if shutdown.terminate.is_set() && shutdown.exited.is_set() {
                        tracing::debug!("termination observed at poll boundary");
                        return Ok(total);
                    }
                }
            }
        }
    }
}

/// Copies `chunk` to the mirror, dropping the mirror after its first failure.
async fn mirror_chunk<W: AsyncWrite + Unpin>(mirror: &mut Option<W>, chunk: &[u8]) {
    let Some(writer) = mirror.as_mut() else {
        return;
    };
    let written = match writer.write_all(chunk).await {
        Ok(()) => writer.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        tracing::debug!(error = %e, "console mirror failed; no longer mirroring");
        *mirror = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ttyrun_core::TerminalSide;

    fn capture_task(session: &Session, output: Arc<TerminalHandle>) -> OutputCapture {
        OutputCapture {
            session: session.clone(),
            output,
            poll_interval: Duration::from_millis(20),
            mirror_console: false,
            finished: Signal::new(),
        }
    }

    #[tokio::test]
    async fn mirror_copies_chunks() {
        let mut mirror = Some(Vec::new());
        mirror_chunk(&mut mirror, b"Starting network: OK\r\n").await;
        mirror_chunk(&mut mirror, b"# ").await;
        assert_eq!(mirror.unwrap(), b"Starting network: OK\r\n# ");
    }

    #[tokio::test]
    async fn mirror_is_dropped_after_write_failure() {
        let (writer, reader) = tokio::io::duplex(16);
        drop(reader);

        let mut mirror = Some(writer);
        mirror_chunk(&mut mirror, b"lost").await;
        assert!(mirror.is_none());
        mirror_chunk(&mut mirror, b"ignored").await;
    }

    #[tokio::test]
    async fn captures_in_arrival_order_until_eof() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let output = Arc::new(TerminalHandle::new(TerminalSide::Output, read_fd).unwrap());
        let session = Session::new();

        let task = tokio::spawn(capture_task(&session, output).run());

        nix::unistd::write(&write_fd, b"first ").unwrap();
        nix::unistd::write(&write_fd, b"second").unwrap();
        drop(write_fd);

        let total = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(total, 12);
        assert_eq!(session.output(), "first second");
    }

    #[tokio::test]
    async fn stops_when_handle_is_force_closed() {
        let (read_fd, _write_fd) = nix::unistd::pipe().unwrap();
        let output = Arc::new(TerminalHandle::new(TerminalSide::Output, read_fd).unwrap());
        let session = Session::new();
        let capture = capture_task(&session, output.clone());
        let finished = capture.finished.clone();

        let task = tokio::spawn(capture.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(output.take_and_close());

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("capture did not stop after close")
            .unwrap()
            .unwrap();
        assert!(finished.is_set());
    }

    #[tokio::test]
    async fn stops_at_quiet_boundary_after_shutdown() {
        let (read_fd, _write_fd) = nix::unistd::pipe().unwrap();
        let output = Arc::new(TerminalHandle::new(TerminalSide::Output, read_fd).unwrap());
        let session = Session::new();

        let task = tokio::spawn(capture_task(&session, output).run());

        session.shutdown().exited.set();
        session.terminate();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("capture ignored termination")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn keeps_reading_while_tool_is_still_running() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let output = Arc::new(TerminalHandle::new(TerminalSide::Output, read_fd).unwrap());
        let session = Session::new();

        let task = tokio::spawn(capture_task(&session, output).run());
        session.terminate();

        tokio::time::sleep(Duration::from_millis(60)).await;
        nix::unistd::write(&write_fd, b"reboot: machine restart").unwrap();
        drop(write_fd);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(session.output_contains("reboot: machine restart"));
    }
}
