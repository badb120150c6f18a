//! Async access to one side of a pseudo-terminal.
//!
//! A [`TerminalHandle`] is the single owner of its file descriptor. Closing it
//! goes through [`TerminalHandle::take_and_close`], which moves the descriptor
//! out before dropping it, so a handle can be closed from any task at most
//! once. Closing also wakes every read or write still pending on the handle.

use crate::signal::Signal;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::unix::AsyncFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSide {
    /// The device the VM is attached to (pty slave).
    Input,
    /// The side the harness reads console output from (pty master).
    Output,
}

impl fmt::Display for TerminalSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalSide::Input => f.write_str("input"),
            TerminalSide::Output => f.write_str("output"),
        }
    }
}

pub struct TerminalHandle {
    side: TerminalSide,
    fd: Mutex<Option<AsyncFd<OwnedFd>>>,
    closed: Signal,
}

impl TerminalHandle {
    /// Wraps `fd`, switching it to non-blocking mode.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(side: TerminalSide, fd: OwnedFd) -> io::Result<Self> {
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;

        Ok(Self {
            side,
            fd: Mutex::new(Some(AsyncFd::new(fd)?)),
            closed: Signal::new(),
        })
    }

    pub fn side(&self) -> TerminalSide {
        self.side
    }

    fn lock(&self) -> MutexGuard<'_, Option<AsyncFd<OwnedFd>>> {
        self.fd.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_set()
    }

    /// Waits until the handle has been closed.
    pub async fn closed(&self) {
        self.closed.wait().await
    }

    /// Closes the descriptor if it is still open.
    ///
    /// Returns `true` if this call performed the close.
    pub fn take_and_close(&self) -> bool {
        let taken = self.lock().take();
        let performed = taken.is_some();
        // Dropping the AsyncFd deregisters it from the reactor and closes it.
        drop(taken);
        self.closed.set();

        if performed {
            tracing::debug!(side = %self.side, "closed terminal handle");
        }
        performed
    }

    /// Reads available bytes into `buf`.
    ///
    /// Returns `Ok(0)` at end of stream: when the handle has been closed, or
    /// when the pty reports `EIO` because no slave descriptor is open anymore.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            biased;
            _ = self.closed.wait() => Ok(0),
            result = poll_fn(|cx| self.poll_read(cx, buf)) => result,
        }
    }

    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let guard = self.lock();
        let Some(fd) = guard.as_ref() else {
            return Poll::Ready(Ok(0));
        };

        loop {
            let mut ready = match fd.poll_read_ready(cx) {
                Poll::Ready(Ok(ready)) => ready,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match nix::unistd::read(fd.get_ref().as_raw_fd(), buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(Errno::EAGAIN) => {
                    ready.clear_ready();
                    continue;
                }
                Err(Errno::EIO) => return Poll::Ready(Ok(0)),
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }

    /// Writes some of `buf`, returning how many bytes were accepted.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        tokio::select! {
            biased;
            _ = self.closed.wait() => Err(closed_error(self.side)),
            result = poll_fn(|cx| self.poll_write(cx, buf)) => result,
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let guard = self.lock();
        let Some(fd) = guard.as_ref() else {
            return Poll::Ready(Err(closed_error(self.side)));
        };

        loop {
            let mut ready = match fd.poll_write_ready(cx) {
                Poll::Ready(Ok(ready)) => ready,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match nix::unistd::write(fd.get_ref(), buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(Errno::EAGAIN) => {
                    ready.clear_ready();
                    continue;
                }
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }
}

impl fmt::Debug for TerminalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalHandle")
            .field("side", &self.side)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for TerminalHandle {
    fn drop(&mut self) {
        self.take_and_close();
    }
}

fn closed_error(side: TerminalSide) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("{side} terminal handle is closed"),
    )
}
