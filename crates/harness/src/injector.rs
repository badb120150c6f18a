//! Types the command script into the guest once it has booted.

use crate::session::Session;
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use ttyrun_core::{
    CommandScript, Error, InjectionMode, MarkerScanner, Result, Shutdown, TerminalHandle,
};

/// Where the injector is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectorState {
    WaitingForBarrier,
    WaitingForMarker,
    Injecting,
    Done,
    AbortedByTermination,
    TimedOut,
}

/// How the injector's part of the run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionOutcome {
    /// Every command and the reboot command were typed.
    Completed {
        commands: usize,
        failed_keystrokes: usize,
    },
    /// The marker never appeared.
    MarkerTimeout { attempts: u32 },
    /// The run was terminated by something else first.
    Aborted,
    /// The injector could not type anything (see the report's errors).
    Failed,
}

/// Destination for individual keystrokes.
#[async_trait]
pub trait KeystrokeSink: Send {
    async fn send(&mut self, byte: u8) -> Result<()>;
}

nix::ioctl_write_ptr_bad!(tiocsti, libc::TIOCSTI, libc::c_char);

/// Queues keystrokes into the tty input with `TIOCSTI`, as if typed on it.
pub struct TiocstiSink {
    tty: File,
}

impl TiocstiSink {
    pub fn open(device_path: &Path) -> Result<Self> {
        let tty = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(device_path)?;
        Ok(Self { tty })
    }
}

#[async_trait]
impl KeystrokeSink for TiocstiSink {
    async fn send(&mut self, byte: u8) -> Result<()> {
        let ch = byte as libc::c_char;
        // SAFETY: the descriptor stays open for the lifetime of `self.tty`
        // and the kernel only reads the single byte behind the pointer.
        unsafe { tiocsti(self.tty.as_raw_fd(), &ch) }
            .map(drop)
            .map_err(|e| Error::Injection {
                byte,
                reason: e.to_string(),
            })
    }
}

/// Writes keystrokes to the pty master.
pub struct MasterSink {
    output: Arc<TerminalHandle>,
}

impl MasterSink {
    pub fn new(output: Arc<TerminalHandle>) -> Self {
        Self { output }
    }
}

#[async_trait]
impl KeystrokeSink for MasterSink {
    async fn send(&mut self, byte: u8) -> Result<()> {
        self.output
            .write_all(&[byte])
            .await
            .map_err(|e| Error::Injection {
                byte,
                reason: e.to_string(),
            })
    }
}

enum MarkerWait {
    Found(usize),
    Terminated,
    TimedOut(u32),
}

pub(crate) struct CommandInjector {
    pub(crate) session: Session,
    pub(crate) output: Arc<TerminalHandle>,
    pub(crate) script: CommandScript,
    pub(crate) marker: String,
    pub(crate) reboot_command: String,
    pub(crate) boot_settle_delay: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) max_retries: u32,
    pub(crate) mode: InjectionMode,
}

impl CommandInjector {
    /// Drives the injector state machine and sets the termination flag when
    /// it is done, however it ended.
    pub(crate) async fn run(self) -> Result<InjectionOutcome> {
        let shutdown = self.session.shutdown().clone();
        let _terminate = shutdown.terminate.set_on_drop();
        self.drive(&shutdown).await
    }

    async fn drive(&self, shutdown: &Shutdown) -> Result<InjectionOutcome> {
        enter(InjectorState::WaitingForBarrier);
        tokio::select! {
            biased;
            _ = shutdown.terminate.wait() => return Ok(aborted()),
            _ = shutdown.launched.wait() => {}
        }

        enter(InjectorState::WaitingForMarker);
        if self.sleep_unless_terminated(shutdown, self.boot_settle_delay).await {
            return Ok(aborted());
        }

        match self.wait_for_marker(shutdown).await {
            MarkerWait::Found(offset) => {
                tracing::info!(marker = %self.marker, offset, "boot marker observed");
            }
            MarkerWait::Terminated => return Ok(aborted()),
            MarkerWait::TimedOut(attempts) => {
                enter(InjectorState::TimedOut);
                tracing::warn!(
                    marker = %self.marker,
                    attempts,
                    "boot marker not observed; giving up"
                );
                return Ok(InjectionOutcome::MarkerTimeout { attempts });
            }
        }

        enter(InjectorState::Injecting);
        let mut sink = self.open_sink()?;
        let mut failed_keystrokes = 0;

        for line in self.script.lines() {
            if shutdown.terminate.is_set() {
                return Ok(aborted());
            }
            tracing::info!(command = %line, "typing command");
            failed_keystrokes += type_line(sink.as_mut(), line).await;
        }

        tracing::info!(command = %self.reboot_command, "typing reboot command");
        failed_keystrokes += type_line(sink.as_mut(), &self.reboot_command).await;

        enter(InjectorState::Done);
        if failed_keystrokes > 0 {
            tracing::warn!(failed_keystrokes, "some keystrokes could not be injected");
        }
        Ok(InjectionOutcome::Completed {
            commands: self.script.len(),
            failed_keystrokes,
        })
    }

    /// Returns `true` if the run was terminated before `delay` elapsed.
    async fn sleep_unless_terminated(&self, shutdown: &Shutdown, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.terminate.wait() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// Rescans the capture on every appended chunk; each elapsed poll
    /// interval counts as one retry.
    async fn wait_for_marker(&self, shutdown: &Shutdown) -> MarkerWait {
        let capture = self.session.capture();
        let mut updates = capture.subscribe();
        let mut updates_open = true;
        let mut scanner = MarkerScanner::new(self.marker.as_str());

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut attempts = 0;

        loop {
            if let Some(offset) = scanner.scan(capture) {
                return MarkerWait::Found(offset);
            }

            tokio::select! {
                biased;
                _ = shutdown.terminate.wait() => return MarkerWait::Terminated,
                changed = updates.changed(), if updates_open => {
                    updates_open = changed.is_ok();
                }
                _ = ticker.tick() => {
                    attempts += 1;
                    tracing::trace!(attempts, "marker not seen yet");
                    if attempts >= self.max_retries {
                        return match scanner.scan(capture) {
                            Some(offset) => MarkerWait::Found(offset),
                            None => MarkerWait::TimedOut(attempts),
                        };
                    }
                }
            }
        }
    }

    fn open_sink(&self) -> Result<Box<dyn KeystrokeSink>> {
        match self.mode {
            InjectionMode::Tiocsti => {
                let device_path = self.session.device_path().ok_or_else(|| {
                    Error::Injection {
                        byte: 0,
                        reason: "pty device path was not published".into(),
                    }
                })?;
                tracing::debug!(tty = %device_path.display(), "attached to tty");
                Ok(Box::new(TiocstiSink::open(&device_path)?))
            }
            InjectionMode::Master => Ok(Box::new(MasterSink::new(self.output.clone()))),
        }
    }
}

fn enter(state: InjectorState) {
    tracing::debug!(?state, "injector state");
}

fn aborted() -> InjectionOutcome {
    enter(InjectorState::AbortedByTermination);
    InjectionOutcome::Aborted
}

/// Types `line` and a newline one byte at a time. Returns how many
/// keystrokes failed.
async fn type_line(sink: &mut dyn KeystrokeSink, line: &str) -> usize {
    let mut failed = 0;
    for byte in line.bytes().chain(std::iter::once(b'\n')) {
        if let Err(e) = sink.send(byte).await {
            tracing::warn!(error = %e, "keystroke injection failed");
            failed += 1;
        }
    }
    failed
}
