//! Drive a VM through its serial console for integration testing.
//!
//! `ttyrun` allocates a pseudo-terminal, starts the build tool that boots the
//! VM with its serial console wired to that pty, waits for the guest to print
//! a boot marker, types a script of shell commands into it one keystroke at a
//! time, and records everything the guest prints until it reboots.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ttyrun::{BuildTool, CommandScript, RunConfig};
//!
//! # async fn example() -> ttyrun::Result<()> {
//! let config = RunConfig::builder(
//!     BuildTool::make("./fs/nilfs-dedup"),
//!     CommandScript::new(["mount -t nilfs2 /dev/vdb /mnt", "nilfs-dedup /mnt"])?,
//! )
//! .build()?;
//!
//! let report = ttyrun::run(config).await?;
//! report.ensure_booted()?;
//! assert!(report.output_contains("deduplicated"));
//! # Ok(())
//! # }
//! ```
//!
//! # Runs
//!
//! A run is four cooperating tasks sharing one [`Session`]:
//!
//! - output capture reads the pty master into the session's capture buffer;
//! - the launcher runs the build tool with the pty path in `SERIAL_TTY`;
//! - the injector waits for the marker, types the script and the reboot
//!   command, then ends the run;
//! - the finalizer closes both pty sides once the tool has exited.
//!
//! Every wait is bounded, so a guest that never boots still ends the run after
//! `poll_interval * max_retries`. Use [`Harness`] with your own [`Session`] to
//! watch the console or terminate the run from elsewhere.

mod capture;
mod finalizer;
mod injector;
mod launcher;
mod pty;
mod runner;
mod session;

pub use injector::{InjectionOutcome, InjectorState, KeystrokeSink, MasterSink, TiocstiSink};
pub use pty::{AllocatedPty, InvokingUser, PtyAllocator};
pub use runner::{Harness, RunReport, run};
pub use session::Session;

// Configuration
pub use ttyrun_core::{
    BuildTool, CommandScript, DEFAULT_MARKER, DEFAULT_REBOOT_COMMAND, DEFAULT_TTY_ENV,
    InjectionMode, PtyOwnership, RunConfig, RunConfigBuilder,
};

// Errors
pub use ttyrun_core::{Error, Result};

// Building blocks
pub use ttyrun_core::{CaptureBuffer, Shutdown, Signal, TerminalHandle, TerminalSide};
