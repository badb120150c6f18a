pub mod capture;
pub mod config;
pub mod error;
pub mod script;
pub mod signal;
pub mod terminal;

pub use capture::{CaptureBuffer, MarkerScanner};
pub use config::{
    BuildTool, DEFAULT_MARKER, DEFAULT_REBOOT_COMMAND, DEFAULT_TTY_ENV, InjectionMode,
    PtyOwnership, RunConfig, RunConfigBuilder,
};
pub use error::{Error, Result};
pub use script::CommandScript;
pub use signal::{SetOnDrop, Shutdown, Signal};
pub use terminal::{TerminalHandle, TerminalSide};
