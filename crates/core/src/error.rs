/// Errors that can occur while driving a VM console session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to allocate pseudo-terminal: {0}")]
    Allocation(String),

    #[error("permission error: {0}")]
    Permission(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("failed to inject keystroke {byte:#04x}: {reason}")]
    Injection { byte: u8, reason: String },

    #[error("build tool failed: {0}")]
    Subprocess(String),

    #[error("marker '{marker}' not observed after {attempts} polls")]
    MarkerTimeout { marker: String, attempts: u32 },

    #[error("session is already running")]
    SessionActive,

    #[error("invalid output pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("harness task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for errors that stop a run before any task is started.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Allocation(_)
                | Error::Permission(_)
                | Error::Configuration(_)
                | Error::SessionActive
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
