use crate::error::{Error, Result};
use crate::script::CommandScript;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MARKER: &str = "Starting network: OK";
pub const DEFAULT_TTY_ENV: &str = "SERIAL_TTY";
pub const DEFAULT_REBOOT_COMMAND: &str = "reboot";
pub const DEFAULT_BOOT_SETTLE_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRIES: u32 = 600;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// External program that builds and boots the VM on a given serial tty.
///
/// The tool is run once with `tty_env` set to the pty device path. Only its
/// exit status and what it prints to that tty are observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTool {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_tty_env")]
    pub tty_env: String,
}

fn default_tty_env() -> String {
    DEFAULT_TTY_ENV.to_string()
}

impl BuildTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            tty_env: default_tty_env(),
        }
    }

    /// `make -C <dir> vm-tty`, the target that boots the VM on `$SERIAL_TTY`.
    pub fn make(dir: impl AsRef<Path>) -> Self {
        Self::new("make")
            .arg("-C")
            .arg(dir.as_ref().to_string_lossy())
            .arg("vm-tty")
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn tty_env(mut self, name: impl Into<String>) -> Self {
        self.tty_env = name.into();
        self
    }
}

/// Who should own the pty device nodes after allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PtyOwnership {
    /// Hand both nodes to the user recorded in `SUDO_UID`/`SUDO_GID`.
    #[default]
    InvokingUser,
    /// Leave ownership as created.
    Unchanged,
}

/// How keystrokes reach the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionMode {
    /// Push each byte into the tty input queue with `TIOCSTI`.
    #[default]
    Tiocsti,
    /// Write each byte to the pty master, as a terminal emulator would.
    Master,
}

/// Everything one harness run needs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub build_tool: BuildTool,
    pub script: CommandScript,
    pub marker: String,
    pub boot_settle_delay: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub reboot_command: String,
    pub shutdown_grace: Duration,
    pub mirror_console: bool,
    pub ownership: PtyOwnership,
    pub injection: InjectionMode,
}

impl RunConfig {
    pub fn builder(build_tool: BuildTool, script: CommandScript) -> RunConfigBuilder {
        RunConfigBuilder::new(build_tool, script)
    }

    /// Longest time the injector polls for the marker after settling.
    pub fn marker_deadline(&self) -> Duration {
        self.poll_interval.saturating_mul(self.max_retries)
    }

    pub fn validate(&self) -> Result<()> {
        if self.marker.is_empty() {
            return Err(Error::Configuration("marker text is empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Configuration(
                "poll interval must be greater than zero".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(Error::Configuration("max retries must be at least 1".into()));
        }
        if self.reboot_command.is_empty() || self.reboot_command.contains('\n') {
            return Err(Error::Configuration(format!(
                "invalid reboot command: {:?}",
                self.reboot_command
            )));
        }
        if self.build_tool.tty_env.is_empty() || self.build_tool.tty_env.contains('=') {
            return Err(Error::Configuration(format!(
                "invalid tty environment variable name: {:?}",
                self.build_tool.tty_env
            )));
        }
        Ok(())
    }
}

/// Builder for [`RunConfig`].
///
/// ```
/// use std::time::Duration;
/// use ttyrun_core::{BuildTool, CommandScript, RunConfig};
///
/// let config = RunConfig::builder(
///     BuildTool::make("fs/nilfs-dedup"),
///     CommandScript::new(["echo hi"]).unwrap(),
/// )
/// .poll_interval(Duration::from_millis(200))
/// .build()
/// .unwrap();
/// assert_eq!(config.marker, "Starting network: OK");
/// ```
#[derive(Debug, Clone)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    pub fn new(build_tool: BuildTool, script: CommandScript) -> Self {
        Self {
            config: RunConfig {
                build_tool,
                script,
                marker: DEFAULT_MARKER.to_string(),
                boot_settle_delay: DEFAULT_BOOT_SETTLE_DELAY,
                poll_interval: DEFAULT_POLL_INTERVAL,
                max_retries: DEFAULT_MAX_RETRIES,
                reboot_command: DEFAULT_REBOOT_COMMAND.to_string(),
                shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
                mirror_console: false,
                ownership: PtyOwnership::default(),
                injection: InjectionMode::default(),
            },
        }
    }

    pub fn marker(mut self, marker: impl Into<String>) -> Self {
        self.config.marker = marker.into();
        self
    }

    pub fn boot_settle_delay(mut self, delay: Duration) -> Self {
        self.config.boot_settle_delay = delay;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn reboot_command(mut self, command: impl Into<String>) -> Self {
        self.config.reboot_command = command.into();
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn mirror_console(mut self, mirror: bool) -> Self {
        self.config.mirror_console = mirror;
        self
    }

    pub fn ownership(mut self, ownership: PtyOwnership) -> Self {
        self.config.ownership = ownership;
        self
    }

    pub fn injection(mut self, mode: InjectionMode) -> Self {
        self.config.injection = mode;
        self
    }

    pub fn build(self) -> Result<RunConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> CommandScript {
        CommandScript::new(["echo hi"]).unwrap()
    }

    #[test]
    fn make_tool_targets_vm_tty() {
        let tool = BuildTool::make("../../fs/nilfs-dedup");
        assert_eq!(tool.program, PathBuf::from("make"));
        assert_eq!(tool.args, ["-C", "../../fs/nilfs-dedup", "vm-tty"]);
        assert_eq!(tool.tty_env, "SERIAL_TTY");
    }

    #[test]
    fn builder_defaults() {
        let config = RunConfig::builder(BuildTool::new("true"), script())
            .build()
            .unwrap();
        assert_eq!(config.marker, DEFAULT_MARKER);
        assert_eq!(config.reboot_command, "reboot");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.ownership, PtyOwnership::InvokingUser);
        assert_eq!(config.injection, InjectionMode::Tiocsti);
        assert!(!config.mirror_console);
    }

    #[test]
    fn marker_deadline_is_interval_times_retries() {
        let config = RunConfig::builder(BuildTool::new("true"), script())
            .poll_interval(Duration::from_millis(250))
            .max_retries(8)
            .build()
            .unwrap();
        assert_eq!(config.marker_deadline(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_empty_marker() {
        let err = RunConfig::builder(BuildTool::new("true"), script())
            .marker("")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let err = RunConfig::builder(BuildTool::new("true"), script())
            .poll_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_zero_retries() {
        let err = RunConfig::builder(BuildTool::new("true"), script())
            .max_retries(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_bad_tty_env() {
        let err = RunConfig::builder(BuildTool::new("true").tty_env("A=B"), script())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn ownership_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&PtyOwnership::InvokingUser).unwrap(),
            "\"invoking-user\""
        );
        assert_eq!(
            serde_json::from_str::<InjectionMode>("\"master\"").unwrap(),
            InjectionMode::Master
        );
    }
}
