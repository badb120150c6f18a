//! The `run` command - boots the VM and drives its console.

use crate::file_config::FileConfig;
use anyhow::{Context, bail};
use clap::{Args, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use ttyrun::{
    BuildTool, CommandScript, Harness, InjectionMode, InjectionOutcome, PtyOwnership, RunConfig,
    RunReport, Session,
};

pub const EXIT_HARNESS_ERROR: u8 = 1;
pub const EXIT_MARKER_TIMEOUT: u8 = 2;
pub const EXIT_TOOL_FAILED: u8 = 3;

const DEFAULT_OUTPUT_FILE: &str = "tty_output.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InjectionArg {
    /// Push keystrokes into the tty with TIOCSTI (needs root on recent kernels)
    Tiocsti,
    /// Write keystrokes to the pty master
    Master,
}

impl From<InjectionArg> for InjectionMode {
    fn from(arg: InjectionArg) -> Self {
        match arg {
            InjectionArg::Tiocsti => InjectionMode::Tiocsti,
            InjectionArg::Master => InjectionMode::Master,
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Path to a TOML file with defaults for any of these options
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Directory with the Makefile whose `vm-tty` target boots the VM
    #[arg(long)]
    path_to_makefile: Option<PathBuf>,

    /// File with setup commands, typed before the command list
    #[arg(long)]
    command_list_setup: Option<PathBuf>,

    /// File with the commands to type, one per line
    #[arg(long)]
    command_list: Option<PathBuf>,

    /// Where to write the console transcript [default: tty_output.txt]
    #[arg(long)]
    output_file: Option<PathBuf>,

    /// Mirror the console to stdout while running
    #[arg(long)]
    show_output: bool,

    /// Console text that means the guest has finished booting
    #[arg(long)]
    marker: Option<String>,

    /// Command typed after the script to end the run
    #[arg(long)]
    reboot_command: Option<String>,

    /// Delay before looking for the marker, in milliseconds
    #[arg(long)]
    boot_settle_ms: Option<u64>,

    /// Marker poll interval, in milliseconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval_ms: Option<u64>,

    /// Number of polls before giving up on the marker
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_retries: Option<u32>,

    /// How long the build tool may keep running after the run ends, in seconds
    #[arg(long)]
    shutdown_grace_secs: Option<u64>,

    /// How keystrokes are delivered to the guest
    #[arg(long, value_enum)]
    injection: Option<InjectionArg>,

    /// Leave the pty owned by the current user instead of the sudo caller
    #[arg(long)]
    no_chown: bool,
}

/// Flags merged over the optional config file.
#[derive(Debug)]
struct Settings {
    build_tool: BuildTool,
    command_list_setup: Option<PathBuf>,
    command_list: PathBuf,
    output_file: PathBuf,
    show_output: bool,
    no_chown: bool,
    marker: Option<String>,
    reboot_command: Option<String>,
    boot_settle: Option<Duration>,
    poll_interval: Option<Duration>,
    max_retries: Option<u32>,
    shutdown_grace: Option<Duration>,
    injection: Option<InjectionMode>,
}

impl Settings {
    fn resolve(args: RunArgs) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let build_tool = match (args.path_to_makefile, file.build_tool, file.path_to_makefile) {
            (Some(dir), _, _) => BuildTool::make(dir),
            (None, Some(tool), _) => tool,
            (None, None, Some(dir)) => BuildTool::make(dir),
            (None, None, None) => bail!("--path-to-makefile is required"),
        };

        let command_list = args
            .command_list
            .or(file.command_list)
            .context("--command-list is required")?;

        Ok(Self {
            build_tool,
            command_list_setup: args.command_list_setup.or(file.command_list_setup),
            command_list,
            output_file: args
                .output_file
                .or(file.output_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_FILE)),
            show_output: args.show_output || file.show_output.unwrap_or(false),
            no_chown: args.no_chown || file.no_chown.unwrap_or(false),
            marker: args.marker.or(file.marker),
            reboot_command: args.reboot_command.or(file.reboot_command),
            boot_settle: args
                .boot_settle_ms
                .or(file.boot_settle_ms)
                .map(Duration::from_millis),
            poll_interval: args
                .poll_interval_ms
                .or(file.poll_interval_ms)
                .map(Duration::from_millis),
            max_retries: args.max_retries.or(file.max_retries),
            shutdown_grace: args
                .shutdown_grace_secs
                .or(file.shutdown_grace_secs)
                .map(Duration::from_secs),
            injection: args.injection.map(Into::into).or(file.injection),
        })
    }

    fn load_script(&self) -> anyhow::Result<CommandScript> {
        let commands = read_script(&self.command_list)?;
        match &self.command_list_setup {
            Some(setup) => Ok(read_script(setup)?.then(commands)),
            None => Ok(commands),
        }
    }

    fn run_config(&self, script: CommandScript) -> anyhow::Result<RunConfig> {
        let mut builder = RunConfig::builder(self.build_tool.clone(), script)
            .mirror_console(self.show_output)
            .ownership(if self.no_chown {
                PtyOwnership::Unchanged
            } else {
                PtyOwnership::InvokingUser
            });

        if let Some(marker) = &self.marker {
            builder = builder.marker(marker.clone());
        }
        if let Some(command) = &self.reboot_command {
            builder = builder.reboot_command(command.clone());
        }
        if let Some(delay) = self.boot_settle {
            builder = builder.boot_settle_delay(delay);
        }
        if let Some(interval) = self.poll_interval {
            builder = builder.poll_interval(interval);
        }
        if let Some(retries) = self.max_retries {
            builder = builder.max_retries(retries);
        }
        if let Some(grace) = self.shutdown_grace {
            builder = builder.shutdown_grace(grace);
        }
        if let Some(mode) = self.injection {
            builder = builder.injection(mode);
        }

        Ok(builder.build()?)
    }
}

fn read_script(path: &Path) -> anyhow::Result<CommandScript> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not open command file {}", path.display()))?;
    CommandScript::parse(&text).with_context(|| format!("invalid command file {}", path.display()))
}

fn ensure_root() -> anyhow::Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("tty-runner must be run through sudo (or pass --no-chown)");
    }
    Ok(())
}

pub async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let settings = Settings::resolve(args)?;
    if !settings.no_chown {
        ensure_root()?;
    }

    let script = settings.load_script()?;
    let config = settings.run_config(script)?;
    let harness = Harness::new(config)?;
    let session = Session::new();

    let interrupt = {
        let session = session.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted; shutting the run down");
                session.terminate();
            }
        })
    };

    let result = harness.run(&session).await;
    interrupt.abort();
    let report = result?;

    std::fs::write(&settings.output_file, session.capture().to_vec()).with_context(|| {
        format!(
            "failed to write console output to {}",
            settings.output_file.display()
        )
    })?;
    tracing::info!(
        path = %settings.output_file.display(),
        bytes = report.captured_bytes,
        "wrote console output"
    );

    Ok(ExitCode::from(exit_code(&report)))
}

fn exit_code(report: &RunReport) -> u8 {
    if report.injection == InjectionOutcome::Aborted {
        eprintln!("Error: run was interrupted before the script was typed");
        return EXIT_HARNESS_ERROR;
    }
    if let Err(e) = report.ensure_booted() {
        eprintln!("Error: {e}");
        return EXIT_MARKER_TIMEOUT;
    }
    if report.exit_status.is_some_and(|status| !status.success()) {
        return EXIT_TOOL_FAILED;
    }
    if report.succeeded() {
        0
    } else {
        for error in &report.errors {
            eprintln!("Error: {error}");
        }
        match report.injection {
            InjectionOutcome::Completed {
                failed_keystrokes, ..
            } if failed_keystrokes > 0 => {
                eprintln!("Error: {failed_keystrokes} keystrokes could not be injected");
            }
            _ => {}
        }
        EXIT_HARNESS_ERROR
    }
}
