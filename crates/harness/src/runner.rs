use crate::capture::OutputCapture;
use crate::finalizer::ResourceFinalizer;
use crate::injector::{CommandInjector, InjectionOutcome};
use crate::launcher::SubprocessLauncher;
use crate::pty::{AllocatedPty, PtyAllocator};
use crate::session::Session;
use regex::Regex;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::Instrument;
use ttyrun_core::{Error, Result, RunConfig, Signal};
use uuid::Uuid;

/// Runs a VM console session described by a [`RunConfig`].
#[derive(Debug, Clone)]
pub struct Harness {
    config: RunConfig,
}

impl Harness {
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs one session to completion.
    ///
    /// The session is reset first; other clones of it can watch the console
    /// and call [`Session::terminate`] while this is running. Only allocation,
    /// permission and "already running" errors are returned as `Err`; everything
    /// that goes wrong after the pty exists ends up in [`RunReport::errors`].
    pub async fn run(&self, session: &Session) -> Result<RunReport> {
        let active = session.begin()?;
        let run_id = active.id();
        let span = tracing::info_span!("run", id = %run_id);

        let report = self.execute(session, run_id).instrument(span).await;
        drop(active);
        report
    }

    async fn execute(&self, session: &Session, run_id: Uuid) -> Result<RunReport> {
        let config = &self.config;
        tracing::info!(
            commands = config.script.len(),
            marker = %config.marker,
            "starting run"
        );

        let AllocatedPty {
            input,
            output,
            device_path,
        } = PtyAllocator::allocate(config.ownership)?;
        let output = Arc::new(output);
        let capture_done = Signal::new();

        let capture = tokio::spawn(
            OutputCapture {
                session: session.clone(),
                output: output.clone(),
                poll_interval: config.poll_interval,
                mirror_console: config.mirror_console,
                finished: capture_done.clone(),
            }
            .run()
            .in_current_span(),
        );
        let launcher = tokio::spawn(
            SubprocessLauncher {
                session: session.clone(),
                tool: config.build_tool.clone(),
                shutdown_grace: config.shutdown_grace,
            }
            .run()
            .in_current_span(),
        );
        let injector = tokio::spawn(
            CommandInjector {
                session: session.clone(),
                output: output.clone(),
                script: config.script.clone(),
                marker: config.marker.clone(),
                reboot_command: config.reboot_command.clone(),
                boot_settle_delay: config.boot_settle_delay,
                poll_interval: config.poll_interval,
                max_retries: config.max_retries,
                mode: config.injection,
            }
            .run()
            .in_current_span(),
        );
        let finalizer = tokio::spawn(
            ResourceFinalizer {
                session: session.clone(),
                input,
                output,
                capture_done,
                shutdown_grace: config.shutdown_grace,
                poll_interval: config.poll_interval,
            }
            .run()
            .in_current_span(),
        );

        session.publish_device_path(device_path);

        let (capture, launcher, injector, finalizer) =
            tokio::join!(capture, launcher, injector, finalizer);

        let mut errors = Vec::new();

        let captured_bytes = match flatten("output capture", capture) {
            Ok(total) => total,
            Err(e) => {
                errors.push(e);
                session.capture().len()
            }
        };

        let exit_status = match flatten("subprocess launcher", launcher) {
            Ok(status) => {
                if !status.success() {
                    errors.push(Error::Subprocess(format!("build tool exited with {status}")));
                }
                Some(status)
            }
            Err(e) => {
                errors.push(e);
                None
            }
        };

        let injection = match flatten("command injector", injector) {
            Ok(outcome) => outcome,
            Err(e) => {
                errors.push(e);
                InjectionOutcome::Failed
            }
        };

        let output_released = match finalizer {
            Ok(released) => released,
            Err(e) => {
                errors.push(task_failed("resource finalizer", e));
                false
            }
        };

        for error in &errors {
            tracing::warn!(error = %error, "run error");
        }
        tracing::info!(
            bytes = captured_bytes,
            ?injection,
            errors = errors.len(),
            "run finished"
        );

        Ok(RunReport {
            run_id,
            output: session.output(),
            captured_bytes,
            exit_status,
            injection,
            output_released,
            errors,
            marker: config.marker.clone(),
        })
    }
}

/// Runs `config` on a fresh session.
pub async fn run(config: RunConfig) -> Result<RunReport> {
    Harness::new(config)?.run(&Session::new()).await
}

fn flatten<T>(task: &str, joined: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    joined.map_err(|e| task_failed(task, e))?
}

fn task_failed(task: &str, e: JoinError) -> Error {
    Error::TaskFailed(format!("{task}: {e}"))
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Full console transcript, lossily decoded.
    pub output: String,
    pub captured_bytes: usize,
    /// `None` if the build tool never ran to completion.
    pub exit_status: Option<ExitStatus>,
    pub injection: InjectionOutcome,
    /// Whether the finalizer was the one to close the console.
    pub output_released: bool,
    /// Non-fatal errors collected from the run's tasks.
    pub errors: Vec<Error>,
    marker: String,
}

impl RunReport {
    pub fn output_contains(&self, needle: &str) -> bool {
        self.output.contains(needle)
    }

    pub fn output_matches(&self, pattern: &str) -> Result<Vec<String>> {
        let re = Regex::new(pattern)?;
        Ok(re
            .find_iter(&self.output)
            .map(|m| m.as_str().to_owned())
            .collect())
    }

    /// Fails with [`Error::MarkerTimeout`] if the boot marker never showed up
    /// on the console.
    pub fn ensure_booted(&self) -> Result<()> {
        if self.output_contains(&self.marker) {
            return Ok(());
        }
        let attempts = match self.injection {
            InjectionOutcome::MarkerTimeout { attempts } => attempts,
            _ => 0,
        };
        Err(Error::MarkerTimeout {
            marker: self.marker.clone(),
            attempts,
        })
    }

    /// True if every command was typed and the build tool exited cleanly.
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
            && self.exit_status.is_some_and(|status| status.success())
            && matches!(
                self.injection,
                InjectionOutcome::Completed {
                    failed_keystrokes: 0,
                    ..
                }
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use ttyrun_core::{BuildTool, CommandScript};

    fn report(output: &str, injection: InjectionOutcome) -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            output: output.into(),
            captured_bytes: output.len(),
            exit_status: Some(ExitStatus::from_raw(0)),
            injection,
            output_released: true,
            errors: Vec::new(),
            marker: "Starting network: OK".into(),
        }
    }

    #[test]
    fn harness_rejects_invalid_config() {
        let mut config = RunConfig::builder(
            BuildTool::new("sh"),
            CommandScript::new(["echo hi"]).unwrap(),
        )
        .build()
        .unwrap();
        config.max_retries = 0;
        assert!(matches!(Harness::new(config), Err(Error::Configuration(_))));
    }

    #[test]
    fn ensure_booted_reports_attempts() {
        let report = report("Kernel panic", InjectionOutcome::MarkerTimeout { attempts: 600 });
        match report.ensure_booted() {
            Err(Error::MarkerTimeout { marker, attempts }) => {
                assert_eq!(marker, "Starting network: OK");
                assert_eq!(attempts, 600);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn succeeded_requires_clean_injection() {
        let clean = report(
            "Starting network: OK\nhi\n",
            InjectionOutcome::Completed {
                commands: 1,
                failed_keystrokes: 0,
            },
        );
        assert!(clean.ensure_booted().is_ok());
        assert!(clean.succeeded());

        let lossy = report(
            "Starting network: OK\n",
            InjectionOutcome::Completed {
                commands: 1,
                failed_keystrokes: 2,
            },
        );
        assert!(!lossy.succeeded());
    }

    #[test]
    fn output_matches_on_report() {
        let report = report("dedup: 12 blocks\ndedup: 7 blocks\n", InjectionOutcome::Aborted);
        assert_eq!(
            report.output_matches(r"dedup: \d+").unwrap(),
            vec!["dedup: 12", "dedup: 7"]
        );
        assert!(matches!(
            report.output_matches("("),
            Err(Error::InvalidPattern(_))
        ));
    }
}
