use crate::session::Session;
use nix::sys::signal::{self, Signal as UnixSignal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use ttyrun_core::{BuildTool, Error, Result};

/// How long to keep draining the tool's own stdout/stderr after it exits.
const LOG_DRAIN: Duration = Duration::from_millis(200);

/// Runs the build tool that boots the VM on the allocated pty.
pub(crate) struct SubprocessLauncher {
    pub(crate) session: Session,
    pub(crate) tool: BuildTool,
    pub(crate) shutdown_grace: Duration,
}

impl SubprocessLauncher {
    /// Returns the tool's exit status. Whatever happens, the run is marked
    /// terminated afterwards.
    pub(crate) async fn run(self) -> Result<ExitStatus> {
        let shutdown = self.session.shutdown().clone();
        let _terminate = shutdown.terminate.set_on_drop();
        let _exited = shutdown.exited.set_on_drop();

        let result = self.launch().await;
        match &result {
            Ok(status) if status.success() => tracing::info!(%status, "build tool exited"),
            Ok(status) => {
                tracing::warn!(%status, "build tool exited unsuccessfully; keeping console capture")
            }
            Err(e) => tracing::warn!(error = %e, "build tool did not run"),
        }
        result
    }

    async fn launch(&self) -> Result<ExitStatus> {
        let shutdown = self.session.shutdown();
        shutdown.launched.wait().await;

        if shutdown.terminate.is_set() {
            return Err(Error::Subprocess(
                "run was terminated before the build tool started".into(),
            ));
        }

        let device_path = self
            .session
            .device_path()
            .ok_or_else(|| Error::Subprocess("pty device path was not published".into()))?;

        let program = which::which(&self.tool.program).map_err(|e| {
            Error::Subprocess(format!(
                "cannot find build tool '{}': {e}",
                self.tool.program.display()
            ))
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.tool.args)
            .env(&self.tool.tty_env, &device_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so the VM it forks can be killed with it.
            .process_group(0)
            .kill_on_drop(true);

        tracing::info!(
            program = %program.display(),
            args = ?self.tool.args,
            tty = %device_path.display(),
            "launching build tool"
        );

        let mut child = cmd.spawn().map_err(|e| {
            Error::Subprocess(format!("failed to spawn '{}': {e}", program.display()))
        })?;

        let mut pumps: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_log_pump(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_log_pump(stderr, "stderr"));
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = shutdown.terminate.wait() => self.stop(&mut child).await?,
        };

        for mut pump in pumps {
            if timeout(LOG_DRAIN, &mut pump).await.is_err() {
                pump.abort();
            }
        }

        Ok(status)
    }

    /// Gives the tool `shutdown_grace` to exit on its own, then kills its
    /// whole process group.
    async fn stop(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        tracing::debug!(grace = ?self.shutdown_grace, "run terminated; waiting for build tool");
        if let Ok(status) = timeout(self.shutdown_grace, child.wait()).await {
            return status;
        }

        tracing::warn!("build tool still running after grace period; killing it");
        if let Some(pid) = child.id() {
            let group = Pid::from_raw(pid as i32);
            if let Err(e) = signal::killpg(group, UnixSignal::SIGKILL) {
                tracing::debug!(error = %e, "killpg failed; killing the tool only");
            }
        }
        let _ = child.start_kill();
        child.wait().await
    }
}

fn spawn_log_pump<R>(stream: R, name: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    tracing::debug!(stream = name, "{}", text.trim_end_matches(['\r', '\n']));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Closing the pipe here would SIGPIPE the tool, so keep
                    // consuming it without logging.
                    tracing::debug!(stream = name, error = %e, "cannot read tool output");
                    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                    break;
                }
            }
        }
    })
}
