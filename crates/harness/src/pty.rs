use nix::pty::{OpenptyResult, openpty};
use nix::sys::termios::{self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use ttyrun_core::{Error, PtyOwnership, Result, TerminalHandle, TerminalSide};

/// The user who invoked the harness through `sudo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokingUser {
    pub uid: u32,
    pub gid: Option<u32>,
}

impl InvokingUser {
    /// Reads `SUDO_UID` (required) and `SUDO_GID` (optional).
    pub fn from_env() -> Result<Self> {
        Self::from_vars(
            std::env::var("SUDO_UID").ok(),
            std::env::var("SUDO_GID").ok(),
        )
    }

    pub fn from_vars(uid: Option<String>, gid: Option<String>) -> Result<Self> {
        let uid = uid.ok_or_else(|| {
            Error::Permission("SUDO_UID is not set; the harness must be started through sudo".into())
        })?;
        let uid = uid
            .trim()
            .parse()
            .map_err(|_| Error::Permission(format!("SUDO_UID is not a valid uid: {uid:?}")))?;
        let gid = match gid {
            Some(gid) => Some(
                gid.trim()
                    .parse()
                    .map_err(|_| Error::Permission(format!("SUDO_GID is not a valid gid: {gid:?}")))?,
            ),
            None => None,
        };
        Ok(Self { uid, gid })
    }

    fn chown(&self, fd: &OwnedFd) -> Result<()> {
        std::os::unix::fs::fchown(fd, Some(self.uid), self.gid).map_err(|e| {
            Error::Permission(format!("failed to hand pty to uid {}: {e}", self.uid))
        })
    }
}

/// A freshly allocated pty pair.
#[derive(Debug)]
pub struct AllocatedPty {
    /// Slave side; the VM attaches here through `device_path`.
    pub input: TerminalHandle,
    /// Master side; console output is read here.
    pub output: TerminalHandle,
    pub device_path: PathBuf,
}

pub struct PtyAllocator;

impl PtyAllocator {
    /// Opens a pty pair and prepares it for a VM serial console.
    ///
    /// The invoking user is resolved before anything is opened, so a
    /// [`Error::Permission`] leaves no descriptors behind.
    pub fn allocate(ownership: PtyOwnership) -> Result<AllocatedPty> {
        let owner = match ownership {
            PtyOwnership::InvokingUser => Some(InvokingUser::from_env()?),
            PtyOwnership::Unchanged => None,
        };

        let OpenptyResult { master, slave } =
            openpty(None, None).map_err(|e| Error::Allocation(e.to_string()))?;

        configure_raw(&slave);

        let device_path = std::fs::read_link(format!("/proc/self/fd/{}", slave.as_raw_fd()))
            .map_err(|e| Error::Allocation(format!("cannot resolve pty device path: {e}")))?;

        if let Some(owner) = owner {
            owner.chown(&master)?;
            owner.chown(&slave)?;
            tracing::debug!(uid = owner.uid, gid = ?owner.gid, "handed pty to invoking user");
        }

        let input = TerminalHandle::new(TerminalSide::Input, slave)
            .map_err(|e| Error::Allocation(format!("failed to register pty slave: {e}")))?;
        let output = TerminalHandle::new(TerminalSide::Output, master)
            .map_err(|e| Error::Allocation(format!("failed to register pty master: {e}")))?;

        tracing::info!(tty = %device_path.display(), "allocated pty");

        Ok(AllocatedPty {
            input,
            output,
            device_path,
        })
    }
}

fn configure_raw(slave: &OwnedFd) {
    let Ok(mut termios) = termios::tcgetattr(slave) else {
        tracing::warn!("could not read pty attributes; leaving defaults");
        return;
    };

    // Don't let the host line discipline eat control characters meant for the guest
    termios.input_flags.remove(InputFlags::IGNBRK);
    termios.input_flags.remove(InputFlags::BRKINT);
    termios.input_flags.remove(InputFlags::PARMRK);
    termios.input_flags.remove(InputFlags::ISTRIP);
    termios.input_flags.remove(InputFlags::INLCR);
    termios.input_flags.remove(InputFlags::IGNCR);
    termios.input_flags.remove(InputFlags::ICRNL);
    termios.input_flags.remove(InputFlags::IXON);

    termios.output_flags.insert(OutputFlags::OPOST);
    termios.output_flags.insert(OutputFlags::ONLCR);

    // The guest shell echoes; a host-side echo would double every keystroke
    termios.local_flags.remove(LocalFlags::ECHO);
    termios.local_flags.remove(LocalFlags::ECHONL);
    termios.local_flags.remove(LocalFlags::ICANON);
    termios.local_flags.remove(LocalFlags::ISIG);
    termios.local_flags.remove(LocalFlags::IEXTEN);

    termios.control_flags.remove(ControlFlags::CSIZE);
    termios.control_flags.remove(ControlFlags::PARENB);
    termios.control_flags.insert(ControlFlags::CS8);

    if let Err(e) = termios::tcsetattr(slave, SetArg::TCSANOW, &termios) {
        tracing::warn!(error = %e, "could not put pty in raw mode");
    }
}
