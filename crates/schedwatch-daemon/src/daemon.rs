//! Detaching from the controlling terminal.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::unistd::{fork, setsid, ForkResult};
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use tracing::debug;

/// Fork into the background.
///
/// The parent exits with status 0. The child starts a new session and
/// points stdin, stdout and stderr at `/dev/null`.
///
/// Must be called before any threads are spawned.
#[allow(unsafe_code)]
pub fn detach_from_tty() -> Result<()> {
    // SAFETY: the process is still single-threaded here
    match unsafe { fork() }.context("Can't create child process")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    // Already a session leader is not an error worth stopping for
    if let Err(e) = setsid() {
        debug!("setsid failed: {e}");
    }

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("Can't open /dev/null")?;
    let fd = devnull.as_raw_fd();

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open
        Errno::result(unsafe { libc::dup2(fd, target) })
            .with_context(|| format!("Can't dup2 /dev/null onto fd {target}"))?;
    }

    Ok(())
}
