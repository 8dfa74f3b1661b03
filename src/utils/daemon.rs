use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::fd::AsRawFd;

use anyhow::Context;

use super::signals;

/// Detaches from the controlling terminal and points the standard streams at `/dev/null`.
///
/// The parent exits with status 0 straight away without running destructors, so whatever it
/// owned (the taken-over displays in particular) stays with the child. Termination signals
/// pending in the parent are passed on to the child first.
pub fn detach() -> anyhow::Result<()> {
    // Buffered output would otherwise be written twice.
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()).context("error forking"),
        0 => (),
        child => {
            signals::forward_pending(child);
            unsafe { libc::_exit(0) }
        }
    }

    if unsafe { libc::setsid() } == -1 {
        let err = io::Error::last_os_error();
        warn!("error creating a new session: {err:?}");
    }

    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("error opening /dev/null")?;

    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } == -1 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("error redirecting fd {fd} to /dev/null"));
        }
    }

    Ok(())
}

/// Tells the service manager, if any, that the displays are taken over.
pub fn notify_ready() {
    let pid = std::process::id();
    if let Err(err) = sd_notify::notify(
        false,
        &[sd_notify::NotifyState::MainPid(pid), sd_notify::NotifyState::Ready],
    ) {
        warn!("error notifying systemd: {err:?}");
    }
}
