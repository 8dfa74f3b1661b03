//! We set a signal handler with `calloop::signals::Signals::new`.
//! This does two things:
//! 1. It blocks the thread from receiving these signals normally (pthread_sigmask)
//! 2. It creates a signalfd to read them in the event loop.
//!
//! The termination signals are blocked as the very first thing in `main`, before the displays are
//! touched. A signal arriving during startup then stays pending instead of killing the process
//! with the screens taken over. Pending signals are not inherited across fork(), so `main` checks
//! for one with `pending()` before detaching, and the parent hands anything that came in after
//! that check to the child with `forward_pending()`. The signal source itself is only created
//! after detaching: a signalfd registered in epoll by the parent won't report the child's signals.
//!
//! The signal source callback only flips the shutdown token. Restoration happens on the main
//! path after the idle loop returns.

pub use platform::*;

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::io;

    use calloop::LoopHandle;

    use crate::shutdown::ShutdownToken;

    pub fn listen(_handle: &LoopHandle<'static, ShutdownToken>) -> anyhow::Result<()> {
        Ok(())
    }

    // Without our own signal handling in listen(), blocking would swallow termination signals
    // entirely.
    pub fn block_early() -> io::Result<()> {
        Ok(())
    }

    pub fn pending() -> Option<libc::c_int> {
        None
    }

    pub fn forward_pending(_pid: libc::pid_t) {}
}

#[cfg(target_os = "linux")]
mod platform {
    use std::{io, mem};

    use anyhow::Context;
    use calloop::signals::{Signal, Signals};
    use calloop::LoopHandle;

    use crate::shutdown::ShutdownToken;

    const TERMINATION_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP];

    pub fn listen(handle: &LoopHandle<'static, ShutdownToken>) -> anyhow::Result<()> {
        let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP])
            .context("error creating signal source")?;

        handle
            .insert_source(signals, |event, _, token| {
                if token.request() {
                    info!("quitting due to receiving signal {:?}", event.signal());
                } else {
                    debug!("already quitting, ignoring signal {:?}", event.signal());
                }
            })
            .map_err(|err| err.error)
            .context("error inserting signal source")?;

        Ok(())
    }

    // We block the signals early, so that they apply to all threads.
    // They are then blocked *again* by the `Signals` source. That's fine.
    pub fn block_early() -> io::Result<()> {
        set_sigmask(&preferred_sigset()?)
    }

    /// Returns a termination signal that is blocked and waiting to be delivered, if any.
    pub fn pending() -> Option<libc::c_int> {
        let pending = pending_sigset().ok()?;
        TERMINATION_SIGNALS
            .into_iter()
            .find(|&signum| unsafe { libc::sigismember(&pending, signum) } == 1)
    }

    /// Re-sends the termination signals still pending in this process to `pid`.
    pub fn forward_pending(pid: libc::pid_t) {
        let Ok(pending) = pending_sigset() else {
            return;
        };

        for signum in TERMINATION_SIGNALS {
            if unsafe { libc::sigismember(&pending, signum) } == 1 {
                unsafe { libc::kill(pid, signum) };
            }
        }
    }

    fn pending_sigset() -> io::Result<libc::sigset_t> {
        let mut set = mem::MaybeUninit::uninit();
        if unsafe { libc::sigpending(set.as_mut_ptr()) } == 0 {
            Ok(unsafe { set.assume_init() })
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn empty_sigset() -> io::Result<libc::sigset_t> {
        let mut sigset = mem::MaybeUninit::uninit();
        if unsafe { libc::sigemptyset(sigset.as_mut_ptr()) } == 0 {
            Ok(unsafe { sigset.assume_init() })
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn preferred_sigset() -> io::Result<libc::sigset_t> {
        let mut set = empty_sigset()?;
        for signum in TERMINATION_SIGNALS {
            unsafe { add_signal(&mut set, signum)? };
        }
        Ok(set)
    }

    // SAFETY: `signum` must be a valid signal number.
    unsafe fn add_signal(set: &mut libc::sigset_t, signum: libc::c_int) -> io::Result<()> {
        if unsafe { libc::sigaddset(set, signum) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn set_sigmask(set: &libc::sigset_t) -> io::Result<()> {
        let oldset = std::ptr::null_mut(); // ignore old mask
        if unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, set, oldset) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
