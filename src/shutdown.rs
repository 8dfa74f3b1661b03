//! Waiting for the signal to give the displays back, and giving them back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use calloop::{EventLoop, LoopHandle};

use crate::backend::KmsDevice;
use crate::output::Output;

/// How long the idle loop sleeps between checks of the shutdown token.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Flag that flips once, when shutdown is requested.
///
/// Clones share the same flag, so it can be handed to a signal source or another thread.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. Returns `true` only for the call that made the transition.
    pub fn request(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// When to stop idling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Only when the token is set, normally by a termination signal.
    Signal,
    /// After this much time, or earlier if the token is set.
    After(Duration),
}

/// The idle phase between taking over the displays and restoring them.
pub struct Idle {
    event_loop: EventLoop<'static, ShutdownToken>,
    token: ShutdownToken,
}

impl Idle {
    pub fn new(token: ShutdownToken) -> anyhow::Result<Self> {
        let event_loop = EventLoop::try_new().context("error creating event loop")?;
        Ok(Self { event_loop, token })
    }

    pub fn handle(&self) -> LoopHandle<'static, ShutdownToken> {
        self.event_loop.handle()
    }

    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }

    /// Blocks until `trigger` fires. Afterwards the token is always set.
    pub fn wait(&mut self, trigger: Trigger) -> anyhow::Result<()> {
        let deadline = match trigger {
            Trigger::Signal => None,
            // A timeout too large to represent never fires.
            Trigger::After(duration) => Instant::now().checked_add(duration),
        };

        while !self.token.is_requested() {
            let mut timeout = POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    info!("timeout elapsed, restoring displays");
                    self.token.request();
                    break;
                }
                timeout = timeout.min(deadline - now);
            }

            self.event_loop
                .dispatch(Some(timeout), &mut self.token)
                .context("error dispatching event loop")?;
        }

        Ok(())
    }
}

/// Releases every connected output's surface, then puts its CRTC back how it was.
///
/// Every output is attempted even when some fail; the failures are logged and counted.
pub fn restore_all<D: KmsDevice + ?Sized>(
    device: &D,
    outputs: &mut [Output],
) -> anyhow::Result<()> {
    let _span = tracy_client::span!("restore_all");

    let mut failed = 0;
    for output in outputs.iter_mut().filter(|output| output.connected) {
        if let Err(err) = restore(device, output) {
            warn!("error restoring {}: {err:?}", output.name);
            failed += 1;
        }
    }

    if failed == 0 {
        Ok(())
    } else {
        Err(anyhow!("{failed} outputs failed to restore"))
    }
}

fn restore<D: KmsDevice + ?Sized>(device: &D, output: &mut Output) -> anyhow::Result<()> {
    let name = output.name;
    debug!("restoring {name}");

    let mut res = Ok(());

    // The surface goes first, so the CRTC never points at a freed framebuffer after restoring.
    if let Some(mut surface) = output.surface.take() {
        res = surface.destroy(device).context("error destroying framebuffer");
    }

    let Some(saved) = output.saved.take() else {
        debug!("{name}: no saved CRTC state");
        return res;
    };

    let restored = match &saved.mode {
        Some(mode) => device.set_crtc(
            saved.handle,
            saved.framebuffer,
            saved.position,
            &[output.connector],
            Some(mode),
        ),
        // The CRTC was off before.
        None => device.set_crtc(saved.handle, None, (0, 0), &[], None),
    };

    match (res, restored) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(err)) => Err(err).context("error restoring CRTC"),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(crtc_err)) => {
            warn!("{name}: error restoring CRTC: {crtc_err:?}");
            Err(err)
        }
    }
}
