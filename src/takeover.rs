use anyhow::Context;

use crate::backend::KmsDevice;
use crate::image::ImageSource;
use crate::output::{self, CrtcAllocator, Output};
use crate::shutdown::restore_all;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The outputs show the splash image.
    Active,
    Restoring,
    /// Everything has been given back.
    Done,
}

/// Exclusive ownership of a device's outputs from takeover until restoration.
///
/// Dropping an active takeover restores the outputs, so every exit path gives the displays back.
pub struct Takeover<D: KmsDevice> {
    device: D,
    outputs: Vec<Output>,
    allocator: CrtcAllocator,
    phase: Phase,
}

impl<D: KmsDevice> Takeover<D> {
    /// Discovers the outputs and shows `image` on every one that can be set up.
    ///
    /// Only a failure to list the device resources is an error. Outputs that cannot be used end
    /// up disconnected.
    pub fn start(device: D, image: &mut ImageSource) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("Takeover::start");

        let resources = device
            .resources()
            .context("error getting device resources")?;
        trace!(
            "{} connectors, {} CRTCs",
            resources.connectors.len(),
            resources.crtcs.len()
        );

        let outputs = output::enumerate(&device, &resources);
        let mut this = Self {
            device,
            outputs,
            allocator: CrtcAllocator::new(),
            phase: Phase::Active,
        };

        for output in &mut this.outputs {
            let res = output::activate(
                output,
                &this.device,
                &resources,
                &mut this.allocator,
                image,
            );
            if let Err(err) = res {
                warn!("error activating {}: {err:?}", output.name);
            }
        }

        for output in &this.outputs {
            info!("{}", output.summary());
        }

        Ok(this)
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn allocator(&self) -> &CrtcAllocator {
        &self.allocator
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn active_outputs(&self) -> impl Iterator<Item = &Output> {
        self.outputs.iter().filter(|output| output.connected)
    }

    /// Gives every taken-over output back. Runs at most once; later calls do nothing.
    pub fn restore(&mut self) -> anyhow::Result<()> {
        if self.phase != Phase::Active {
            return Ok(());
        }

        info!("restoring displays");
        self.phase = Phase::Restoring;
        let res = restore_all(&self.device, &mut self.outputs);
        self.phase = Phase::Done;
        res
    }
}

impl<D: KmsDevice> Drop for Takeover<D> {
    fn drop(&mut self) {
        if let Err(err) = self.restore() {
            warn!("error restoring displays: {err:?}");
        }
    }
}
