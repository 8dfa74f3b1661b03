use std::fmt::{self, Write as _};

use arrayvec::ArrayString;
use smithay::reexports::drm::control::{connector, crtc, encoder};

use crate::backend::{CrtcState, KmsDevice, ModeTiming, Resources};
use crate::surface::PixelSurface;

mod allocator;
mod modeset;

pub use allocator::CrtcAllocator;
pub use modeset::activate;

/// Output names are cut to this many bytes.
pub const MAX_NAME_LEN: usize = 15;

/// Connector name such as `HDMI-A-1`, truncated to [`MAX_NAME_LEN`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputName(ArrayString<MAX_NAME_LEN>);

impl OutputName {
    pub fn new(interface: connector::Interface, interface_id: u32) -> Self {
        Self::truncated(format_args!("{}-{interface_id}", interface.as_str()))
    }

    /// Name for a connector that could not be queried.
    pub fn unknown(connector: connector::Handle) -> Self {
        Self::truncated(format_args!("Unknown-{}", u32::from(connector)))
    }

    fn truncated(args: fmt::Arguments<'_>) -> Self {
        let mut writer = Truncating(ArrayString::new());
        // Truncating never fails.
        let _ = writer.write_fmt(args);
        Self(writer.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Truncating(ArrayString<MAX_NAME_LEN>);

impl fmt::Write for Truncating {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.try_push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// A connector and everything done to it during the takeover.
#[derive(Debug)]
pub struct Output {
    pub connector: connector::Handle,
    pub name: OutputName,
    /// Once this is `false`, the output is left alone for the rest of the run.
    pub connected: bool,
    pub encoders: Vec<encoder::Handle>,
    /// Driver-preferred mode, the first one reported.
    pub mode: Option<ModeTiming>,
    pub crtc: Option<crtc::Handle>,
    /// CRTC configuration from right before the modeset.
    pub saved: Option<CrtcState>,
    pub surface: Option<PixelSurface>,
}

impl Output {
    fn new(connector: connector::Handle, name: OutputName) -> Self {
        Self {
            connector,
            name,
            connected: false,
            encoders: Vec::new(),
            mode: None,
            crtc: None,
            saved: None,
            surface: None,
        }
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    /// One-line description for logs.
    pub fn summary(&self) -> String {
        let name = &self.name;
        if !self.connected {
            return format!("{name}: disconnected");
        }

        let mut summary = format!("{name}:");
        if let Some(mode) = &self.mode {
            let (w, h) = mode.size();
            let refresh = mode.refresh_mhz();
            let _ = write!(summary, " {w}x{h}@{}.{:03} Hz", refresh / 1000, refresh % 1000);
        }
        if let Some(crtc) = self.crtc {
            let _ = write!(summary, " on CRTC {}", u32::from(crtc));
        }
        if let Some(fb) = self.surface.as_ref().and_then(|s| s.framebuffer()) {
            let _ = write!(summary, ", fb {}", u32::from(fb));
        }
        summary
    }
}

/// Builds one [`Output`] per connector, in device order.
///
/// Connectors that are disconnected, report no modes, or cannot be queried are kept with
/// `connected = false`, so later stages skip them uniformly.
pub fn enumerate<D: KmsDevice + ?Sized>(device: &D, resources: &Resources) -> Vec<Output> {
    let _span = tracy_client::span!("enumerate");

    let mut outputs = Vec::with_capacity(resources.connectors.len());

    for &handle in &resources.connectors {
        let info = match device.connector(handle) {
            Ok(info) => info,
            Err(err) => {
                warn!("error querying connector {handle:?}: {err:?}");
                outputs.push(Output::new(handle, OutputName::unknown(handle)));
                continue;
            }
        };

        let mut output = Output::new(handle, OutputName::new(info.interface, info.interface_id));
        info!("found display {}", output.name);

        if info.state != connector::State::Connected {
            debug!("{} is disconnected", output.name);
            outputs.push(output);
            continue;
        }

        let Some(mode) = info.modes.into_iter().next() else {
            warn!("{} has no valid modes", output.name);
            outputs.push(output);
            continue;
        };

        output.connected = true;
        output.encoders = info.encoders;
        output.mode = Some(mode);
        outputs.push(output);
    }

    outputs
}
