use std::ffi::{c_char, CStr};
use std::io;
use std::iter::zip;

use smithay::reexports::drm::buffer;
use smithay::reexports::drm::control::{connector, crtc, encoder, framebuffer, ModeFlags};

use crate::surface::Mapping;

pub mod card;

pub use card::Card;

/// Kernel mode-setting operations needed to take over and give back the displays.
///
/// Every call maps onto one synchronous request to the device. Nothing is retried.
pub trait KmsDevice {
    fn resources(&self) -> io::Result<Resources>;

    fn connector(&self, handle: connector::Handle) -> io::Result<ConnectorInfo>;

    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo>;

    /// Allocates a linear buffer; the device picks the stride and total size.
    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32)
        -> io::Result<DumbAllocation>;

    /// Registers `buffer` as an XRGB8888 scanout source with zero offset.
    fn add_framebuffer(
        &self,
        buffer: &DumbAllocation,
        width: u32,
        height: u32,
    ) -> io::Result<framebuffer::Handle>;

    /// Maps exactly `len` bytes of `buffer` into the process, readable and writable.
    fn map_dumb_buffer(&self, buffer: buffer::Handle, len: usize) -> io::Result<Mapping>;

    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()>;

    fn destroy_dumb_buffer(&self, buffer: buffer::Handle) -> io::Result<()>;

    fn crtc_state(&self, crtc: crtc::Handle) -> io::Result<CrtcState>;

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        position: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<&ModeTiming>,
    ) -> io::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub connectors: Vec<connector::Handle>,
    /// CRTCs in slot order. Encoder possible-CRTC masks index into this list.
    pub crtcs: Vec<crtc::Handle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub handle: connector::Handle,
    pub interface: connector::Interface,
    pub interface_id: u32,
    pub state: connector::State,
    /// Modes in the order the driver reports them.
    pub modes: Vec<ModeTiming>,
    pub encoders: Vec<encoder::Handle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    pub handle: encoder::Handle,
    /// Bit `i` is set when the CRTC in slot `i` can drive this encoder.
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbAllocation {
    pub handle: buffer::Handle,
    pub pitch: u32,
    pub size: u64,
}

/// Snapshot of what a CRTC was doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcState {
    pub handle: crtc::Handle,
    pub framebuffer: Option<framebuffer::Handle>,
    pub position: (u32, u32),
    /// `None` when the CRTC was off.
    pub mode: Option<ModeTiming>,
}

/// Display timing descriptor, mirroring `drm_mode_modeinfo` field for field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeTiming {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: String,
}

impl ModeTiming {
    pub fn size(&self) -> (u32, u32) {
        (u32::from(self.hdisplay), u32::from(self.vdisplay))
    }

    /// Refresh rate in millihertz.
    pub fn refresh_mhz(&self) -> u32 {
        let htotal = u64::from(self.htotal);
        let vtotal = u64::from(self.vtotal);
        if htotal == 0 || vtotal == 0 {
            return 0;
        }

        let mut refresh = (u64::from(self.clock) * 1_000_000 / htotal + vtotal / 2) / vtotal;

        let flags = ModeFlags::from_bits_truncate(self.flags);
        if flags.contains(ModeFlags::INTERLACE) {
            refresh *= 2;
        }
        if flags.contains(ModeFlags::DBLSCAN) {
            refresh /= 2;
        }
        if self.vscan > 1 {
            refresh /= u64::from(self.vscan);
        }

        u32::try_from(refresh).unwrap_or(u32::MAX)
    }
}

impl From<drm_ffi::drm_mode_modeinfo> for ModeTiming {
    fn from(info: drm_ffi::drm_mode_modeinfo) -> Self {
        let bytes: Vec<u8> = info.name.iter().map(|c| *c as u8).collect();
        let name = CStr::from_bytes_until_nul(&bytes)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());

        Self {
            clock: info.clock,
            hdisplay: info.hdisplay,
            hsync_start: info.hsync_start,
            hsync_end: info.hsync_end,
            htotal: info.htotal,
            hskew: info.hskew,
            vdisplay: info.vdisplay,
            vsync_start: info.vsync_start,
            vsync_end: info.vsync_end,
            vtotal: info.vtotal,
            vscan: info.vscan,
            vrefresh: info.vrefresh,
            flags: info.flags,
            mode_type: info.type_,
            name,
        }
    }
}

impl From<&ModeTiming> for drm_ffi::drm_mode_modeinfo {
    fn from(mode: &ModeTiming) -> Self {
        drm_ffi::drm_mode_modeinfo {
            clock: mode.clock,
            hdisplay: mode.hdisplay,
            hsync_start: mode.hsync_start,
            hsync_end: mode.hsync_end,
            htotal: mode.htotal,
            hskew: mode.hskew,
            vdisplay: mode.vdisplay,
            vsync_start: mode.vsync_start,
            vsync_end: mode.vsync_end,
            vtotal: mode.vtotal,
            vscan: mode.vscan,
            vrefresh: mode.vrefresh,
            flags: mode.flags,
            type_: mode.mode_type,
            name: mode_name(&mode.name),
        }
    }
}

/// Converts a string to a mode name array (max 31 chars + null terminator).
fn mode_name(name: &str) -> [c_char; 32] {
    let mut buf: [c_char; 32] = [0; 32];

    for (a, b) in zip(&mut buf[..31], name.as_bytes()) {
        // Can be u8 on aarch64 and i8 on x86_64.
        *a = *b as _;
    }

    buf
}
