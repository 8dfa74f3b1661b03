use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::Context;
use smithay::backend::drm::DrmDeviceFd;
use smithay::reexports::drm::buffer::{self, DrmFourcc};
use smithay::reexports::drm::control::{
    self, connector, crtc, encoder, framebuffer, Device as ControlDevice, Mode as DrmMode,
};
use smithay::utils::DeviceFd;

use super::{
    ConnectorInfo, CrtcState, DumbAllocation, EncoderInfo, KmsDevice, ModeTiming, Resources,
};
use crate::surface::Mapping;

/// A DRM device node opened for mode setting.
pub struct Card {
    fd: DrmDeviceFd,
}

impl Card {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        debug!("opening {path:?}");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("error opening {path:?}"))?;

        let fd = DrmDeviceFd::new(DeviceFd::from(OwnedFd::from(file)));
        Ok(Self { fd })
    }
}

fn raw_handle<T: Into<u32>>(handle: T) -> u32 {
    handle.into()
}

fn from_raw<T: From<control::RawResourceHandle>>(raw: u32, what: &str) -> io::Result<T> {
    control::from_u32(raw).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("device returned a null {what} handle"),
        )
    })
}

impl KmsDevice for Card {
    fn resources(&self) -> io::Result<Resources> {
        let res = self.fd.resource_handles()?;
        Ok(Resources {
            connectors: res.connectors().to_vec(),
            crtcs: res.crtcs().to_vec(),
        })
    }

    fn connector(&self, handle: connector::Handle) -> io::Result<ConnectorInfo> {
        // Force a probe so that freshly plugged monitors report their modes.
        let info = self.fd.get_connector(handle, true)?;
        Ok(ConnectorInfo {
            handle: info.handle(),
            interface: info.interface(),
            interface_id: info.interface_id(),
            state: info.state(),
            modes: info
                .modes()
                .iter()
                .map(|mode| ModeTiming::from(drm_ffi::drm_mode_modeinfo::from(*mode)))
                .collect(),
            encoders: info.encoders().to_vec(),
        })
    }

    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo> {
        let info = drm_ffi::mode::get_encoder(self.fd.as_fd(), raw_handle(handle))?;
        Ok(EncoderInfo {
            handle,
            possible_crtcs: info.possible_crtcs,
        })
    }

    fn create_dumb_buffer(
        &self,
        width: u32,
        height: u32,
        bpp: u32,
    ) -> io::Result<DumbAllocation> {
        let create = drm_ffi::mode::dumbbuffer::create(self.fd.as_fd(), width, height, bpp, 0)?;
        Ok(DumbAllocation {
            handle: from_raw(create.handle, "dumb buffer")?,
            pitch: create.pitch,
            size: create.size,
        })
    }

    fn add_framebuffer(
        &self,
        buffer: &DumbAllocation,
        width: u32,
        height: u32,
    ) -> io::Result<framebuffer::Handle> {
        let handles = [raw_handle(buffer.handle), 0, 0, 0];
        let pitches = [buffer.pitch, 0, 0, 0];
        let offsets = [0; 4];
        let modifiers = [0; 4];

        let fb = drm_ffi::mode::add_fb2(
            self.fd.as_fd(),
            width,
            height,
            DrmFourcc::Xrgb8888 as u32,
            &handles,
            &pitches,
            &offsets,
            &modifiers,
            0,
        )?;
        from_raw(fb.fb_id, "framebuffer")
    }

    fn map_dumb_buffer(&self, buffer: buffer::Handle, len: usize) -> io::Result<Mapping> {
        let map = drm_ffi::mode::dumbbuffer::map(self.fd.as_fd(), raw_handle(buffer), 0, 0)?;
        Mapping::new(self.fd.as_fd(), map.offset, len)
    }

    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        self.fd.destroy_framebuffer(fb)
    }

    fn destroy_dumb_buffer(&self, buffer: buffer::Handle) -> io::Result<()> {
        drm_ffi::mode::dumbbuffer::destroy(self.fd.as_fd(), raw_handle(buffer))?;
        Ok(())
    }

    fn crtc_state(&self, crtc: crtc::Handle) -> io::Result<CrtcState> {
        let info = self.fd.get_crtc(crtc)?;
        Ok(CrtcState {
            handle: info.handle(),
            framebuffer: info.framebuffer(),
            position: info.position(),
            mode: info
                .mode()
                .map(|mode| ModeTiming::from(drm_ffi::drm_mode_modeinfo::from(mode))),
        })
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        position: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<&ModeTiming>,
    ) -> io::Result<()> {
        let mode = mode.map(|mode| DrmMode::from(drm_ffi::drm_mode_modeinfo::from(mode)));
        self.fd.set_crtc(crtc, fb, position, connectors, mode)
    }
}
