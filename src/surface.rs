//! Dumb buffers the CPU paints into and the display scans out from.
//!
//! A [`PixelSurface`] owns three kernel-side resources, acquired in this order:
//!
//! 1. the raw buffer memory (dumb buffer handle),
//! 2. the framebuffer object that lets a CRTC scan the memory out,
//! 3. the process mapping of the memory.
//!
//! They are released in the reverse order. Every acquisition is paired with a release that runs on
//! all exit paths, including a failure half-way through creation.

use std::fmt;
use std::io::{self, Read};
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::{self, NonNull};

use anyhow::{anyhow, Context};
use smithay::reexports::drm::buffer;
use smithay::reexports::drm::control::framebuffer;

use crate::backend::{DumbAllocation, KmsDevice};

/// XRGB8888.
pub const BITS_PER_PIXEL: u32 = 32;

/// Value every byte of a new surface is set to before the image is loaded (opaque white).
pub const FILL_BYTE: u8 = 0xff;

/// A shared, writable memory mapping, unmapped on drop.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Maps `len` bytes of `fd` starting at `offset`.
    pub fn new(fd: BorrowedFd<'_>, offset: u64, len: usize) -> io::Result<Self> {
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "mmap offset too large"))?;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset,
            )
        };
        Self::from_raw(ptr, len)
    }

    /// Maps `len` bytes of zeroed memory not backed by any device.
    #[cfg(test)]
    pub fn anonymous(len: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        Self::from_raw(ptr, len)
    }

    fn from_raw(ptr: *mut libc::c_void, len: usize) -> io::Result<Self> {
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    /// Unmaps the memory, reporting the error that dropping would only log.
    pub fn unmap(self) -> io::Result<()> {
        let this = std::mem::ManuallyDrop::new(self);
        this.munmap()
    }

    fn munmap(&self) -> io::Result<()> {
        if unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(err) = self.munmap() {
            warn!("error unmapping {} bytes: {err:?}", self.len);
        }
    }
}

impl Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the mapping is valid for `len` bytes until it is unmapped, which only happens
        // through `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for Mapping {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `deref`; `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// A linear XRGB8888 buffer registered for scanout and mapped into the process.
#[derive(Debug)]
pub struct PixelSurface {
    width: u32,
    height: u32,
    stride: u32,
    /// Driver-reported size of the buffer, authoritative for every bounds check.
    size: usize,
    buffer: Option<buffer::Handle>,
    framebuffer: Option<framebuffer::Handle>,
    /// Present iff the surface is live.
    mapping: Option<Mapping>,
}

/// Outcome of copying an image into a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLoad {
    /// Bytes written into the surface.
    pub copied: usize,
    /// Length of the source, when it is known up front.
    pub source_len: Option<u64>,
    /// Size of the surface.
    pub capacity: usize,
}

impl ImageLoad {
    pub fn size_mismatch(&self) -> bool {
        match self.source_len {
            Some(len) => len != self.capacity as u64,
            None => self.copied != self.capacity,
        }
    }
}

impl PixelSurface {
    pub fn create<D: KmsDevice + ?Sized>(
        device: &D,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("PixelSurface::create");

        let dumb = device
            .create_dumb_buffer(width, height, BITS_PER_PIXEL)
            .context("error creating dumb buffer")?;
        trace!(
            "created dumb buffer {dumb:?} for {width}x{height}, {} bytes per row",
            dumb.pitch
        );

        let mut surface = Self {
            width,
            height,
            stride: dumb.pitch,
            size: 0,
            buffer: Some(dumb.handle),
            framebuffer: None,
            mapping: None,
        };

        if let Err(err) = surface.finish_create(device, &dumb) {
            if let Err(cleanup) = surface.destroy(device) {
                warn!("error cleaning up after failed surface creation: {cleanup:?}");
            }
            return Err(err);
        }

        Ok(surface)
    }

    fn finish_create<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        dumb: &DumbAllocation,
    ) -> anyhow::Result<()> {
        self.size = usize::try_from(dumb.size).context("dumb buffer does not fit in memory")?;

        let fb = device
            .add_framebuffer(dumb, self.width, self.height)
            .context("error adding framebuffer")?;
        self.framebuffer = Some(fb);

        let mut mapping = device
            .map_dumb_buffer(dumb.handle, self.size)
            .context("error mapping dumb buffer")?;
        mapping.fill(FILL_BYTE);
        self.mapping = Some(mapping);

        Ok(())
    }

    /// Bytes per row, as chosen by the device. May exceed `width * 4`.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn framebuffer(&self) -> Option<framebuffer::Handle> {
        self.framebuffer
    }

    pub fn is_live(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn pixels(&self) -> Option<&[u8]> {
        self.mapping.as_deref()
    }

    /// Copies raw pixel rows from `source` until the surface is full or the source runs out.
    ///
    /// Never reads past the surface size, so a longer source is left positioned right after the
    /// bytes that were used. A length mismatch is logged but is not an error.
    pub fn load_image(
        &mut self,
        source: &mut dyn Read,
        source_len: Option<u64>,
    ) -> anyhow::Result<ImageLoad> {
        let _span = tracy_client::span!("PixelSurface::load_image");

        let pixels = self
            .mapping
            .as_deref_mut()
            .ok_or_else(|| anyhow!("surface is not mapped"))?;
        let capacity = pixels.len();

        let mut copied = 0;
        while copied < capacity {
            match source.read(&mut pixels[copied..]) {
                Ok(0) => break,
                Ok(n) => copied += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("error reading image"),
            }
        }

        let load = ImageLoad {
            copied,
            source_len,
            capacity,
        };

        if load.size_mismatch() {
            let len = source_len.unwrap_or(copied as u64);
            warn!("image size ({len} bytes) doesn't match framebuffer size ({capacity} bytes)");
        } else {
            debug!("loaded {copied} bytes of image data");
        }

        Ok(load)
    }

    /// Releases the mapping, the framebuffer and the buffer memory, in that order.
    ///
    /// Every step runs even if an earlier one fails. Resources already released are skipped, so
    /// calling this again is a no-op.
    pub fn destroy<D: KmsDevice + ?Sized>(&mut self, device: &D) -> anyhow::Result<()> {
        let mut failed = 0;

        if let Some(mapping) = self.mapping.take() {
            if let Err(err) = mapping.unmap() {
                warn!("error unmapping surface: {err:?}");
                failed += 1;
            }
        }

        if let Some(fb) = self.framebuffer.take() {
            if let Err(err) = device.destroy_framebuffer(fb) {
                warn!("error removing framebuffer {fb:?}: {err:?}");
                failed += 1;
            }
        }

        if let Some(handle) = self.buffer.take() {
            if let Err(err) = device.destroy_dumb_buffer(handle) {
                warn!("error destroying dumb buffer {handle:?}: {err:?}");
                failed += 1;
            }
        }

        if failed == 0 {
            Ok(())
        } else {
            Err(anyhow!("{failed} surface teardown steps failed"))
        }
    }
}
