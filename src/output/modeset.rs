use anyhow::{anyhow, Context};

use super::{CrtcAllocator, Output};
use crate::backend::{EncoderInfo, KmsDevice, Resources};
use crate::image::ImageSource;
use crate::surface::PixelSurface;

/// Takes over one output: picks a CRTC, paints the image into a new surface and sets the mode.
///
/// Any failure before the modeset itself marks the output disconnected and leaves the others
/// alone. A failed modeset is only logged: the surface stays, so shutdown still releases it.
pub fn activate<D: KmsDevice + ?Sized>(
    output: &mut Output,
    device: &D,
    resources: &Resources,
    allocator: &mut CrtcAllocator,
    image: &mut ImageSource,
) -> anyhow::Result<()> {
    let _span = tracy_client::span!("activate");

    if !output.connected {
        return Ok(());
    }

    let res = activate_inner(output, device, resources, allocator, image);
    if res.is_err() {
        output.disconnect();
    }
    res
}

fn activate_inner<D: KmsDevice + ?Sized>(
    output: &mut Output,
    device: &D,
    resources: &Resources,
    allocator: &mut CrtcAllocator,
    image: &mut ImageSource,
) -> anyhow::Result<()> {
    let name = output.name;
    let mode = output
        .mode
        .clone()
        .ok_or_else(|| anyhow!("no mode selected"))?;

    let encoders: Vec<EncoderInfo> = output
        .encoders
        .iter()
        .filter_map(|&handle| match device.encoder(handle) {
            Ok(info) => Some(info),
            Err(err) => {
                debug!("{name}: error querying encoder {handle:?}: {err:?}");
                None
            }
        })
        .collect();

    let crtc = allocator
        .allocate(&encoders, &resources.crtcs)
        .ok_or_else(|| anyhow!("could not find a free CRTC for {name}"))?;
    output.crtc = Some(crtc);
    debug!("{name}: using CRTC {crtc:?}");

    let (width, height) = mode.size();
    let refresh = mode.refresh_mhz();
    debug!(
        "{name}: using mode {width}x{height}@{}.{:03}",
        refresh / 1000,
        refresh % 1000
    );

    let mut surface = PixelSurface::create(device, width, height)
        .with_context(|| format!("error creating framebuffer for {name}"))?;
    debug!(
        "{name}: created framebuffer {:?} ({} bytes)",
        surface.framebuffer(),
        surface.size()
    );

    if let Err(err) = image.load_into(&mut surface) {
        if let Err(cleanup) = surface.destroy(device) {
            warn!("{name}: error destroying framebuffer: {cleanup:?}");
        }
        return Err(err.context(format!("error loading splash image for {name}")));
    }

    let fb = surface.framebuffer();
    output.surface = Some(surface);

    match device.crtc_state(crtc) {
        Ok(state) => output.saved = Some(state),
        Err(err) => warn!("{name}: error saving CRTC state, it won't be restored: {err:?}"),
    }

    if let Err(err) = device.set_crtc(crtc, fb, (0, 0), &[output.connector], Some(&mode)) {
        warn!("{name}: error setting mode: {err:?}");
    }

    Ok(())
}
