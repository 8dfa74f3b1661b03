use smithay::reexports::drm::control::crtc;

use crate::backend::EncoderInfo;

/// Hands out CRTCs so that no CRTC drives two outputs.
///
/// This is first-fit: encoders are tried in the order the connector lists them, and CRTC slots in
/// index order. Outputs are served in enumeration order with no backtracking, so an early output
/// can take the only CRTC a later output could have used.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrtcAllocator {
    taken: u32,
}

impl CrtcAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bitmask of the CRTC slots handed out so far.
    pub fn taken(&self) -> u32 {
        self.taken
    }

    pub fn is_taken(&self, slot: usize) -> bool {
        slot < 32 && self.taken & (1 << slot) != 0
    }

    /// Picks and reserves a CRTC for an output reachable through `encoders`.
    ///
    /// `crtcs` lists the device CRTCs in slot order; only the first 32 are addressable.
    pub fn allocate(
        &mut self,
        encoders: &[EncoderInfo],
        crtcs: &[crtc::Handle],
    ) -> Option<crtc::Handle> {
        for encoder in encoders {
            for (slot, &crtc) in crtcs.iter().enumerate().take(32) {
                let bit = 1 << slot;

                // Not compatible.
                if encoder.possible_crtcs & bit == 0 {
                    continue;
                }

                // Already taken.
                if self.taken & bit != 0 {
                    continue;
                }

                self.taken |= bit;
                return Some(crtc);
            }
        }

        None
    }
}
