//! Render-mode fallback control
//!
//! When hardware validation hits an incompatible condition the draw falls
//! back, first to software vertex transform (hardware still rasterizes),
//! then to full software rasterization. The dirty bits live at the moment
//! of each fallback are recorded; a later dirty event only earns a hardware
//! retry if it touches state outside that recorded set.

use tracing::debug;

use crate::state::DirtyFlags;

/// How the next draw is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Hardware,
    /// Vertices transformed on the CPU, rasterization on the chip
    SoftwareTransform,
    /// Entire draw rendered on the CPU
    SoftwareRasterize,
}

/// Fallback bookkeeping for one context
#[derive(Debug)]
pub struct FallbackState {
    mode: RenderMode,
    /// Dirty bits at the last hardware -> software-transform fallback
    fallback_swtnl: DirtyFlags,
    /// Dirty bits at the last software-transform -> software-raster fallback
    fallback_swrast: DirtyFlags,
    /// Why the last downgrade happened
    reason: &'static str,
}

impl Default for FallbackState {
    fn default() -> Self {
        Self {
            mode: RenderMode::Hardware,
            fallback_swtnl: DirtyFlags::empty(),
            fallback_swrast: DirtyFlags::empty(),
            reason: "",
        }
    }
}

impl FallbackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }

    /// Choose the mode for the coming validation pass. New dirty bits
    /// outside the recorded fallback set earn a fresh hardware attempt;
    /// a strict subset means nothing that caused the fallback went away.
    pub fn pick_mode(&mut self, dirty: DirtyFlags) -> RenderMode {
        let blocking = match self.mode {
            RenderMode::Hardware => return RenderMode::Hardware,
            RenderMode::SoftwareTransform => self.fallback_swtnl,
            RenderMode::SoftwareRasterize => self.fallback_swtnl | self.fallback_swrast,
        };
        if !(dirty - blocking).is_empty() {
            debug!(?dirty, "state changed beyond fallback set, retrying hardware");
            self.mode = RenderMode::Hardware;
        }
        self.mode
    }

    /// Record a failed hardware validation and downgrade one level.
    /// Returns the new mode, or None when no path remains.
    pub fn downgrade(&mut self, dirty: DirtyFlags, reason: &'static str) -> Option<RenderMode> {
        self.reason = reason;
        match self.mode {
            RenderMode::Hardware => {
                debug!(reason, "falling back to software vertex transform");
                self.fallback_swtnl = dirty;
                self.mode = RenderMode::SoftwareTransform;
                Some(self.mode)
            }
            RenderMode::SoftwareTransform => {
                debug!(reason, "falling back to software rasterization");
                self.fallback_swrast = dirty;
                self.mode = RenderMode::SoftwareRasterize;
                Some(self.mode)
            }
            RenderMode::SoftwareRasterize => None,
        }
    }
}
