//! Device limits
//!
//! Fixed hardware capacities supplied at device-init time. The core never
//! computes these; the winsys layer reads them out of the chip ident.

/// Hardware capacities for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Instruction slots in the on-chip program store
    pub max_exec_slots: u32,
    /// Constant register slots shared by all programs on a channel
    pub max_const_slots: u32,
    /// Concurrently live temporary registers per program
    pub max_temps: u32,
    /// Texture samplers addressable by the fragment pipe
    pub max_samplers: u32,
    /// User clip planes the transform pipe can evaluate
    pub max_clip_planes: u32,
}

impl DeviceLimits {
    /// Limits of the Curie-class part this core models
    pub fn curie() -> Self {
        Self {
            max_exec_slots: 512,
            max_const_slots: 256,
            max_temps: 32,
            max_samplers: 16,
            max_clip_planes: 6,
        }
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self::curie()
    }
}
