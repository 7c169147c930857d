//! Pipe-level state and dirty tracking
//!
//! The context accumulates application state into [`PipeState`] and marks
//! the affected categories dirty. Validation walks the dirty categories in
//! a fixed order and rebuilds their state objects; nothing here touches the
//! hardware.

use bitflags::bitflags;

/// State categories, one cached state object each
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCategory {
    Framebuffer = 0,
    Rasterizer = 1,
    Scissor = 2,
    Stipple = 3,
    FragProg = 4,
    FragTex = 5,
    VertProg = 6,
    Blend = 7,
    BlendColor = 8,
    DepthStencil = 9,
    StencilRef = 10,
    Viewport = 11,
    VtxBuf = 12,
    VtxFmt = 13,
}

pub const CATEGORY_COUNT: usize = 14;

bitflags! {
    /// Pipe-dirty bits, one per category plus modifiers that feed into
    /// shader validation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirtyFlags: u32 {
        const FRAMEBUFFER   = 1 << 0;
        const RASTERIZER    = 1 << 1;
        const SCISSOR       = 1 << 2;
        const STIPPLE       = 1 << 3;
        const FRAGPROG      = 1 << 4;
        const FRAGTEX       = 1 << 5;
        const VERTPROG      = 1 << 6;
        const BLEND         = 1 << 7;
        const BLEND_COLOR   = 1 << 8;
        const DEPTH_STENCIL = 1 << 9;
        const STENCIL_REF   = 1 << 10;
        const VIEWPORT      = 1 << 11;
        const VTXBUF        = 1 << 12;
        const VTXFMT        = 1 << 13;
        /// User clip planes changed; revalidates the vertex program
        const CLIP          = 1 << 14;
        /// Shader constant buffer contents changed
        const CONSTBUF      = 1 << 15;
    }
}

impl StateCategory {
    /// The category's own dirty bit (hw-dirty bookkeeping)
    pub fn dirty_bit(self) -> DirtyFlags {
        DirtyFlags::from_bits_truncate(1 << (self as u32))
    }

    /// Dirty bits that trigger revalidation of this category
    pub fn watch_mask(self) -> DirtyFlags {
        match self {
            StateCategory::Framebuffer => DirtyFlags::FRAMEBUFFER,
            StateCategory::Rasterizer => DirtyFlags::RASTERIZER,
            StateCategory::Scissor => DirtyFlags::SCISSOR | DirtyFlags::RASTERIZER,
            StateCategory::Stipple => DirtyFlags::STIPPLE,
            StateCategory::FragProg => DirtyFlags::FRAGPROG | DirtyFlags::CONSTBUF,
            StateCategory::FragTex => DirtyFlags::FRAGTEX,
            StateCategory::VertProg => {
                DirtyFlags::VERTPROG | DirtyFlags::CLIP | DirtyFlags::CONSTBUF
            }
            StateCategory::Blend => DirtyFlags::BLEND,
            StateCategory::BlendColor => DirtyFlags::BLEND_COLOR,
            StateCategory::DepthStencil => DirtyFlags::DEPTH_STENCIL,
            StateCategory::StencilRef => DirtyFlags::STENCIL_REF,
            StateCategory::Viewport => DirtyFlags::VIEWPORT,
            StateCategory::VtxBuf => DirtyFlags::VTXBUF,
            StateCategory::VtxFmt => DirtyFlags::VTXFMT,
        }
    }
}

/// Category order for full hardware validation
pub const VALIDATE_ORDER_HW: &[StateCategory] = &[
    StateCategory::Framebuffer,
    StateCategory::Rasterizer,
    StateCategory::Scissor,
    StateCategory::Stipple,
    StateCategory::FragProg,
    StateCategory::FragTex,
    StateCategory::VertProg,
    StateCategory::Blend,
    StateCategory::BlendColor,
    StateCategory::DepthStencil,
    StateCategory::StencilRef,
    StateCategory::Viewport,
    StateCategory::VtxBuf,
    StateCategory::VtxFmt,
];

/// Category order while vertex transform runs in software: the rasterizer
/// side is still hardware, but vertices arrive pre-transformed so the
/// vertex program degrades to a pass-through and the arrays are not read
pub const VALIDATE_ORDER_SWTNL: &[StateCategory] = &[
    StateCategory::Framebuffer,
    StateCategory::Rasterizer,
    StateCategory::Scissor,
    StateCategory::Stipple,
    StateCategory::FragProg,
    StateCategory::FragTex,
    StateCategory::VertProg,
    StateCategory::Blend,
    StateCategory::BlendColor,
    StateCategory::DepthStencil,
    StateCategory::StencilRef,
    StateCategory::Viewport,
];

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FramebufferState {
    pub color_offset: u32,
    pub zeta_offset: u32,
    pub pitch: u32,
    pub format: u32,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerState {
    pub cull_enable: bool,
    /// 0x0404 front, 0x0405 back
    pub cull_face: u32,
    pub front_ccw: bool,
    pub line_width: f32,
    pub point_size: f32,
    pub dither: bool,
    pub scissor_enable: bool,
    pub poly_offset_enable: bool,
    pub poly_offset_factor: f32,
    pub poly_offset_units: f32,
    pub stipple_enable: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            cull_enable: false,
            cull_face: 0x0405,
            front_ccw: true,
            line_width: 1.0,
            point_size: 1.0,
            dither: false,
            scissor_enable: false,
            poly_offset_enable: false,
            poly_offset_factor: 0.0,
            poly_offset_units: 0.0,
            stipple_enable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScissorState {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StippleState {
    pub pattern: [u32; 32],
}

impl Default for StippleState {
    fn default() -> Self {
        Self {
            pattern: [!0u32; 32],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendState {
    pub enable: bool,
    pub src_factor: u32,
    pub dst_factor: u32,
    pub equation: u32,
    pub color_mask: u8,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enable: false,
            src_factor: 1,
            dst_factor: 0,
            equation: 0x8006,
            color_mask: 0xF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    /// GL-style function codes (0x0200 + f)
    pub depth_func: u32,
    pub stencil_test: bool,
    pub stencil_func: u32,
    pub stencil_mask: u32,
    pub stencil_op_fail: u32,
    pub stencil_op_zfail: u32,
    pub stencil_op_zpass: u32,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: true,
            depth_func: 0x0201,
            stencil_test: false,
            stencil_func: 0x0207,
            stencil_mask: !0,
            stencil_op_fail: 0x1E00,
            stencil_op_zfail: 0x1E00,
            stencil_op_zpass: 0x1E00,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportState {
    pub translate: [f32; 4],
    pub scale: [f32; 4],
    pub depth_min: f32,
    pub depth_max: f32,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self {
            translate: [0.0; 4],
            scale: [1.0, 1.0, 1.0, 0.0],
            depth_min: 0.0,
            depth_max: 1.0,
        }
    }
}

/// One bound texture unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplerState {
    pub enabled: bool,
    pub offset: u32,
    pub format: u32,
    pub control: u32,
    pub filter: u32,
}

/// One bound vertex buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexBuffer {
    pub enabled: bool,
    pub offset: u32,
    pub stride: u32,
}

pub const MAX_TEX_UNITS: usize = 16;
pub const MAX_VTX_ATTRIBS: usize = 16;

/// Everything the application has set on the context
#[derive(Debug, Clone, PartialEq)]
pub struct PipeState {
    pub framebuffer: FramebufferState,
    pub rasterizer: RasterizerState,
    pub scissor: ScissorState,
    pub stipple: StippleState,
    pub blend: BlendState,
    pub blend_color: [f32; 4],
    pub depth_stencil: DepthStencilState,
    pub stencil_ref: u8,
    pub viewport: ViewportState,
    pub samplers: [SamplerState; MAX_TEX_UNITS],
    pub vtxbufs: [VertexBuffer; MAX_VTX_ATTRIBS],
    pub vtxfmt: [u32; MAX_VTX_ATTRIBS],
    /// Vertex-shader constant buffer, read through `ConstSource::External`
    pub vp_consts: Vec<[f32; 4]>,
    /// Fragment-shader constant buffer; values are baked into the program
    /// image, so a change here re-uploads the image
    pub fp_consts: Vec<[f32; 4]>,
    pub clip_plane_mask: u8,
    pub clip_planes: [[f32; 4]; 6],
}

impl Default for PipeState {
    fn default() -> Self {
        Self {
            framebuffer: FramebufferState::default(),
            rasterizer: RasterizerState::default(),
            scissor: ScissorState::default(),
            stipple: StippleState::default(),
            blend: BlendState::default(),
            blend_color: [0.0; 4],
            depth_stencil: DepthStencilState::default(),
            stencil_ref: 0,
            viewport: ViewportState::default(),
            samplers: [SamplerState::default(); MAX_TEX_UNITS],
            vtxbufs: [VertexBuffer::default(); MAX_VTX_ATTRIBS],
            vtxfmt: [0; MAX_VTX_ATTRIBS],
            vp_consts: Vec::new(),
            fp_consts: Vec::new(),
            clip_plane_mask: 0,
            clip_planes: [[0.0; 4]; 6],
        }
    }
}
