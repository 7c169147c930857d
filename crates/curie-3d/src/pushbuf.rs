//! Command-stream collaborator boundary
//!
//! The core never inspects the outgoing buffer after appending; submission
//! and synchronization belong to the winsys. [`RecordingPushBuffer`] backs
//! the tests and records the raw word stream.

use bitflags::bitflags;

bitflags! {
    /// Relocation hints for buffer-object addresses
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RelocFlags: u8 {
        const VRAM = 0x01;
        const GART = 0x02;
        const RD = 0x04;
        const WR = 0x08;
    }
}

/// Opaque append sink for encoded commands
pub trait PushBuffer {
    /// Start a method group of `count` data words
    fn begin_method(&mut self, method: u32, count: u32);
    /// Append one data word to the open group
    fn append_data(&mut self, word: u32);
    /// Append one word that the winsys must relocate at submit time
    fn append_relocated(&mut self, word: u32, flags: RelocFlags);
}

/// Test/replay sink recording the raw stream
#[derive(Debug, Default)]
pub struct RecordingPushBuffer {
    pub words: Vec<u32>,
}

impl RecordingPushBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl PushBuffer for RecordingPushBuffer {
    fn begin_method(&mut self, method: u32, count: u32) {
        // Header layout matches the ring format: size in the high half
        self.words.push((count << 18) | (method & 0x1FFF));
    }

    fn append_data(&mut self, word: u32) {
        self.words.push(word);
    }

    fn append_relocated(&mut self, word: u32, _flags: RelocFlags) {
        self.words.push(word);
    }
}

/// 3D engine methods used by the state emitter
pub mod methods {
    // Framebuffer
    pub const SET_SURFACE_FORMAT: u32 = 0x0180;
    pub const SET_SURFACE_COLOR_OFFSET: u32 = 0x0194;
    pub const SET_SURFACE_ZETA_OFFSET: u32 = 0x01B8;
    pub const SET_SURFACE_PITCH: u32 = 0x01A4;

    // Rasterizer
    pub const SET_CULL_FACE_ENABLE: u32 = 0x0410;
    pub const SET_CULL_FACE: u32 = 0x0414;
    pub const SET_FRONT_FACE: u32 = 0x0418;
    pub const SET_LINE_WIDTH: u32 = 0x0420;
    pub const SET_POLYGON_OFFSET_ENABLE: u32 = 0x0424;
    pub const SET_POLYGON_OFFSET: u32 = 0x0428;
    pub const SET_DITHER_ENABLE: u32 = 0x042C;
    pub const SET_POINT_SIZE: u32 = 0x0430;
    pub const SET_SCISSOR_ENABLE: u32 = 0x0434;

    // Scissor
    pub const SET_SCISSOR_HORIZONTAL: u32 = 0x02C0;
    pub const SET_SCISSOR_VERTICAL: u32 = 0x02C4;

    // Polygon stipple
    pub const SET_STIPPLE_ENABLE: u32 = 0x0438;
    pub const SET_STIPPLE_PATTERN: u32 = 0x0700; // 32 words

    // Blend
    pub const SET_BLEND_ENABLE: u32 = 0x0310;
    pub const SET_BLEND_FUNC_SFACTOR: u32 = 0x0314;
    pub const SET_BLEND_FUNC_DFACTOR: u32 = 0x0318;
    pub const SET_COLOR_MASK: u32 = 0x0324;
    pub const SET_BLEND_EQUATION: u32 = 0x0340;
    pub const SET_BLEND_COLOR: u32 = 0x0344;

    // Depth / stencil
    pub const SET_DEPTH_TEST_ENABLE: u32 = 0x030C;
    pub const SET_DEPTH_FUNC: u32 = 0x0374;
    pub const SET_DEPTH_MASK: u32 = 0x0378;
    pub const SET_STENCIL_TEST_ENABLE: u32 = 0x0348;
    pub const SET_STENCIL_FUNC: u32 = 0x034C;
    pub const SET_STENCIL_OP_FAIL: u32 = 0x0354;
    pub const SET_STENCIL_OP_ZFAIL: u32 = 0x0358;
    pub const SET_STENCIL_OP_ZPASS: u32 = 0x035C;
    pub const SET_STENCIL_MASK: u32 = 0x0360;
    pub const SET_STENCIL_FUNC_REF: u32 = 0x0364;

    // Viewport
    pub const SET_VIEWPORT_TRANSLATE: u32 = 0x0A20; // 4 words
    pub const SET_VIEWPORT_SCALE: u32 = 0x0A30; // 4 words
    pub const SET_DEPTH_RANGE: u32 = 0x0394; // 2 words

    // Vertex programs
    pub const VP_UPLOAD_FROM_ID: u32 = 0x1E9C;
    pub const VP_UPLOAD_INST: u32 = 0x0B80; // 4 words per group
    pub const VP_UPLOAD_CONST_ID: u32 = 0x1EA4; // id + 4 value words
    pub const VP_START_FROM_ID: u32 = 0x1EA0;
    pub const VP_ATTRIB_EN: u32 = 0x1FF0;
    pub const VP_RESULT_EN: u32 = 0x1FF4;

    // Fragment programs
    pub const FP_ACTIVE_PROGRAM: u32 = 0x08E4;
    pub const FP_CONTROL: u32 = 0x1D60;

    // Textures
    pub const TEX_OFFSET: u32 = 0x1A00; // unit stride 0x20
    pub const TEX_FORMAT: u32 = 0x1A04;
    pub const TEX_CONTROL: u32 = 0x1A08;
    pub const TEX_FILTER: u32 = 0x1A0C;
    pub const TEX_UNIT_STRIDE: u32 = 0x20;

    /// Texture-unit cache invalidation toggle; written twice (2 then 1)
    /// whenever fragment-program or fragment-texture state was re-emitted
    pub const TEX_CACHE_CTL: u32 = 0x1FD8;

    // Vertex arrays
    pub const VTXBUF_ADDRESS: u32 = 0x1680; // per attribute
    pub const VTXFMT: u32 = 0x1740; // per attribute
}
