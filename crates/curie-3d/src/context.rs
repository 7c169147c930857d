//! Screen, channel and rendering context
//!
//! The [`Screen`] owns the per-device resources every context shares: the
//! instruction and constant heaps and the registry used to notify programs
//! when an allocation evicts them. A [`Channel`] mirrors what the hardware
//! currently has bound, so several contexts can interleave on one channel
//! and only re-emit what actually differs.
//!
//! The driver core is single-threaded by contract; shared ownership is
//! `Rc`/`RefCell`, never locks.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use curie_core::{AllocationError, DeviceLimits};

use crate::fallback::FallbackState;
use crate::heap::{ProgramId, ResourceHeap};
use crate::ir;
use crate::program::ShaderProgram;
use crate::state::{
    BlendState, DepthStencilState, DirtyFlags, FramebufferState, PipeState, RasterizerState,
    SamplerState, ScissorState, StippleState, VertexBuffer, ViewportState, CATEGORY_COUNT,
};
use crate::stateobj::StateObject;

static NEXT_CONTEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Per-device shared state
pub struct Screen {
    pub limits: DeviceLimits,
    /// On-chip program store, in instruction slots
    pub exec_heap: RefCell<ResourceHeap>,
    /// Constant register file, in vec4 slots
    pub const_heap: RefCell<ResourceHeap>,
    programs: RefCell<HashMap<ProgramId, Weak<RefCell<ShaderProgram>>>>,
}

impl Screen {
    pub fn new(limits: DeviceLimits) -> Rc<Self> {
        Rc::new(Self {
            limits,
            exec_heap: RefCell::new(ResourceHeap::new(limits.max_exec_slots)),
            const_heap: RefCell::new(ResourceHeap::new(limits.max_const_slots)),
            programs: RefCell::new(HashMap::new()),
        })
    }

    /// Create a shader program and register it for eviction callbacks
    pub fn create_program(&self, ir: ir::Program) -> Rc<RefCell<ShaderProgram>> {
        let prog = Rc::new(RefCell::new(ShaderProgram::new(ir)));
        let id = prog.borrow().id;
        self.programs.borrow_mut().insert(id, Rc::downgrade(&prog));
        prog
    }

    /// Mark programs whose heap ranges were reclaimed: release whatever
    /// ranges they still hold in the other heap and force retranslation
    pub(crate) fn mark_evicted(&self, evicted: &[ProgramId]) {
        let mut registry = self.programs.borrow_mut();
        for id in evicted {
            let Some(prog) = registry.get(id).and_then(Weak::upgrade) else {
                registry.remove(id);
                continue;
            };
            let mut prog = prog.borrow_mut();
            if let Some(r) = prog.exec.take() {
                self.exec_heap.borrow_mut().free(&r);
            }
            if let Some(r) = prog.data.take() {
                self.const_heap.borrow_mut().free(&r);
            }
            prog.on_evicted();
            debug!(id = prog.id, "program evicted from the store");
        }
    }

    /// Allocate from `heap`, evicting oldest-bound owners on exhaustion
    pub(crate) fn alloc_evicting(
        &self,
        heap: &RefCell<ResourceHeap>,
        len: u32,
        owner: ProgramId,
    ) -> Result<crate::heap::HeapRange, AllocationError> {
        let evicted = {
            let mut heap = heap.borrow_mut();
            match heap.allocate(len, owner) {
                Ok(range) => return Ok(range),
                Err(_) => heap.evict_until(len, owner)?,
            }
        };
        self.mark_evicted(&evicted);
        heap.borrow_mut().allocate(len, owner)
    }
}

/// Hardware channel: what the chip currently has bound
pub struct Channel {
    pub bound: [Option<Rc<StateObject>>; CATEGORY_COUNT],
    pub current_context: Option<u32>,
}

impl Channel {
    pub fn new() -> Self {
        Self {
            bound: Default::default(),
            current_context: None,
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

/// One rendering context
pub struct Context {
    pub id: u32,
    pub screen: Rc<Screen>,
    pub pipe: PipeState,
    /// Categories the application touched since the last validation
    pub dirty: DirtyFlags,
    /// Categories whose state objects changed and still await emission
    pub(crate) hw_dirty: DirtyFlags,
    pub(crate) state_objects: [Option<Rc<StateObject>>; CATEGORY_COUNT],
    pub(crate) vertprog: Option<Rc<RefCell<ShaderProgram>>>,
    pub(crate) fragprog: Option<Rc<RefCell<ShaderProgram>>>,
    /// Pass-through vertex program used while transform runs in software
    pub(crate) swtnl_vp: Option<Rc<RefCell<ShaderProgram>>>,
    pub(crate) fallback: FallbackState,
}

impl Context {
    pub fn new(screen: Rc<Screen>) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            screen,
            pipe: PipeState::default(),
            // Everything is dirty until the first validation
            dirty: DirtyFlags::all(),
            hw_dirty: DirtyFlags::empty(),
            state_objects: Default::default(),
            vertprog: None,
            fragprog: None,
            swtnl_vp: None,
            fallback: FallbackState::new(),
        }
    }

    fn mark(&mut self, bits: DirtyFlags) {
        self.dirty |= bits;
    }

    pub fn set_framebuffer(&mut self, fb: FramebufferState) {
        self.pipe.framebuffer = fb;
        self.mark(DirtyFlags::FRAMEBUFFER);
    }

    pub fn set_rasterizer(&mut self, rast: RasterizerState) {
        self.pipe.rasterizer = rast;
        self.mark(DirtyFlags::RASTERIZER);
    }

    pub fn set_scissor(&mut self, scissor: ScissorState) {
        self.pipe.scissor = scissor;
        self.mark(DirtyFlags::SCISSOR);
    }

    pub fn set_stipple(&mut self, stipple: StippleState) {
        self.pipe.stipple = stipple;
        self.mark(DirtyFlags::STIPPLE);
    }

    pub fn set_blend(&mut self, blend: BlendState) {
        self.pipe.blend = blend;
        self.mark(DirtyFlags::BLEND);
    }

    pub fn set_blend_color(&mut self, color: [f32; 4]) {
        self.pipe.blend_color = color;
        self.mark(DirtyFlags::BLEND_COLOR);
    }

    pub fn set_depth_stencil(&mut self, zsa: DepthStencilState) {
        self.pipe.depth_stencil = zsa;
        self.mark(DirtyFlags::DEPTH_STENCIL);
    }

    pub fn set_stencil_ref(&mut self, reference: u8) {
        self.pipe.stencil_ref = reference;
        self.mark(DirtyFlags::STENCIL_REF);
    }

    pub fn set_viewport(&mut self, viewport: ViewportState) {
        self.pipe.viewport = viewport;
        self.mark(DirtyFlags::VIEWPORT);
    }

    pub fn set_sampler(&mut self, unit: usize, sampler: SamplerState) {
        self.pipe.samplers[unit] = sampler;
        self.mark(DirtyFlags::FRAGTEX);
    }

    pub fn set_vertex_buffer(&mut self, attrib: usize, buf: VertexBuffer) {
        self.pipe.vtxbufs[attrib] = buf;
        self.mark(DirtyFlags::VTXBUF);
    }

    pub fn set_vertex_format(&mut self, attrib: usize, format: u32) {
        self.pipe.vtxfmt[attrib] = format;
        self.mark(DirtyFlags::VTXFMT);
    }

    pub fn set_vp_constants(&mut self, consts: Vec<[f32; 4]>) {
        self.pipe.vp_consts = consts;
        self.mark(DirtyFlags::CONSTBUF);
    }

    pub fn set_fp_constants(&mut self, consts: Vec<[f32; 4]>) {
        self.pipe.fp_consts = consts;
        self.mark(DirtyFlags::CONSTBUF);
    }

    pub fn set_clip_planes(&mut self, mask: u8, planes: [[f32; 4]; 6]) {
        self.pipe.clip_plane_mask = mask;
        self.pipe.clip_planes = planes;
        self.mark(DirtyFlags::CLIP);
    }

    pub fn bind_vertex_program(&mut self, prog: Rc<RefCell<ShaderProgram>>) {
        self.vertprog = Some(prog);
        // The pass-through mirrors the bound program's outputs
        self.swtnl_vp = None;
        self.mark(DirtyFlags::VERTPROG);
    }

    pub fn bind_fragment_program(&mut self, prog: Rc<RefCell<ShaderProgram>>) {
        self.fragprog = Some(prog);
        self.mark(DirtyFlags::FRAGPROG);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Program;

    #[test]
    fn test_eviction_marks_programs_untranslated() {
        let screen = Screen::new(DeviceLimits {
            max_exec_slots: 4,
            ..DeviceLimits::curie()
        });

        let a = screen.create_program(Program::new());
        let b = screen.create_program(Program::new());
        let (a_id, b_id) = (a.borrow().id, b.borrow().id);

        a.borrow_mut().exec = Some(screen.exec_heap.borrow_mut().allocate(3, a_id).unwrap());
        a.borrow_mut().translated = true;

        // No room left for b without reclaiming a
        let range = screen
            .alloc_evicting(&screen.exec_heap, 3, b_id)
            .unwrap();
        b.borrow_mut().exec = Some(range);

        assert!(!a.borrow().translated);
        assert!(a.borrow().exec.is_none());
        assert_eq!(screen.exec_heap.borrow().ranges().len(), 1);
    }

    #[test]
    fn test_eviction_releases_other_heap_ranges() {
        let screen = Screen::new(DeviceLimits {
            max_exec_slots: 4,
            max_const_slots: 8,
            ..DeviceLimits::curie()
        });

        let a = screen.create_program(Program::new());
        let a_id = a.borrow().id;
        a.borrow_mut().exec = Some(screen.exec_heap.borrow_mut().allocate(4, a_id).unwrap());
        a.borrow_mut().data = Some(screen.const_heap.borrow_mut().allocate(2, a_id).unwrap());

        let b = screen.create_program(Program::new());
        let b_id = b.borrow().id;
        screen.alloc_evicting(&screen.exec_heap, 2, b_id).unwrap();

        assert!(a.borrow().data.is_none());
        assert_eq!(screen.const_heap.borrow().used(), 0);
    }

    #[test]
    fn test_failed_eviction_keeps_victims_consistent() {
        let screen = Screen::new(DeviceLimits {
            max_exec_slots: 8,
            ..DeviceLimits::curie()
        });

        let a = screen.create_program(Program::new());
        let a_id = a.borrow().id;
        let a_range = screen.exec_heap.borrow_mut().allocate(2, a_id).unwrap();
        a.borrow_mut().exec = Some(a_range);
        a.borrow_mut().translated = true;

        let keeper = screen.create_program(Program::new());
        let k_id = keeper.borrow().id;
        keeper.borrow_mut().exec =
            Some(screen.exec_heap.borrow_mut().allocate(6, k_id).unwrap());

        // Even with a evicted there is no 4-slot gap, so the allocation
        // fails; a must still own a range the heap tracks
        screen.alloc_evicting(&screen.exec_heap, 4, k_id).unwrap_err();
        assert!(a.borrow().translated);
        assert_eq!(a.borrow().exec, Some(a_range));
        assert!(screen.exec_heap.borrow().ranges().contains(&a_range));
    }

    #[test]
    fn test_setters_mark_dirty() {
        let screen = Screen::new(DeviceLimits::curie());
        let mut ctx = Context::new(screen);
        ctx.dirty = DirtyFlags::empty();

        ctx.set_blend(BlendState::default());
        assert_eq!(ctx.dirty, DirtyFlags::BLEND);

        ctx.set_clip_planes(0x1, [[0.0; 4]; 6]);
        assert!(ctx.dirty.contains(DirtyFlags::CLIP));
    }
}
