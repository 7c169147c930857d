//! Dirty-bit state validation
//!
//! `Context::validate` walks the mode's category table in fixed order and
//! rebuilds the state object of every category whose watch bits are dirty.
//! Rebuilding is pure: commands are recorded into a fresh object and the
//! cached one is kept when the rebuild turns out value-equal. Shader
//! categories additionally drive the translate / allocate / patch cycle
//! here, so a hardware-incompatible program surfaces as a fallback before
//! anything reaches the channel.

use std::rc::Rc;

use tracing::{debug, warn};

use curie_core::{Result, ValidationError};

use crate::fallback::RenderMode;
use crate::ir::Semantic;
use crate::program::ConstSource;
use crate::pushbuf::{methods, RelocFlags};
use crate::state::{StateCategory, VALIDATE_ORDER_HW, VALIDATE_ORDER_SWTNL};
use crate::stateobj::StateObjectBuilder;
use crate::translate::{self, TranslateOptions};
use crate::context::Context;

/// Outcome of a validation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The hardware renders the draw
    Ready,
    /// Part or all of the draw runs on the CPU
    NeedsSoftwareFallback {
        mode: RenderMode,
        reason: &'static str,
    },
}

impl Context {
    /// Validate all dirty state for the next draw, downgrading the render
    /// mode until a path that accepts the current state is found.
    ///
    /// Retry gating runs once, up front: a failure inside this call walks
    /// straight down the downgrade ladder. The next `validate` call is
    /// where a hardware retry can be earned again.
    pub fn validate(&mut self) -> Result<ValidationOutcome> {
        let mut mode = self.fallback.pick_mode(self.dirty);
        loop {
            let order = match mode {
                RenderMode::Hardware => VALIDATE_ORDER_HW,
                RenderMode::SoftwareTransform => VALIDATE_ORDER_SWTNL,
                RenderMode::SoftwareRasterize => {
                    self.dirty = Default::default();
                    return Ok(ValidationOutcome::NeedsSoftwareFallback {
                        mode,
                        reason: self.fallback.reason(),
                    });
                }
            };

            match self.validate_categories(order, mode) {
                Ok(()) => {
                    self.dirty = Default::default();
                    return Ok(match mode {
                        RenderMode::Hardware => ValidationOutcome::Ready,
                        _ => ValidationOutcome::NeedsSoftwareFallback {
                            mode,
                            reason: self.fallback.reason(),
                        },
                    });
                }
                Err((blocking, reason)) => {
                    match self.fallback.downgrade(blocking, reason) {
                        Some(next) => mode = next,
                        None => return Err(ValidationError::NoRenderPath.into()),
                    }
                }
            }
        }
    }

    /// On failure returns the failing category's watch bits (the set that
    /// gates future hardware retries) plus the reason
    fn validate_categories(
        &mut self,
        order: &[StateCategory],
        mode: RenderMode,
    ) -> std::result::Result<(), (crate::state::DirtyFlags, &'static str)> {
        // Both shader categories allocate from the same store, so a later
        // category can evict an earlier one's program mid-pass. Rerun until
        // every bound program holds its ranges; persistent thrash means the
        // store cannot fit this draw's programs at once.
        for _attempt in 0..4 {
            self.validate_pass(order, mode)?;
            let mut redo = crate::state::DirtyFlags::empty();
            if self.shader_stale(StateCategory::FragProg, mode) {
                redo |= crate::state::DirtyFlags::FRAGPROG;
            }
            if self.shader_stale(StateCategory::VertProg, mode) {
                redo |= crate::state::DirtyFlags::VERTPROG;
            }
            if redo.is_empty() {
                return Ok(());
            }
            self.dirty |= redo;
        }
        Err((
            crate::state::DirtyFlags::FRAGPROG | crate::state::DirtyFlags::VERTPROG,
            "program store cannot hold both programs",
        ))
    }

    /// True when the category's bound program lost its translation or its
    /// heap ranges (eviction) since its state object was built
    fn shader_stale(&self, cat: StateCategory, mode: RenderMode) -> bool {
        let prog = match cat {
            StateCategory::FragProg => self.fragprog.as_ref(),
            StateCategory::VertProg => match mode {
                RenderMode::SoftwareTransform => self.swtnl_vp.as_ref(),
                _ => self.vertprog.as_ref(),
            },
            _ => return false,
        };
        prog.is_some_and(|p| {
            let p = p.borrow();
            !p.translated || p.exec.is_none()
        })
    }

    fn validate_pass(
        &mut self,
        order: &[StateCategory],
        mode: RenderMode,
    ) -> std::result::Result<(), (crate::state::DirtyFlags, &'static str)> {
        for &cat in order {
            if !self.dirty.intersects(cat.watch_mask())
                && self.state_objects[cat as usize].is_some()
                && !self.shader_stale(cat, mode)
            {
                continue;
            }

            let fail = |reason| (cat.watch_mask(), reason);
            // A shader category whose program image was freshly placed in
            // the store must re-emit even when the rebuilt command list is
            // value-equal to the cached one: equality says nothing about
            // what the store currently holds
            let mut fresh_upload = false;
            let builder = match cat {
                StateCategory::Framebuffer => self.build_framebuffer(),
                StateCategory::Rasterizer => self.build_rasterizer(),
                StateCategory::Scissor => self.build_scissor(),
                StateCategory::Stipple => self.build_stipple(),
                StateCategory::FragProg => {
                    let (b, fresh) = self.build_fragprog().map_err(fail)?;
                    fresh_upload = fresh;
                    b
                }
                StateCategory::FragTex => self.build_fragtex().map_err(fail)?,
                StateCategory::VertProg => match self.build_vertprog(mode).map_err(fail)? {
                    Some((b, fresh)) => {
                        fresh_upload = fresh;
                        b
                    }
                    // nothing to re-upload, the cached object stands
                    None => continue,
                },
                StateCategory::Blend => self.build_blend(),
                StateCategory::BlendColor => self.build_blend_color(),
                StateCategory::DepthStencil => self.build_depth_stencil(),
                StateCategory::StencilRef => self.build_stencil_ref(),
                StateCategory::Viewport => self.build_viewport(),
                StateCategory::VtxBuf => self.build_vtxbuf(),
                StateCategory::VtxFmt => self.build_vtxfmt(),
            };

            let cached = self.state_objects[cat as usize].as_ref();
            let (obj, changed) = if fresh_upload {
                (builder.build(), true)
            } else {
                builder.build_or_keep(cached)
            };
            self.state_objects[cat as usize] = Some(obj);
            if changed {
                self.hw_dirty |= cat.dirty_bit();
                debug!(?cat, "state object rebuilt");
            }
        }
        Ok(())
    }

    fn build_framebuffer(&self) -> StateObjectBuilder {
        let fb = &self.pipe.framebuffer;
        let mut b = StateObjectBuilder::new();
        b.method(methods::SET_SURFACE_FORMAT, 1).data(fb.format);
        b.method(methods::SET_SURFACE_PITCH, 1)
            .data(fb.pitch | (fb.pitch << 16));
        b.method(methods::SET_SURFACE_COLOR_OFFSET, 1)
            .reloc(fb.color_offset, RelocFlags::VRAM | RelocFlags::WR);
        b.method(methods::SET_SURFACE_ZETA_OFFSET, 1)
            .reloc(fb.zeta_offset, RelocFlags::VRAM | RelocFlags::WR);
        b
    }

    fn build_rasterizer(&self) -> StateObjectBuilder {
        let r = &self.pipe.rasterizer;
        let mut b = StateObjectBuilder::new();
        b.method(methods::SET_CULL_FACE_ENABLE, 1)
            .data(r.cull_enable as u32);
        b.method(methods::SET_CULL_FACE, 1).data(r.cull_face);
        b.method(methods::SET_FRONT_FACE, 1)
            .data(if r.front_ccw { 0x0901 } else { 0x0900 });
        // fixed point, 1/8 pixel
        b.method(methods::SET_LINE_WIDTH, 1)
            .data((r.line_width * 8.0) as u32);
        b.method(methods::SET_POINT_SIZE, 1).data_f32(r.point_size);
        b.method(methods::SET_POLYGON_OFFSET_ENABLE, 1)
            .data(r.poly_offset_enable as u32);
        b.method(methods::SET_POLYGON_OFFSET, 2)
            .data_f32(r.poly_offset_factor)
            .data_f32(r.poly_offset_units);
        b.method(methods::SET_DITHER_ENABLE, 1).data(r.dither as u32);
        b.method(methods::SET_SCISSOR_ENABLE, 1)
            .data(r.scissor_enable as u32);
        b.method(methods::SET_STIPPLE_ENABLE, 1)
            .data(r.stipple_enable as u32);
        b
    }

    fn build_scissor(&self) -> StateObjectBuilder {
        // With the scissor off the window rect covers the whole surface
        let (x, y, w, h) = if self.pipe.rasterizer.scissor_enable {
            let s = &self.pipe.scissor;
            (s.x, s.y, s.width, s.height)
        } else {
            (0, 0, 4096, 4096)
        };
        let mut b = StateObjectBuilder::new();
        b.method(methods::SET_SCISSOR_HORIZONTAL, 1)
            .data(((w as u32) << 16) | x as u32);
        b.method(methods::SET_SCISSOR_VERTICAL, 1)
            .data(((h as u32) << 16) | y as u32);
        b
    }

    fn build_stipple(&self) -> StateObjectBuilder {
        let mut b = StateObjectBuilder::new();
        b.method(methods::SET_STIPPLE_PATTERN, 32);
        for word in self.pipe.stipple.pattern {
            b.data(word);
        }
        b
    }

    fn build_blend(&self) -> StateObjectBuilder {
        let blend = &self.pipe.blend;
        let mut b = StateObjectBuilder::new();
        b.method(methods::SET_BLEND_ENABLE, 1).data(blend.enable as u32);
        b.method(methods::SET_BLEND_FUNC_SFACTOR, 1)
            .data(blend.src_factor);
        b.method(methods::SET_BLEND_FUNC_DFACTOR, 1)
            .data(blend.dst_factor);
        b.method(methods::SET_BLEND_EQUATION, 1).data(blend.equation);
        b.method(methods::SET_COLOR_MASK, 1)
            .data(blend.color_mask as u32);
        b
    }

    fn build_blend_color(&self) -> StateObjectBuilder {
        let c = self.pipe.blend_color;
        let pack = |v: f32| (v.clamp(0.0, 1.0) * 255.0) as u32;
        let mut b = StateObjectBuilder::new();
        b.method(methods::SET_BLEND_COLOR, 1)
            .data((pack(c[3]) << 24) | (pack(c[0]) << 16) | (pack(c[1]) << 8) | pack(c[2]));
        b
    }

    fn build_depth_stencil(&self) -> StateObjectBuilder {
        let z = &self.pipe.depth_stencil;
        let mut b = StateObjectBuilder::new();
        b.method(methods::SET_DEPTH_TEST_ENABLE, 1)
            .data(z.depth_test as u32);
        b.method(methods::SET_DEPTH_FUNC, 1).data(z.depth_func);
        b.method(methods::SET_DEPTH_MASK, 1).data(z.depth_write as u32);
        b.method(methods::SET_STENCIL_TEST_ENABLE, 1)
            .data(z.stencil_test as u32);
        b.method(methods::SET_STENCIL_FUNC, 1).data(z.stencil_func);
        b.method(methods::SET_STENCIL_MASK, 1).data(z.stencil_mask);
        b.method(methods::SET_STENCIL_OP_FAIL, 1)
            .data(z.stencil_op_fail);
        b.method(methods::SET_STENCIL_OP_ZFAIL, 1)
            .data(z.stencil_op_zfail);
        b.method(methods::SET_STENCIL_OP_ZPASS, 1)
            .data(z.stencil_op_zpass);
        b
    }

    fn build_stencil_ref(&self) -> StateObjectBuilder {
        let mut b = StateObjectBuilder::new();
        b.method(methods::SET_STENCIL_FUNC_REF, 1)
            .data(self.pipe.stencil_ref as u32);
        b
    }

    fn build_viewport(&self) -> StateObjectBuilder {
        let vp = &self.pipe.viewport;
        let mut b = StateObjectBuilder::new();
        b.method(methods::SET_VIEWPORT_TRANSLATE, 4);
        for v in vp.translate {
            b.data_f32(v);
        }
        b.method(methods::SET_VIEWPORT_SCALE, 4);
        for v in vp.scale {
            b.data_f32(v);
        }
        b.method(methods::SET_DEPTH_RANGE, 2)
            .data_f32(vp.depth_min)
            .data_f32(vp.depth_max);
        b
    }

    fn build_vtxbuf(&self) -> StateObjectBuilder {
        let mut b = StateObjectBuilder::new();
        for (attrib, buf) in self.pipe.vtxbufs.iter().enumerate() {
            if !buf.enabled {
                continue;
            }
            b.method(methods::VTXBUF_ADDRESS + 4 * attrib as u32, 1).reloc(
                buf.offset,
                RelocFlags::VRAM | RelocFlags::GART | RelocFlags::RD,
            );
        }
        b
    }

    fn build_vtxfmt(&self) -> StateObjectBuilder {
        let mut b = StateObjectBuilder::new();
        for (attrib, buf) in self.pipe.vtxbufs.iter().enumerate() {
            let fmt = self.pipe.vtxfmt[attrib];
            let word = if buf.enabled {
                fmt | (buf.stride << 8)
            } else {
                // disabled attribs read as a constant float
                0x2
            };
            b.method(methods::VTXFMT + 4 * attrib as u32, 1).data(word);
        }
        b
    }

    fn build_fragtex(&self) -> std::result::Result<StateObjectBuilder, &'static str> {
        let mut b = StateObjectBuilder::new();
        for (unit, sampler) in self.pipe.samplers.iter().enumerate() {
            if !sampler.enabled {
                continue;
            }
            if unit as u32 >= self.screen.limits.max_samplers {
                warn!(unit, "sampler unit beyond hardware limit");
                return Err("too many samplers");
            }
            b.method(
                methods::TEX_OFFSET + methods::TEX_UNIT_STRIDE * unit as u32,
                4,
            )
            .reloc(sampler.offset, RelocFlags::VRAM | RelocFlags::RD)
            .data(sampler.format)
            .data(sampler.control)
            .data(sampler.filter);
        }
        Ok(b)
    }

    /// Fragment program: translate on demand, bake constants into the
    /// image, place it in the program store and point the fragment pipe at
    /// it. Returns the builder plus whether a fresh image copy went into
    /// the store.
    fn build_fragprog(&mut self) -> std::result::Result<(StateObjectBuilder, bool), &'static str> {
        let prog_rc = self
            .fragprog
            .clone()
            .ok_or("no fragment program bound")?;
        let mut prog = prog_rc.borrow_mut();

        let mut fresh = false;
        if !prog.translated {
            let compiled = translate::translate(
                &prog.ir,
                &self.screen.limits,
                &TranslateOptions::default(),
            )
            .map_err(|err| {
                warn!(%err, id = prog.id, "fragment program translation failed");
                "fragment program translation failed"
            })?;
            if let Some(r) = prog.exec.take() {
                self.screen.exec_heap.borrow_mut().free(&r);
            }
            prog.set_compiled(compiled, 0);
            fresh = true;
        }

        // The fragment pipe has no constant register file; values ride
        // inline in the image, so a buffer change rewrites the extension
        // groups and forces a new resident copy
        let mut image_stale = false;
        if let Some(compiled) = prog.compiled.as_mut() {
            for entry in compiled.consts.iter_mut() {
                let ConstSource::External(index) = entry.source else {
                    continue;
                };
                entry.value = self
                    .pipe
                    .fp_consts
                    .get(index as usize)
                    .copied()
                    .unwrap_or([0.0; 4]);
            }
            image_stale = compiled.bake_const_values();
        }
        if image_stale {
            if let Some(r) = prog.exec.take() {
                self.screen.exec_heap.borrow_mut().free(&r);
            }
            fresh = true;
        }

        let slots = prog.compiled.as_ref().map_or(1, |c| c.slot_len().max(1));
        if prog.exec.is_none() {
            let range = self
                .screen
                .alloc_evicting(&self.screen.exec_heap, slots, prog.id)
                .map_err(|err| {
                    warn!(%err, id = prog.id, "fragment program store exhausted");
                    "fragment program store exhausted"
                })?;
            prog.exec = Some(range);
            fresh = true;
        }
        prog.patch_addresses();

        let exec = prog.exec.as_ref().map_or(0, |r| r.start);
        let mut b = StateObjectBuilder::new();
        b.method(methods::FP_ACTIVE_PROGRAM, 1)
            .reloc(exec, RelocFlags::VRAM | RelocFlags::RD);
        b.method(methods::FP_CONTROL, 1)
            .data(prog.compiled.as_ref().map_or(0, |c| c.slot_len() << 16));
        Ok((b, fresh))
    }

    /// Vertex program: translate (with the clip-plane redirect in hardware
    /// mode), allocate store and constant ranges, patch addresses, refresh
    /// changed external constants, and record the upload plus activation
    fn build_vertprog(
        &mut self,
        mode: RenderMode,
    ) -> std::result::Result<Option<(StateObjectBuilder, bool)>, &'static str> {
        let prog_rc = match mode {
            RenderMode::SoftwareTransform => self.swtnl_passthrough(),
            _ => self.vertprog.clone().ok_or("no vertex program bound")?,
        };
        let mut prog = prog_rc.borrow_mut();

        let clip_mask = match mode {
            RenderMode::Hardware => self.pipe.clip_plane_mask,
            _ => 0,
        };
        prog.set_clip_planes(clip_mask);

        let mut upload = false;
        if !prog.translated {
            let opts = TranslateOptions {
                clip_plane_mask: clip_mask,
                clip_planes: self.pipe.clip_planes,
            };
            let compiled = translate::translate(&prog.ir, &self.screen.limits, &opts)
                .map_err(|err| {
                    warn!(%err, id = prog.id, "vertex program translation failed");
                    "vertex program translation failed"
                })?;
            if let Some(r) = prog.exec.take() {
                self.screen.exec_heap.borrow_mut().free(&r);
            }
            if let Some(r) = prog.data.take() {
                self.screen.const_heap.borrow_mut().free(&r);
            }
            prog.set_compiled(compiled, clip_mask);
            upload = true;
        }

        let (slots, nconsts) = prog
            .compiled
            .as_ref()
            .map_or((1, 0), |c| (c.slot_len().max(1), c.consts.len() as u32));

        if prog.exec.is_none() {
            let range = self
                .screen
                .alloc_evicting(&self.screen.exec_heap, slots, prog.id)
                .map_err(|err| {
                    warn!(%err, id = prog.id, "vertex program store exhausted");
                    "vertex program store exhausted"
                })?;
            prog.exec = Some(range);
            upload = true;
        }
        if nconsts > 0 && prog.data.is_none() {
            let range = self
                .screen
                .alloc_evicting(&self.screen.const_heap, nconsts, prog.id)
                .map_err(|err| {
                    warn!(%err, id = prog.id, "constant registers exhausted");
                    "constant registers exhausted"
                })?;
            prog.data = Some(range);
            upload = true;
        }
        if prog.patch_addresses() {
            upload = true;
        }

        // Refresh external constants whose buffer values changed
        let mut stale = Vec::new();
        if let Some(compiled) = prog.compiled.as_mut() {
            for (slot, entry) in compiled.consts.iter_mut().enumerate() {
                let ConstSource::External(index) = entry.source else {
                    continue;
                };
                let value = self
                    .pipe
                    .vp_consts
                    .get(index as usize)
                    .copied()
                    .unwrap_or([0.0; 4]);
                if value.iter().map(|v| v.to_bits()).ne(entry.value.iter().map(|v| v.to_bits())) {
                    entry.value = value;
                    stale.push(slot as u32);
                }
            }
        }

        if !upload
            && stale.is_empty()
            && self.state_objects[StateCategory::VertProg as usize].is_some()
        {
            return Ok(None);
        }

        let exec_start = prog.exec.as_ref().map_or(0, |r| r.start);
        let const_start = prog.data.as_ref().map_or(0, |r| r.start);
        let compiled = prog.compiled.as_ref();

        let mut b = StateObjectBuilder::new();
        if let Some(c) = compiled {
            if upload {
                b.method(methods::VP_UPLOAD_FROM_ID, 1).data(exec_start);
                for group in &c.groups {
                    b.method(methods::VP_UPLOAD_INST, 4);
                    for word in group {
                        b.data(*word);
                    }
                }
            }
            // Full image upload rewrites every slot; otherwise only the
            // stale ones
            let slots: Vec<u32> = if upload {
                (0..c.consts.len() as u32).collect()
            } else {
                stale
            };
            for slot in slots {
                let entry = &c.consts[slot as usize];
                b.method(methods::VP_UPLOAD_CONST_ID, 5).data(const_start + slot);
                for v in entry.value {
                    b.data_f32(v);
                }
            }
            b.method(methods::VP_START_FROM_ID, 1).data(exec_start);
            b.method(methods::VP_ATTRIB_EN, 1).data(c.input_mask);
            b.method(methods::VP_RESULT_EN, 1).data(c.output_mask);
        }
        Ok(Some((b, upload)))
    }

    /// The pass-through program mirrors the bound program's output
    /// signature so the rasterizer side sees the same interpolants
    fn swtnl_passthrough(&mut self) -> Rc<std::cell::RefCell<crate::program::ShaderProgram>> {
        if let Some(prog) = &self.swtnl_vp {
            return Rc::clone(prog);
        }
        let mut semantics: Vec<Semantic> = self
            .vertprog
            .as_ref()
            .map(|p| p.borrow().ir.outputs().filter_map(|d| d.semantic).collect())
            .unwrap_or_default();
        if semantics.is_empty() {
            semantics.push(Semantic::Position);
        }
        let prog = self
            .screen
            .create_program(translate::passthrough_program(&semantics));
        self.swtnl_vp = Some(Rc::clone(&prog));
        prog
    }
}
