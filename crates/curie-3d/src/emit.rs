//! State emission into the command stream
//!
//! Emission is the only step with hardware side effects. Each hw-dirty
//! category's state object is compared by identity against what the channel
//! last saw; only mismatches are replayed. A context switch invalidates the
//! comparison baseline wholesale, and touching the fragment pipe requires
//! the texture cache to be kicked afterwards.

use std::rc::Rc;

use tracing::debug;

use crate::context::{Channel, Context};
use crate::fallback::RenderMode;
use crate::pushbuf::{methods, PushBuffer};
use crate::state::{StateCategory, VALIDATE_ORDER_HW, VALIDATE_ORDER_SWTNL};
use crate::validate::ValidationOutcome;

impl Context {
    /// Append the commands that bring the channel up to date with this
    /// context's validated state. Appends nothing when nothing is dirty.
    pub fn emit(&mut self, channel: &mut Channel, pb: &mut dyn PushBuffer) {
        let order = match self.fallback.mode() {
            RenderMode::Hardware => VALIDATE_ORDER_HW,
            RenderMode::SoftwareTransform => VALIDATE_ORDER_SWTNL,
            // The CPU renders; the channel is left untouched
            RenderMode::SoftwareRasterize => return,
        };

        let switched = channel.current_context != Some(self.id);
        if switched {
            debug!(from = ?channel.current_context, to = self.id, "channel context switch");
            channel.current_context = Some(self.id);
        }

        let mut fragment_touched = false;
        for &cat in order {
            if !switched && !self.hw_dirty.intersects(cat.dirty_bit()) {
                continue;
            }
            let Some(obj) = &self.state_objects[cat as usize] else {
                self.hw_dirty -= cat.dirty_bit();
                continue;
            };

            let already_bound = channel.bound[cat as usize]
                .as_ref()
                .is_some_and(|bound| Rc::ptr_eq(bound, obj));
            if !already_bound {
                obj.replay(pb);
                channel.bound[cat as usize] = Some(Rc::clone(obj));
                if matches!(cat, StateCategory::FragProg | StateCategory::FragTex) {
                    fragment_touched = true;
                }
            }
            self.hw_dirty -= cat.dirty_bit();
        }

        if fragment_touched {
            // Two writes, wait then kick
            pb.begin_method(methods::TEX_CACHE_CTL, 1);
            pb.append_data(2);
            pb.begin_method(methods::TEX_CACHE_CTL, 1);
            pb.append_data(1);
        }
    }

    /// Validate then emit: everything a draw needs short of the draw
    /// commands themselves
    pub fn prepare_draw(
        &mut self,
        channel: &mut Channel,
        pb: &mut dyn PushBuffer,
    ) -> curie_core::Result<ValidationOutcome> {
        let outcome = self.validate()?;
        self.emit(channel, pb);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Screen;
    use crate::ir::{
        DeclFile, Declaration, DstFile, DstOperand, Instruction, Opcode, Program, Semantic,
        SrcFile, SrcOperand,
    };
    use crate::pushbuf::RecordingPushBuffer;
    use curie_core::DeviceLimits;

    fn simple_vp() -> Program {
        let mut prog = Program::new();
        prog.declarations.push(Declaration {
            file: DeclFile::Input,
            index: 0,
            semantic: Some(Semantic::Position),
        });
        prog.declarations.push(Declaration {
            file: DeclFile::Output,
            index: 0,
            semantic: Some(Semantic::Position),
        });
        prog.instructions.push(Instruction::new(
            Opcode::Mov,
            DstOperand::new(DstFile::Output, 0),
            vec![SrcOperand::new(SrcFile::Input, 0)],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));
        prog
    }

    fn ready_context(screen: &Rc<Screen>) -> Context {
        let mut ctx = Context::new(Rc::clone(screen));
        ctx.bind_vertex_program(screen.create_program(simple_vp()));
        ctx.bind_fragment_program(screen.create_program(simple_vp()));
        ctx
    }

    #[test]
    fn test_second_identical_draw_emits_nothing() {
        let screen = Screen::new(DeviceLimits::curie());
        let mut ctx = ready_context(&screen);
        let mut channel = Channel::new();
        let mut pb = RecordingPushBuffer::new();

        ctx.prepare_draw(&mut channel, &mut pb).unwrap();
        assert!(!pb.is_empty());

        pb.clear();
        ctx.prepare_draw(&mut channel, &mut pb).unwrap();
        assert!(pb.is_empty());
    }

    #[test]
    fn test_value_change_emits_only_that_category() {
        let screen = Screen::new(DeviceLimits::curie());
        let mut ctx = ready_context(&screen);
        let mut channel = Channel::new();
        let mut pb = RecordingPushBuffer::new();
        ctx.prepare_draw(&mut channel, &mut pb).unwrap();

        let mut blend = ctx.pipe.blend;
        blend.enable = true;
        ctx.set_blend(blend);

        pb.clear();
        ctx.prepare_draw(&mut channel, &mut pb).unwrap();
        // Blend category alone: five method/data pairs
        assert_eq!(pb.len(), 10);
        assert_eq!(pb.words[0] & 0x1FFF, methods::SET_BLEND_ENABLE);
        assert_eq!(pb.words[1], 1);
    }

    #[test]
    fn test_context_switch_forces_reemission() {
        let screen = Screen::new(DeviceLimits::curie());
        let mut a = ready_context(&screen);
        let mut b = ready_context(&screen);
        let mut channel = Channel::new();
        let mut pb = RecordingPushBuffer::new();

        a.prepare_draw(&mut channel, &mut pb).unwrap();
        pb.clear();
        b.prepare_draw(&mut channel, &mut pb).unwrap();
        // Different objects, everything replayed
        assert!(!pb.is_empty());

        // Back to the first context with no changes: its objects are no
        // longer what the channel holds, so they go out again
        pb.clear();
        a.prepare_draw(&mut channel, &mut pb).unwrap();
        assert!(!pb.is_empty());
    }

    #[test]
    fn test_fragment_reemission_kicks_texture_cache() {
        let screen = Screen::new(DeviceLimits::curie());
        let mut ctx = ready_context(&screen);
        let mut channel = Channel::new();
        let mut pb = RecordingPushBuffer::new();
        ctx.prepare_draw(&mut channel, &mut pb).unwrap();

        ctx.set_sampler(
            0,
            crate::state::SamplerState {
                enabled: true,
                offset: 0x1000,
                format: 0x2,
                control: 0,
                filter: 0,
            },
        );
        pb.clear();
        ctx.prepare_draw(&mut channel, &mut pb).unwrap();

        let n = pb.len();
        assert!(n >= 4);
        assert_eq!(pb.words[n - 4] & 0x1FFF, methods::TEX_CACHE_CTL);
        assert_eq!(pb.words[n - 3], 2);
        assert_eq!(pb.words[n - 2] & 0x1FFF, methods::TEX_CACHE_CTL);
        assert_eq!(pb.words[n - 1], 1);
    }

    #[test]
    fn test_blend_only_change_leaves_texture_cache_alone() {
        let screen = Screen::new(DeviceLimits::curie());
        let mut ctx = ready_context(&screen);
        let mut channel = Channel::new();
        let mut pb = RecordingPushBuffer::new();
        ctx.prepare_draw(&mut channel, &mut pb).unwrap();

        let mut blend = ctx.pipe.blend;
        blend.enable = true;
        ctx.set_blend(blend);
        pb.clear();
        ctx.prepare_draw(&mut channel, &mut pb).unwrap();
        assert!(!pb
            .words
            .iter()
            .any(|w| w & 0x1FFF == methods::TEX_CACHE_CTL));
    }
}
