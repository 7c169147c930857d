//! IR to hardware instruction translation
//!
//! Single forward walk over the decoded IR. Each source instruction expands
//! to one or more hardware instructions: at most one non-temporary file is
//! readable per hardware instruction, so conflicting externals are staged
//! through scratch temporaries first, and swizzles using the extended
//! Zero/One lanes are materialized with helper MOVs. Opcodes the execution
//! units lack are lowered to short fixed sequences.
//!
//! Translation is pure: it touches no hardware state and either yields a
//! complete [`TranslatedProgram`] or an error with nothing committed.

use tracing::trace;

use curie_core::{DeviceLimits, TranslationError};

use crate::ir::{self, DeclFile, DstFile, Lane, Opcode, Semantic, SrcFile};
use crate::isa::{CondTest, DstBank, ExternalRef, HwDst, HwInstruction, HwOpcode, HwSrc, SrcBank};
use crate::program::{ConstEntry, ConstSource, Reloc, TranslatedProgram};
use crate::regs::{Scratch, TempPool};

/// Hardware output slots
pub const OUT_POSITION: u32 = 0;
pub const OUT_COLOR0: u32 = 1;
pub const OUT_COLOR1: u32 = 2;
pub const OUT_BCOLOR0: u32 = 3;
pub const OUT_BCOLOR1: u32 = 4;
pub const OUT_FOG: u32 = 5;
pub const OUT_PSIZE: u32 = 6;
pub const OUT_TEX0: u32 = 7;

/// Hardware input (attribute) slots
const IN_POSITION: u32 = 0;
const IN_COLOR0: u32 = 3;
const IN_FOG: u32 = 5;
const IN_PSIZE: u32 = 6;
const IN_TEX0: u32 = 8;

const MAX_GENERIC: u32 = 8;
const MAX_OUTPUTS: u32 = OUT_TEX0 + MAX_GENERIC;

/// Helper constant used when materializing Zero/One swizzle lanes
const SWZ_HELPER: [f32; 4] = [0.0, 1.0, 0.0, 0.0];

/// Per-translation options supplied by the validator
#[derive(Debug, Clone, Copy)]
pub struct TranslateOptions {
    /// Active user clip planes; non-zero enables the position redirect
    pub clip_plane_mask: u8,
    /// Plane equations, consulted for the planes set in the mask
    pub clip_planes: [[f32; 4]; 6],
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            clip_plane_mask: 0,
            clip_planes: [[0.0; 4]; 6],
        }
    }
}

/// A source operand mid-resolution: register reference plus the IR-level
/// swizzle still to be applied
#[derive(Debug, Clone, Copy)]
struct Pending {
    bank: SrcBank,
    index: u8,
    ext: Option<ExternalRef>,
    swz: ir::Swizzle,
    negate: bool,
    abs: bool,
}

/// A fully resolved source: hardware operand plus its external requirement
#[derive(Debug, Clone, Copy)]
struct RSrc {
    hw: HwSrc,
    ext: Option<ExternalRef>,
}

impl RSrc {
    fn temp(index: u8) -> Self {
        Self {
            hw: HwSrc::temp(index),
            ext: None,
        }
    }

    fn constant(slot: u32) -> Self {
        Self {
            hw: HwSrc::external(),
            ext: Some(ExternalRef::Const(slot)),
        }
    }
}

/// Re-swizzle a resolved source (composes on top of its swizzle)
fn swz(r: RSrc, sel: [usize; 4]) -> RSrc {
    let mut out = r;
    for i in 0..4 {
        out.hw.swizzle[i] = r.hw.swizzle[sel[i]];
    }
    out
}

fn xxxx(r: RSrc) -> RSrc {
    swz(r, [0, 0, 0, 0])
}

fn neg(mut r: RSrc) -> RSrc {
    r.hw.negate = !r.hw.negate;
    r
}

struct Translator<'a> {
    ir: &'a ir::Program,
    limits: &'a DeviceLimits,
    opts: &'a TranslateOptions,
    out: TranslatedProgram,
    /// IR temp index -> hardware register
    temp_map: Vec<u8>,
    /// IR input index -> attribute slot
    input_slots: Vec<u32>,
    /// IR output index -> output slot
    output_slots: Vec<u32>,
    /// Position writes land here while clip planes are active
    position_temp: Option<u8>,
    /// Constant slots below this index are reserved and excluded from dedup
    reserved_consts: usize,
    /// Hardware instruction count after each IR instruction (branch targets
    /// land just past their labelled instruction)
    ir_after: Vec<u32>,
    /// (hardware BRA index, IR target index) pairs resolved after the walk
    pending_branches: Vec<(u32, u32)>,
    saw_end: bool,
}

/// Translate a decoded program for the hardware described by `limits`
pub fn translate(
    ir: &ir::Program,
    limits: &DeviceLimits,
    opts: &TranslateOptions,
) -> Result<TranslatedProgram, TranslationError> {
    let temps = TempPool::new(limits.max_temps);
    let mut tr = Translator {
        ir,
        limits,
        opts,
        out: TranslatedProgram::default(),
        temp_map: Vec::new(),
        input_slots: Vec::new(),
        output_slots: Vec::new(),
        position_temp: None,
        reserved_consts: 0,
        ir_after: Vec::with_capacity(ir.instructions.len()),
        pending_branches: Vec::new(),
        saw_end: false,
    };

    tr.declare(&temps)?;
    for insn in &ir.instructions {
        let scratch = temps.scope();
        tr.translate_instruction(insn, &scratch)?;
        tr.ir_after.push(tr.out.insns.len() as u32);
    }
    tr.finish()
}

impl Translator<'_> {
    fn declare(&mut self, temps: &TempPool) -> Result<(), TranslationError> {
        let out_count = self.ir.outputs().count() as u32;
        if out_count > MAX_OUTPUTS {
            return Err(TranslationError::TooManyOutputs {
                count: out_count,
                limit: MAX_OUTPUTS,
            });
        }

        if let Some(high) = self.ir.high_index(DeclFile::Temp) {
            for _ in 0..=high {
                self.temp_map.push(temps.pin()?);
            }
        }

        let in_len = self.ir.high_index(DeclFile::Input).map_or(0, |h| h + 1);
        self.input_slots = (0..in_len).collect();
        for decl in self.ir.inputs() {
            if let Some(sem) = decl.semantic {
                self.input_slots[decl.index as usize] = input_slot(sem)?;
            }
        }

        let out_len = self.ir.high_index(DeclFile::Output).map_or(0, |h| h + 1);
        self.output_slots = vec![0; out_len as usize];
        for decl in self.ir.outputs() {
            if let Some(sem) = decl.semantic {
                self.output_slots[decl.index as usize] = output_slot(sem)?;
            }
        }

        if self.opts.clip_plane_mask != 0 {
            // Plane equations occupy the first six slots; position writes
            // are redirected so the distances can be computed at the end
            for plane in self.opts.clip_planes.iter() {
                self.out.consts.push(ConstEntry {
                    source: ConstSource::Value(*plane),
                    value: *plane,
                });
            }
            self.reserved_consts = self.out.consts.len();
            self.position_temp = Some(temps.pin()?);
        }

        trace!(
            temps = self.temp_map.len(),
            outputs = out_count,
            clip_mask = self.opts.clip_plane_mask,
            "translation begins"
        );
        Ok(())
    }

    fn register_value(&mut self, value: [f32; 4]) -> Result<u32, TranslationError> {
        let bits = |v: &[f32; 4]| [v[0].to_bits(), v[1].to_bits(), v[2].to_bits(), v[3].to_bits()];
        for (i, entry) in self.out.consts.iter().enumerate().skip(self.reserved_consts) {
            if let ConstSource::Value(v) = entry.source {
                if bits(&v) == bits(&value) {
                    return Ok(i as u32);
                }
            }
        }
        if self.out.consts.len() as u32 >= self.limits.max_const_slots {
            return Err(TranslationError::OutOfConstantSlots {
                limit: self.limits.max_const_slots,
            });
        }
        self.out.consts.push(ConstEntry {
            source: ConstSource::Value(value),
            value,
        });
        Ok(self.out.consts.len() as u32 - 1)
    }

    fn register_external(&mut self, index: u32) -> Result<u32, TranslationError> {
        for (i, entry) in self.out.consts.iter().enumerate() {
            if entry.source == ConstSource::External(index) {
                return Ok(i as u32);
            }
        }
        if self.out.consts.len() as u32 >= self.limits.max_const_slots {
            return Err(TranslationError::OutOfConstantSlots {
                limit: self.limits.max_const_slots,
            });
        }
        self.out.consts.push(ConstEntry {
            source: ConstSource::External(index),
            value: [0.0; 4],
        });
        Ok(self.out.consts.len() as u32 - 1)
    }

    fn build(&self, op: HwOpcode, dst: HwDst, srcs: &[RSrc]) -> HwInstruction {
        let mut insn = HwInstruction::new(op, dst);
        for (i, s) in srcs.iter().enumerate() {
            insn.srcs[i] = s.hw;
            if s.ext.is_some() {
                debug_assert!(insn.external.is_none() || insn.external == s.ext);
                insn.external = s.ext;
            }
        }
        insn
    }

    fn push(&mut self, insn: HwInstruction) -> u32 {
        if let Some(ExternalRef::Input(slot)) = insn.external {
            self.out.input_mask |= 1 << slot;
        }
        if insn.dst.bank == DstBank::Output {
            self.out.output_mask |= 1 << insn.dst.index;
        }
        let const_slot = match insn.external {
            Some(ExternalRef::Const(slot)) => Some(slot),
            _ => None,
        };
        let idx = self.out.push(insn);
        if let Some(slot) = const_slot {
            self.out.const_relocs.push(Reloc {
                location: idx,
                target: slot,
            });
        }
        idx
    }

    fn emit(&mut self, op: HwOpcode, dst: HwDst, srcs: &[RSrc], saturate: bool) -> u32 {
        let mut insn = self.build(op, dst, srcs);
        insn.saturate = saturate;
        self.push(insn)
    }

    /// Resolve IR sources into hardware operands. Conflicting externals are
    /// staged first, then extended swizzle lanes are materialized; the
    /// conflict pass runs on the original operands, so a conflicting source
    /// that also carries Zero/One lanes costs two MOVs.
    fn resolve(
        &mut self,
        srcs: &[ir::SrcOperand],
        scratch: &Scratch<'_>,
    ) -> Result<Vec<RSrc>, TranslationError> {
        let mut pending = Vec::with_capacity(srcs.len());
        for s in srcs {
            let p = match s.file {
                SrcFile::Temp => Pending {
                    bank: SrcBank::Temp,
                    index: self.temp_map[s.index as usize],
                    ext: None,
                    swz: s.swizzle,
                    negate: s.negate,
                    abs: s.abs,
                },
                SrcFile::Input => Pending {
                    bank: SrcBank::External,
                    index: 0,
                    ext: Some(ExternalRef::Input(self.input_slots[s.index as usize])),
                    swz: s.swizzle,
                    negate: s.negate,
                    abs: s.abs,
                },
                SrcFile::Const => {
                    let slot = self.register_external(s.index)?;
                    Pending {
                        bank: SrcBank::External,
                        index: 0,
                        ext: Some(ExternalRef::Const(slot)),
                        swz: s.swizzle,
                        negate: s.negate,
                        abs: s.abs,
                    }
                }
                SrcFile::Immediate => {
                    let slot = self.register_value(self.ir.immediates[s.index as usize])?;
                    Pending {
                        bank: SrcBank::External,
                        index: 0,
                        ext: Some(ExternalRef::Const(slot)),
                        swz: s.swizzle,
                        negate: s.negate,
                        abs: s.abs,
                    }
                }
            };
            pending.push(p);
        }

        // File-conflict pass: the first external wins, later distinct ones
        // are copied into scratch temps
        let mut primary: Option<ExternalRef> = None;
        for p in pending.iter_mut() {
            let Some(ext) = p.ext else { continue };
            match primary {
                None => primary = Some(ext),
                Some(e) if e == ext => {}
                Some(_) => {
                    let t = scratch.alloc()?;
                    let copy = RSrc {
                        hw: HwSrc::external(),
                        ext: Some(ext),
                    };
                    self.emit(HwOpcode::Mov, HwDst::temp(t, 0xF), &[copy], false);
                    p.bank = SrcBank::Temp;
                    p.index = t;
                    p.ext = None;
                }
            }
        }

        // Swizzle pass: materialize Zero/One lanes
        for p in pending.iter_mut() {
            if !p.swz.is_native() {
                self.canonicalize(p, scratch)?;
            }
        }

        Ok(pending
            .iter()
            .map(|p| {
                let mut hw = HwSrc {
                    bank: p.bank,
                    index: p.index,
                    swizzle: HwSrc::IDENTITY_SWZ,
                    negate: p.negate,
                    abs: p.abs,
                };
                for i in 0..4 {
                    hw.swizzle[i] = p.swz.lane(i) as u8;
                }
                RSrc { hw, ext: p.ext }
            })
            .collect())
    }

    /// Stage a source whose swizzle selects Zero/One lanes into a scratch
    /// temp: one permute MOV for the component lanes, one MOV from the
    /// (0,1,0,0) helper constant for the rest
    fn canonicalize(&mut self, p: &mut Pending, scratch: &Scratch<'_>) -> Result<(), TranslationError> {
        let t = scratch.alloc()?;
        let mut comp_mask = 0u8;
        let mut const_mask = 0u8;
        let mut perm = [0u8; 4];
        let mut csel = [0u8; 4];
        for i in 0..4 {
            match p.swz.lane(i) {
                Lane::Zero => {
                    const_mask |= 1 << i;
                    csel[i] = 0;
                }
                Lane::One => {
                    const_mask |= 1 << i;
                    csel[i] = 1;
                }
                lane => {
                    comp_mask |= 1 << i;
                    perm[i] = lane as u8;
                }
            }
        }

        if comp_mask != 0 {
            let src = RSrc {
                hw: HwSrc {
                    bank: p.bank,
                    index: p.index,
                    swizzle: perm,
                    negate: false,
                    abs: false,
                },
                ext: p.ext,
            };
            self.emit(HwOpcode::Mov, HwDst::temp(t, comp_mask), &[src], false);
        }
        if const_mask != 0 {
            let slot = self.register_value(SWZ_HELPER)?;
            let mut src = RSrc::constant(slot);
            src.hw.swizzle = csel;
            self.emit(HwOpcode::Mov, HwDst::temp(t, const_mask), &[src], false);
        }

        p.bank = SrcBank::Temp;
        p.index = t;
        p.ext = None;
        p.swz = ir::Swizzle::IDENTITY;
        Ok(())
    }

    fn resolve_dst(&self, d: &ir::DstOperand) -> HwDst {
        let mask = d.write_mask.bits();
        match d.file {
            DstFile::Temp => HwDst::temp(self.temp_map[d.index as usize], mask),
            DstFile::Output => {
                let slot = self.output_slots[d.index as usize];
                match self.position_temp {
                    Some(t) if slot == OUT_POSITION => HwDst::temp(t, mask),
                    _ => HwDst::output(slot as u8, mask),
                }
            }
            DstFile::Null => HwDst::none(),
        }
    }

    fn translate_instruction(
        &mut self,
        insn: &ir::Instruction,
        scratch: &Scratch<'_>,
    ) -> Result<(), TranslationError> {
        use Opcode::*;

        // Control flow and pseudo-ops first; the rest resolve sources
        match insn.opcode {
            Nop => return Ok(()),
            End => return self.end_program(),
            EndIf => return Ok(()),
            Else => {
                let target = insn
                    .label
                    .ok_or(TranslationError::UnsupportedOpcode("ELSE"))?;
                let bra = self.build(HwOpcode::Bra, HwDst::none(), &[]);
                let loc = self.push(bra);
                self.pending_branches.push((loc, target));
                return Ok(());
            }
            If => {
                let target = insn
                    .label
                    .ok_or(TranslationError::UnsupportedOpcode("IF"))?;
                let srcs = self.resolve(&insn.srcs, scratch)?;
                let mut cc = self.build(HwOpcode::Mov, HwDst::none(), &srcs[..1]);
                cc.cc_update = true;
                self.push(cc);
                // Skip the body when the condition's x lane is zero
                let mut bra = self.build(HwOpcode::Bra, HwDst::none(), &[]);
                bra.cc_test = CondTest::Eq;
                bra.cc_swizzle = [0; 4];
                let loc = self.push(bra);
                self.pending_branches.push((loc, target));
                return Ok(());
            }
            Kil | Tex | Bgnsub | Endsub => {
                return Err(TranslationError::UnsupportedOpcode(insn.opcode.mnemonic()))
            }
            _ => {}
        }

        let dst = self.resolve_dst(&insn.dst);
        let s = self.resolve(&insn.srcs, scratch)?;
        let sat = insn.saturate;

        match insn.opcode {
            Mov => {
                self.emit(HwOpcode::Mov, dst, &s[..1], sat);
            }
            Abs => {
                let mut a = s[0];
                a.hw.abs = true;
                a.hw.negate = false;
                self.emit(HwOpcode::Mov, dst, &[a], sat);
            }
            Add => {
                self.emit(HwOpcode::Add, dst, &s[..2], sat);
            }
            Sub => {
                self.emit(HwOpcode::Add, dst, &[s[0], neg(s[1])], sat);
            }
            Mul => {
                self.emit(HwOpcode::Mul, dst, &s[..2], sat);
            }
            Mad => {
                self.emit(HwOpcode::Mad, dst, &s[..3], sat);
            }
            Min => {
                self.emit(HwOpcode::Min, dst, &s[..2], sat);
            }
            Max => {
                self.emit(HwOpcode::Max, dst, &s[..2], sat);
            }
            Dp3 => {
                self.emit(HwOpcode::Dp3, dst, &s[..2], sat);
            }
            Dp4 => {
                self.emit(HwOpcode::Dp4, dst, &s[..2], sat);
            }
            Frc => {
                self.emit(HwOpcode::Frc, dst, &s[..1], sat);
            }
            Flr => {
                self.emit(HwOpcode::Flr, dst, &s[..1], sat);
            }
            Slt => {
                self.emit(HwOpcode::Slt, dst, &s[..2], sat);
            }
            Sge => {
                self.emit(HwOpcode::Sge, dst, &s[..2], sat);
            }
            Sle => {
                self.emit(HwOpcode::Sle, dst, &s[..2], sat);
            }
            Sgt => {
                self.emit(HwOpcode::Sgt, dst, &s[..2], sat);
            }
            Seq => {
                self.emit(HwOpcode::Seq, dst, &s[..2], sat);
            }
            Sne => {
                self.emit(HwOpcode::Sne, dst, &s[..2], sat);
            }
            Rcp => {
                self.emit(HwOpcode::Rcp, dst, &s[..1], sat);
            }
            Rsq => {
                self.emit(HwOpcode::Rsq, dst, &s[..1], sat);
            }
            Lg2 => {
                self.emit(HwOpcode::Lg2, dst, &s[..1], sat);
            }
            Ex2 => {
                self.emit(HwOpcode::Ex2, dst, &s[..1], sat);
            }
            Sin => {
                self.emit(HwOpcode::Sin, dst, &s[..1], sat);
            }
            Cos => {
                self.emit(HwOpcode::Cos, dst, &s[..1], sat);
            }
            Pow => {
                // lg2/mul/ex2 chain through the x lane
                let t = scratch.alloc()?;
                self.emit(HwOpcode::Lg2, HwDst::temp(t, 0x1), &[xxxx(s[0])], false);
                self.emit(
                    HwOpcode::Mul,
                    HwDst::temp(t, 0x1),
                    &[xxxx(RSrc::temp(t)), xxxx(s[1])],
                    false,
                );
                self.emit(HwOpcode::Ex2, dst, &[xxxx(RSrc::temp(t))], sat);
            }
            Xpd => {
                let t = scratch.alloc()?;
                self.emit(
                    HwOpcode::Mul,
                    HwDst::temp(t, 0xF),
                    &[swz(s[0], [2, 0, 1, 3]), swz(s[1], [1, 2, 0, 3])],
                    false,
                );
                let mut d = dst;
                d.write_mask &= 0x7;
                self.emit(
                    HwOpcode::Mad,
                    d,
                    &[swz(s[0], [1, 2, 0, 3]), swz(s[1], [2, 0, 1, 3]), neg(RSrc::temp(t))],
                    sat,
                );
            }
            Lrp => {
                // dst = a*b + (1-a)*c as two MADs
                let t = scratch.alloc()?;
                self.emit(
                    HwOpcode::Mad,
                    HwDst::temp(t, 0xF),
                    &[neg(s[0]), s[2], s[2]],
                    false,
                );
                self.emit(HwOpcode::Mad, dst, &[s[0], s[1], RSrc::temp(t)], sat);
            }
            Cmp => {
                // Per-lane select off condition codes
                let mut cc = self.build(HwOpcode::Mov, HwDst::none(), &s[..1]);
                cc.cc_update = true;
                self.push(cc);
                let mut take_b = self.build(HwOpcode::Mov, dst, &[s[1]]);
                take_b.cc_test = CondTest::Lt;
                take_b.saturate = sat;
                self.push(take_b);
                let mut take_c = self.build(HwOpcode::Mov, dst, &[s[2]]);
                take_c.cc_test = CondTest::Ge;
                take_c.saturate = sat;
                self.push(take_c);
            }
            UDiv => {
                self.lower_udiv(dst, s[0], s[1], sat, scratch)?;
            }
            // Handled above
            Nop | End | If | Else | EndIf | Kil | Tex | Bgnsub | Endsub => {}
        }
        Ok(())
    }

    /// Unsigned 32-bit division on the integer pipe: reciprocal estimate,
    /// one Newton-Raphson refinement, then a conditional off-by-one fixup
    fn lower_udiv(
        &mut self,
        dst: HwDst,
        a: RSrc,
        b: RSrc,
        sat: bool,
        scratch: &Scratch<'_>,
    ) -> Result<(), TranslationError> {
        let r = scratch.alloc()?;
        let e = scratch.alloc()?;
        let q = scratch.alloc()?;
        let k = scratch.alloc()?;

        self.emit(HwOpcode::RcpU, HwDst::temp(r, 0xF), &[b], false);
        // refinement: r += hi(r * -lo(r*b))
        self.emit(HwOpcode::MulLo, HwDst::temp(e, 0xF), &[RSrc::temp(r), b], false);
        self.emit(
            HwOpcode::MulHi,
            HwDst::temp(e, 0xF),
            &[RSrc::temp(r), neg(RSrc::temp(e))],
            false,
        );
        self.emit(
            HwOpcode::AddI,
            HwDst::temp(r, 0xF),
            &[RSrc::temp(r), RSrc::temp(e)],
            false,
        );
        // quotient estimate and remainder
        self.emit(HwOpcode::MulHi, HwDst::temp(q, 0xF), &[a, RSrc::temp(r)], false);
        self.emit(
            HwOpcode::MulLo,
            HwDst::temp(e, 0xF),
            &[RSrc::temp(q), b],
            false,
        );
        self.emit(
            HwOpcode::AddI,
            HwDst::temp(e, 0xF),
            &[a, neg(RSrc::temp(e))],
            false,
        );
        // estimate may be one short; bump where remainder >= divisor
        self.emit(HwOpcode::SgeU, HwDst::temp(k, 0xF), &[RSrc::temp(e), b], false);
        let one = self.register_value([f32::from_bits(1); 4])?;
        self.emit(
            HwOpcode::AddI,
            HwDst::temp(e, 0xF),
            &[RSrc::temp(q), RSrc::constant(one)],
            false,
        );
        self.emit(
            HwOpcode::CMov,
            dst,
            &[RSrc::temp(k), RSrc::temp(e), RSrc::temp(q)],
            sat,
        );
        Ok(())
    }

    /// Clip-distance epilogue plus the end marker
    fn end_program(&mut self) -> Result<(), TranslationError> {
        self.saw_end = true;

        if let Some(pos) = self.position_temp {
            for plane in 0..6u32 {
                if self.opts.clip_plane_mask & (1 << plane) == 0 {
                    continue;
                }
                // Planes 0-2 land in fog.yzw, planes 3-5 in psize.yzw
                let slot = if plane < 3 { OUT_FOG } else { OUT_PSIZE };
                let mask = 1u8 << (1 + plane % 3);
                self.emit(
                    HwOpcode::Dp4,
                    HwDst::output(slot as u8, mask),
                    &[RSrc::temp(pos), RSrc::constant(plane)],
                    false,
                );
            }
            self.emit(
                HwOpcode::Mov,
                HwDst::output(OUT_POSITION as u8, 0xF),
                &[RSrc::temp(pos)],
                false,
            );
        }

        if self.out.insns.is_empty() {
            self.emit(HwOpcode::Nop, HwDst::none(), &[], false);
        }
        let last = self.out.insns.len() - 1;
        self.out.insns[last].end = true;
        let group = self.out.group_index[last] as usize;
        self.out.groups[group][0] |= 1 << 2;
        Ok(())
    }

    fn finish(mut self) -> Result<TranslatedProgram, TranslationError> {
        if !self.saw_end {
            self.end_program()?;
        }
        for (loc, ir_target) in std::mem::take(&mut self.pending_branches) {
            let hw_target = self.ir_after[ir_target as usize];
            debug_assert!((hw_target as usize) < self.out.insns.len());
            self.out.insns[loc as usize].branch_label = Some(hw_target);
            self.out.branch_relocs.push(Reloc {
                location: loc,
                target: hw_target,
            });
        }
        trace!(
            insns = self.out.insns.len(),
            slots = self.out.slot_len(),
            consts = self.out.consts.len(),
            "translation done"
        );
        Ok(self.out)
    }
}

fn input_slot(sem: Semantic) -> Result<u32, TranslationError> {
    match sem {
        Semantic::Position => Ok(IN_POSITION),
        Semantic::Color(i) if i < 2 => Ok(IN_COLOR0 + i),
        Semantic::Color(i) => Err(TranslationError::BadSemanticIndex {
            semantic: "COLOR",
            index: i,
        }),
        Semantic::BackColor(i) => Err(TranslationError::BadSemanticIndex {
            semantic: "BCOLOR",
            index: i,
        }),
        Semantic::Fog => Ok(IN_FOG),
        Semantic::PointSize => Ok(IN_PSIZE),
        Semantic::Generic(i) if i < MAX_GENERIC => Ok(IN_TEX0 + i),
        Semantic::Generic(i) => Err(TranslationError::BadSemanticIndex {
            semantic: "GENERIC",
            index: i,
        }),
    }
}

fn output_slot(sem: Semantic) -> Result<u32, TranslationError> {
    match sem {
        Semantic::Position => Ok(OUT_POSITION),
        Semantic::Color(i) if i < 2 => Ok(OUT_COLOR0 + i),
        Semantic::Color(i) => Err(TranslationError::BadSemanticIndex {
            semantic: "COLOR",
            index: i,
        }),
        Semantic::BackColor(i) if i < 2 => Ok(OUT_BCOLOR0 + i),
        Semantic::BackColor(i) => Err(TranslationError::BadSemanticIndex {
            semantic: "BCOLOR",
            index: i,
        }),
        Semantic::Fog => Ok(OUT_FOG),
        Semantic::PointSize => Ok(OUT_PSIZE),
        Semantic::Generic(i) if i < MAX_GENERIC => Ok(OUT_TEX0 + i),
        Semantic::Generic(i) => Err(TranslationError::BadSemanticIndex {
            semantic: "GENERIC",
            index: i,
        }),
    }
}

/// Build the pass-through program used while vertex transform runs in
/// software: each attribute is copied straight to its output slot
pub fn passthrough_program(semantics: &[Semantic]) -> ir::Program {
    let mut prog = ir::Program::new();
    for (i, sem) in semantics.iter().enumerate() {
        prog.declarations.push(ir::Declaration {
            file: DeclFile::Input,
            index: i as u32,
            semantic: Some(*sem),
        });
        prog.declarations.push(ir::Declaration {
            file: DeclFile::Output,
            index: i as u32,
            semantic: Some(*sem),
        });
        prog.instructions.push(ir::Instruction::new(
            Opcode::Mov,
            ir::DstOperand::new(DstFile::Output, i as u32),
            vec![ir::SrcOperand::new(SrcFile::Input, i as u32)],
        ));
    }
    prog.instructions.push(ir::Instruction::new(
        Opcode::End,
        ir::DstOperand::null(),
        vec![],
    ));
    prog
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Declaration, DstOperand, Instruction, Program, SrcOperand, Swizzle, WriteMask,
    };

    fn decl(file: DeclFile, index: u32, semantic: Option<Semantic>) -> Declaration {
        Declaration {
            file,
            index,
            semantic,
        }
    }

    fn limits() -> DeviceLimits {
        DeviceLimits::curie()
    }

    /// MOV out, in plus END: exactly one hardware instruction
    #[test]
    fn test_mov_single_instruction() {
        let mut prog = Program::new();
        prog.declarations
            .push(decl(DeclFile::Input, 0, Some(Semantic::Position)));
        prog.declarations
            .push(decl(DeclFile::Output, 0, Some(Semantic::Position)));
        prog.instructions.push(Instruction::new(
            Opcode::Mov,
            DstOperand::new(DstFile::Output, 0),
            vec![SrcOperand::new(SrcFile::Input, 0)],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        assert_eq!(out.insns.len(), 1);
        assert_eq!(out.slot_len(), 1);
        let insn = &out.insns[0];
        assert_eq!(insn.opcode, HwOpcode::Mov);
        assert!(insn.end);
        assert_eq!(insn.external, Some(ExternalRef::Input(0)));
        assert_eq!(insn.dst, HwDst::output(0, 0xF));
        assert_eq!(out.input_mask, 0x1);
        assert_eq!(out.output_mask, 0x1);
    }

    #[test]
    fn test_sub_becomes_negated_add() {
        let mut prog = Program::new();
        prog.declarations.push(decl(DeclFile::Temp, 0, None));
        prog.declarations.push(decl(DeclFile::Temp, 1, None));
        prog.declarations.push(decl(DeclFile::Temp, 2, None));
        prog.instructions.push(Instruction::new(
            Opcode::Sub,
            DstOperand::new(DstFile::Temp, 0),
            vec![
                SrcOperand::new(SrcFile::Temp, 1),
                SrcOperand::new(SrcFile::Temp, 2),
            ],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        assert_eq!(out.insns.len(), 1);
        assert_eq!(out.insns[0].opcode, HwOpcode::Add);
        assert!(!out.insns[0].srcs[0].negate);
        assert!(out.insns[0].srcs[1].negate);
    }

    #[test]
    fn test_sub_of_two_inputs_stages_the_second() {
        let mut prog = Program::new();
        prog.declarations
            .push(decl(DeclFile::Input, 0, Some(Semantic::Position)));
        prog.declarations
            .push(decl(DeclFile::Input, 1, Some(Semantic::Generic(0))));
        prog.declarations
            .push(decl(DeclFile::Output, 0, Some(Semantic::Position)));
        prog.instructions.push(Instruction::new(
            Opcode::Sub,
            DstOperand::new(DstFile::Output, 0),
            vec![
                SrcOperand::new(SrcFile::Input, 0),
                SrcOperand::new(SrcFile::Input, 1),
            ],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        // Two distinct input registers cannot feed one instruction: the
        // second one is copied plain into a scratch temp and the negate
        // stays on the ADD's read of that temp
        assert_eq!(out.insns.len(), 2);
        assert_eq!(out.insns[0].opcode, HwOpcode::Mov);
        assert_eq!(out.insns[0].external, Some(ExternalRef::Input(IN_TEX0)));
        assert!(!out.insns[0].srcs[0].negate);

        assert_eq!(out.insns[1].opcode, HwOpcode::Add);
        assert_eq!(out.insns[1].external, Some(ExternalRef::Input(IN_POSITION)));
        assert_eq!(out.insns[1].srcs[1].bank, SrcBank::Temp);
        assert!(out.insns[1].srcs[1].negate);
    }

    #[test]
    fn test_conflicting_constants_staged_through_temp() {
        let mut prog = Program::new();
        prog.declarations.push(decl(DeclFile::Temp, 0, None));
        prog.declarations.push(decl(DeclFile::Const, 0, None));
        prog.declarations.push(decl(DeclFile::Const, 1, None));
        prog.instructions.push(Instruction::new(
            Opcode::Add,
            DstOperand::new(DstFile::Temp, 0),
            vec![
                SrcOperand::new(SrcFile::Const, 0),
                SrcOperand::new(SrcFile::Const, 1),
            ],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        // copy MOV then the ADD
        assert_eq!(out.insns.len(), 2);
        assert_eq!(out.insns[0].opcode, HwOpcode::Mov);
        assert_eq!(out.insns[1].opcode, HwOpcode::Add);
        assert_eq!(out.insns[0].external, Some(ExternalRef::Const(1)));
        assert_eq!(out.insns[1].external, Some(ExternalRef::Const(0)));
        assert_eq!(out.insns[1].srcs[1].bank, SrcBank::Temp);
        assert_eq!(out.consts.len(), 2);
        assert_eq!(out.const_relocs.len(), 2);
        // One extension group per const reference
        assert_eq!(out.slot_len(), 4);
    }

    #[test]
    fn test_same_constant_twice_no_conflict() {
        let mut prog = Program::new();
        prog.declarations.push(decl(DeclFile::Temp, 0, None));
        prog.declarations.push(decl(DeclFile::Const, 0, None));
        prog.instructions.push(Instruction::new(
            Opcode::Mul,
            DstOperand::new(DstFile::Temp, 0),
            vec![
                SrcOperand::new(SrcFile::Const, 0),
                SrcOperand::new(SrcFile::Const, 0).negated(),
            ],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        assert_eq!(out.insns.len(), 1);
        assert_eq!(out.consts.len(), 1);
    }

    #[test]
    fn test_zero_one_swizzle_materialized() {
        let mut prog = Program::new();
        prog.declarations.push(decl(DeclFile::Temp, 0, None));
        prog.declarations.push(decl(DeclFile::Temp, 1, None));
        prog.instructions.push(Instruction::new(
            Opcode::Mov,
            DstOperand::new(DstFile::Temp, 0),
            vec![SrcOperand::new(SrcFile::Temp, 1)
                .swizzled(Swizzle([Lane::X, Lane::Y, Lane::Zero, Lane::One]))],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        // permute MOV, helper-constant MOV, then the real MOV
        assert_eq!(out.insns.len(), 3);
        assert_eq!(out.insns[0].dst.write_mask, 0x3);
        assert_eq!(out.insns[1].dst.write_mask, 0xC);
        assert_eq!(out.insns[1].external, Some(ExternalRef::Const(0)));
        // helper selects x (=0) for Zero lanes and y (=1) for One lanes
        assert_eq!(out.insns[1].srcs[0].swizzle[2], 0);
        assert_eq!(out.insns[1].srcs[0].swizzle[3], 1);
        assert_eq!(out.consts.len(), 1);
        assert_eq!(out.consts[0].source, ConstSource::Value([0.0, 1.0, 0.0, 0.0]));
    }

    #[test]
    fn test_pow_chain() {
        let mut prog = Program::new();
        prog.declarations.push(decl(DeclFile::Temp, 0, None));
        prog.declarations.push(decl(DeclFile::Temp, 1, None));
        prog.declarations.push(decl(DeclFile::Temp, 2, None));
        prog.instructions.push(Instruction::new(
            Opcode::Pow,
            DstOperand::new(DstFile::Temp, 0),
            vec![
                SrcOperand::new(SrcFile::Temp, 1),
                SrcOperand::new(SrcFile::Temp, 2),
            ],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        let ops: Vec<_> = out.insns.iter().map(|i| i.opcode).collect();
        assert_eq!(ops, vec![HwOpcode::Lg2, HwOpcode::Mul, HwOpcode::Ex2]);
    }

    #[test]
    fn test_xpd_masks_w() {
        let mut prog = Program::new();
        prog.declarations.push(decl(DeclFile::Temp, 0, None));
        prog.declarations.push(decl(DeclFile::Temp, 1, None));
        prog.declarations.push(decl(DeclFile::Temp, 2, None));
        prog.instructions.push(Instruction::new(
            Opcode::Xpd,
            DstOperand::new(DstFile::Temp, 0),
            vec![
                SrcOperand::new(SrcFile::Temp, 1),
                SrcOperand::new(SrcFile::Temp, 2),
            ],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        assert_eq!(out.insns.len(), 2);
        assert_eq!(out.insns[0].opcode, HwOpcode::Mul);
        assert_eq!(out.insns[1].opcode, HwOpcode::Mad);
        assert_eq!(out.insns[1].dst.write_mask, 0x7);
        assert!(out.insns[1].srcs[2].negate);
    }

    #[test]
    fn test_cmp_condition_tested_moves() {
        let mut prog = Program::new();
        for i in 0..4 {
            prog.declarations.push(decl(DeclFile::Temp, i, None));
        }
        prog.instructions.push(Instruction::new(
            Opcode::Cmp,
            DstOperand::new(DstFile::Temp, 0),
            vec![
                SrcOperand::new(SrcFile::Temp, 1),
                SrcOperand::new(SrcFile::Temp, 2),
                SrcOperand::new(SrcFile::Temp, 3),
            ],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        assert_eq!(out.insns.len(), 3);
        assert!(out.insns[0].cc_update);
        assert_eq!(out.insns[0].dst.write_mask, 0);
        assert_eq!(out.insns[1].cc_test, CondTest::Lt);
        assert_eq!(out.insns[2].cc_test, CondTest::Ge);
    }

    #[test]
    fn test_udiv_lowering() {
        let mut prog = Program::new();
        prog.declarations.push(decl(DeclFile::Temp, 0, None));
        prog.declarations.push(decl(DeclFile::Temp, 1, None));
        prog.declarations.push(decl(DeclFile::Temp, 2, None));
        prog.instructions.push(Instruction::new(
            Opcode::UDiv,
            DstOperand::new(DstFile::Temp, 0),
            vec![
                SrcOperand::new(SrcFile::Temp, 1),
                SrcOperand::new(SrcFile::Temp, 2),
            ],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        assert_eq!(out.insns.len(), 10);
        assert_eq!(out.insns[0].opcode, HwOpcode::RcpU);
        assert_eq!(out.insns[7].opcode, HwOpcode::SgeU);
        assert_eq!(out.insns[9].opcode, HwOpcode::CMov);
        // the +1 constant
        assert_eq!(out.consts.len(), 1);
        assert_eq!(
            out.consts[0].source,
            ConstSource::Value([f32::from_bits(1); 4])
        );
    }

    #[test]
    fn test_if_else_endif_branches() {
        let mut prog = Program::new();
        prog.declarations.push(decl(DeclFile::Temp, 0, None));
        prog.declarations.push(decl(DeclFile::Temp, 1, None));
        // if t1 { t0 = t1 } else { t0 = -t1 }; t0 = t0
        let mut if_insn = Instruction::new(
            Opcode::If,
            DstOperand::null(),
            vec![SrcOperand::new(SrcFile::Temp, 1)],
        );
        if_insn.label = Some(2);
        prog.instructions.push(if_insn); // 0
        prog.instructions.push(Instruction::new(
            Opcode::Mov,
            DstOperand::new(DstFile::Temp, 0),
            vec![SrcOperand::new(SrcFile::Temp, 1)],
        )); // 1
        let mut else_insn = Instruction::new(Opcode::Else, DstOperand::null(), vec![]);
        else_insn.label = Some(4);
        prog.instructions.push(else_insn); // 2
        prog.instructions.push(Instruction::new(
            Opcode::Mov,
            DstOperand::new(DstFile::Temp, 0),
            vec![SrcOperand::new(SrcFile::Temp, 1).negated()],
        )); // 3
        prog.instructions
            .push(Instruction::new(Opcode::EndIf, DstOperand::null(), vec![])); // 4
        prog.instructions.push(Instruction::new(
            Opcode::Mov,
            DstOperand::new(DstFile::Temp, 0),
            vec![SrcOperand::new(SrcFile::Temp, 0)],
        )); // 5
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        // cc MOV, BRA, body MOV, BRA, body MOV, tail MOV
        assert_eq!(out.insns.len(), 6);
        assert_eq!(out.insns[1].opcode, HwOpcode::Bra);
        assert_eq!(out.insns[1].cc_test, CondTest::Eq);
        assert_eq!(out.insns[3].opcode, HwOpcode::Bra);
        assert_eq!(out.insns[3].cc_test, CondTest::True);
        assert_eq!(
            out.branch_relocs,
            vec![
                // if-false lands after the else's BRA
                Reloc {
                    location: 1,
                    target: 4
                },
                // else body exit lands on the tail MOV
                Reloc {
                    location: 3,
                    target: 5
                },
            ]
        );
        assert_eq!(out.insns[1].branch_label, Some(4));
    }

    #[test]
    fn test_clip_plane_redirect() {
        let mut prog = Program::new();
        prog.declarations
            .push(decl(DeclFile::Input, 0, Some(Semantic::Position)));
        prog.declarations
            .push(decl(DeclFile::Output, 0, Some(Semantic::Position)));
        prog.instructions.push(Instruction::new(
            Opcode::Mov,
            DstOperand::new(DstFile::Output, 0),
            vec![SrcOperand::new(SrcFile::Input, 0)],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let mut opts = TranslateOptions::default();
        opts.clip_plane_mask = 0b001001; // planes 0 and 3
        opts.clip_planes[0] = [1.0, 0.0, 0.0, 0.5];
        opts.clip_planes[3] = [0.0, 1.0, 0.0, 0.0];

        let out = translate(&prog, &limits(), &opts).unwrap();
        // body MOV (to temp), two DP4s, final position MOV
        assert_eq!(out.insns.len(), 4);
        assert_eq!(out.insns[0].dst.bank, DstBank::Temp);
        assert_eq!(out.insns[1].opcode, HwOpcode::Dp4);
        assert_eq!(out.insns[1].dst, HwDst::output(OUT_FOG as u8, 0x2));
        assert_eq!(out.insns[1].external, Some(ExternalRef::Const(0)));
        assert_eq!(out.insns[2].dst, HwDst::output(OUT_PSIZE as u8, 0x2));
        assert_eq!(out.insns[2].external, Some(ExternalRef::Const(3)));
        assert_eq!(out.insns[3].dst, HwDst::output(OUT_POSITION as u8, 0xF));
        assert!(out.insns[3].end);
        // first six slots reserved for the plane equations
        assert_eq!(out.consts.len(), 6);
        assert_eq!(out.consts[0].value, [1.0, 0.0, 0.0, 0.5]);
    }

    #[test]
    fn test_immediate_dedup() {
        let mut prog = Program::new();
        prog.declarations.push(decl(DeclFile::Temp, 0, None));
        prog.immediates.push([2.0, 2.0, 2.0, 2.0]);
        prog.immediates.push([2.0, 2.0, 2.0, 2.0]);
        prog.instructions.push(Instruction::new(
            Opcode::Mov,
            DstOperand::new(DstFile::Temp, 0),
            vec![SrcOperand::new(SrcFile::Immediate, 0)],
        ));
        prog.instructions.push(Instruction::new(
            Opcode::Mov,
            DstOperand::new(DstFile::Temp, 0),
            vec![SrcOperand::new(SrcFile::Immediate, 1)],
        ));
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        assert_eq!(out.consts.len(), 1);
    }

    #[test]
    fn test_out_of_temporaries() {
        let mut prog = Program::new();
        for i in 0..4 {
            prog.declarations.push(decl(DeclFile::Temp, i, None));
        }
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let mut lim = limits();
        lim.max_temps = 2;
        let err = translate(&prog, &lim, &TranslateOptions::default()).unwrap_err();
        assert_eq!(err, TranslationError::OutOfTemporaries { limit: 2 });
    }

    #[test]
    fn test_unsupported_opcode() {
        let mut prog = Program::new();
        prog.instructions.push(Instruction::new(
            Opcode::Kil,
            DstOperand::null(),
            vec![],
        ));
        let err = translate(&prog, &limits(), &TranslateOptions::default()).unwrap_err();
        assert_eq!(err, TranslationError::UnsupportedOpcode("KIL"));
    }

    #[test]
    fn test_bad_semantic_index() {
        let mut prog = Program::new();
        prog.declarations
            .push(decl(DeclFile::Output, 0, Some(Semantic::Generic(11))));
        let err = translate(&prog, &limits(), &TranslateOptions::default()).unwrap_err();
        assert_eq!(
            err,
            TranslationError::BadSemanticIndex {
                semantic: "GENERIC",
                index: 11
            }
        );
    }

    #[test]
    fn test_empty_program_gets_end_nop() {
        let prog = Program::new();
        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        assert_eq!(out.insns.len(), 1);
        assert_eq!(out.insns[0].opcode, HwOpcode::Nop);
        assert!(out.insns[0].end);
    }

    #[test]
    fn test_saturate_carried() {
        let mut prog = Program::new();
        prog.declarations.push(decl(DeclFile::Temp, 0, None));
        prog.declarations.push(decl(DeclFile::Temp, 1, None));
        prog.instructions.push(
            Instruction::new(
                Opcode::Mov,
                DstOperand::new(DstFile::Temp, 0).masked(WriteMask::X | WriteMask::Y),
                vec![SrcOperand::new(SrcFile::Temp, 1)],
            )
            .saturated(),
        );
        prog.instructions
            .push(Instruction::new(Opcode::End, DstOperand::null(), vec![]));

        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        assert!(out.insns[0].saturate);
        assert_eq!(out.insns[0].dst.write_mask, 0x3);
    }

    #[test]
    fn test_passthrough_program() {
        let prog = passthrough_program(&[Semantic::Position, Semantic::Color(0)]);
        let out = translate(&prog, &limits(), &TranslateOptions::default()).unwrap();
        assert_eq!(out.insns.len(), 2);
        assert_eq!(out.output_mask, (1 << OUT_POSITION) | (1 << OUT_COLOR0));
    }
}
