//! Hardware instruction encoding
//!
//! The fixed-width ISA consumed by the program store: each instruction is
//! one 4x32-bit word group, optionally followed by a second 4-word
//! extension group carrying an absolute constant-slot index. Only one
//! non-temporary register file may be read per instruction; the external
//! file kind and slot live in per-instruction fields, not per source.

/// Words per instruction group
pub const WORDS_PER_GROUP: usize = 4;

/// Hardware opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwOpcode {
    Nop = 0x00,
    Mov = 0x01,
    Mul = 0x02,
    Add = 0x03,
    Mad = 0x04,
    Dp3 = 0x05,
    Dp4 = 0x06,
    Min = 0x08,
    Max = 0x09,
    Slt = 0x0A,
    Sge = 0x0B,
    Sle = 0x0C,
    Sgt = 0x0D,
    Sne = 0x0E,
    Seq = 0x0F,
    Frc = 0x10,
    Flr = 0x11,
    Rcp = 0x1A,
    Rsq = 0x1B,
    Ex2 = 0x1C,
    Lg2 = 0x1D,
    Cos = 0x22,
    Sin = 0x23,
    Bra = 0x28,
    // Integer pipe
    RcpU = 0x30,
    MulLo = 0x31,
    MulHi = 0x32,
    AddI = 0x33,
    SgeU = 0x34,
    CMov = 0x35,
}

impl From<u8> for HwOpcode {
    fn from(v: u8) -> Self {
        match v {
            0x01 => HwOpcode::Mov,
            0x02 => HwOpcode::Mul,
            0x03 => HwOpcode::Add,
            0x04 => HwOpcode::Mad,
            0x05 => HwOpcode::Dp3,
            0x06 => HwOpcode::Dp4,
            0x08 => HwOpcode::Min,
            0x09 => HwOpcode::Max,
            0x0A => HwOpcode::Slt,
            0x0B => HwOpcode::Sge,
            0x0C => HwOpcode::Sle,
            0x0D => HwOpcode::Sgt,
            0x0E => HwOpcode::Sne,
            0x0F => HwOpcode::Seq,
            0x10 => HwOpcode::Frc,
            0x11 => HwOpcode::Flr,
            0x1A => HwOpcode::Rcp,
            0x1B => HwOpcode::Rsq,
            0x1C => HwOpcode::Ex2,
            0x1D => HwOpcode::Lg2,
            0x22 => HwOpcode::Cos,
            0x23 => HwOpcode::Sin,
            0x28 => HwOpcode::Bra,
            0x30 => HwOpcode::RcpU,
            0x31 => HwOpcode::MulLo,
            0x32 => HwOpcode::MulHi,
            0x33 => HwOpcode::AddI,
            0x34 => HwOpcode::SgeU,
            0x35 => HwOpcode::CMov,
            _ => HwOpcode::Nop,
        }
    }
}

/// Condition-test codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondTest {
    False = 0,
    Lt = 1,
    Eq = 2,
    Le = 3,
    Gt = 4,
    Ne = 5,
    Ge = 6,
    True = 7,
}

impl From<u8> for CondTest {
    fn from(v: u8) -> Self {
        match v & 0x7 {
            1 => CondTest::Lt,
            2 => CondTest::Eq,
            3 => CondTest::Le,
            4 => CondTest::Gt,
            5 => CondTest::Ne,
            6 => CondTest::Ge,
            7 => CondTest::True,
            _ => CondTest::False,
        }
    }
}

/// Destination register bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstBank {
    Temp = 0,
    Output = 1,
}

/// Source register bank select
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrcBank {
    Temp = 0,
    /// The instruction's external file (input or constant, per `ExternalRef`)
    External = 1,
}

/// The one non-temporary file an instruction may read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalRef {
    /// Hardware input slot
    Input(u32),
    /// Constant-table slot; rebased to an absolute constant register by the
    /// patch pass
    Const(u32),
}

/// Hardware source operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwSrc {
    pub bank: SrcBank,
    /// Temp bank register index; ignored for External
    pub index: u8,
    /// 4x2-bit component selects
    pub swizzle: [u8; 4],
    pub negate: bool,
    pub abs: bool,
}

impl HwSrc {
    pub const IDENTITY_SWZ: [u8; 4] = [0, 1, 2, 3];

    pub fn temp(index: u8) -> Self {
        Self {
            bank: SrcBank::Temp,
            index,
            swizzle: Self::IDENTITY_SWZ,
            negate: false,
            abs: false,
        }
    }

    pub fn external() -> Self {
        Self {
            bank: SrcBank::External,
            index: 0,
            swizzle: Self::IDENTITY_SWZ,
            negate: false,
            abs: false,
        }
    }

    /// Unused source slot; encodes as temp r0 with identity swizzle
    pub fn none() -> Self {
        Self::temp(0)
    }

    fn descriptor(&self) -> u32 {
        let mut sr = 0u32;
        sr |= (self.bank as u32) & 1; // bit 0
        sr |= ((self.index as u32) & 0x3F) << 1; // bits 1-6
        sr |= ((self.swizzle[0] as u32) & 0x3) << 7; // bits 7-8
        sr |= ((self.swizzle[1] as u32) & 0x3) << 9; // bits 9-10
        sr |= ((self.swizzle[2] as u32) & 0x3) << 11; // bits 11-12
        sr |= ((self.swizzle[3] as u32) & 0x3) << 13; // bits 13-14
        if self.negate {
            sr |= 1 << 15; // bit 15
        }
        sr
    }

    fn from_descriptor(sr: u32, abs: bool) -> Self {
        Self {
            bank: if sr & 1 != 0 {
                SrcBank::External
            } else {
                SrcBank::Temp
            },
            index: ((sr >> 1) & 0x3F) as u8,
            swizzle: [
                ((sr >> 7) & 0x3) as u8,
                ((sr >> 9) & 0x3) as u8,
                ((sr >> 11) & 0x3) as u8,
                ((sr >> 13) & 0x3) as u8,
            ],
            negate: (sr >> 15) & 1 != 0,
            abs,
        }
    }
}

/// Hardware destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwDst {
    pub bank: DstBank,
    pub index: u8,
    /// xyzw component enables; empty mask discards the result (the
    /// instruction still updates condition codes if asked)
    pub write_mask: u8,
}

impl HwDst {
    pub fn temp(index: u8, write_mask: u8) -> Self {
        Self {
            bank: DstBank::Temp,
            index,
            write_mask,
        }
    }

    pub fn output(index: u8, write_mask: u8) -> Self {
        Self {
            bank: DstBank::Output,
            index,
            write_mask,
        }
    }

    /// Discard destination
    pub fn none() -> Self {
        Self::temp(0, 0)
    }
}

/// One hardware instruction in its pre-encoding form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwInstruction {
    pub opcode: HwOpcode,
    pub dst: HwDst,
    pub saturate: bool,
    pub end: bool,
    pub cc_test: CondTest,
    pub cc_swizzle: [u8; 4],
    pub cc_update: bool,
    pub srcs: [HwSrc; 3],
    pub external: Option<ExternalRef>,
    /// Branch label (instruction index within this program); rebased to an
    /// absolute slot by the patch pass
    pub branch_label: Option<u32>,
}

impl HwInstruction {
    pub fn new(opcode: HwOpcode, dst: HwDst) -> Self {
        Self {
            opcode,
            dst,
            saturate: false,
            end: false,
            cc_test: CondTest::True,
            cc_swizzle: HwSrc::IDENTITY_SWZ,
            cc_update: false,
            srcs: [HwSrc::none(); 3],
            external: None,
            branch_label: None,
        }
    }

    /// Number of instruction slots this instruction occupies in the program
    /// store (extension groups consume a slot of their own)
    pub fn slot_len(&self) -> u32 {
        match self.external {
            Some(ExternalRef::Const(_)) => 2,
            _ => 1,
        }
    }

    /// Encode into word groups. Constant references encode the raw
    /// table slot; `program::patch` rebases them before upload.
    pub fn encode(&self) -> ([u32; 4], Option<[u32; 4]>) {
        let mut w = [0u32; 4];

        w[0] |= self.dst.bank as u32; // bit 0
        if self.saturate {
            w[0] |= 1 << 1; // bit 1
        }
        if self.end {
            w[0] |= 1 << 2; // bit 2
        }
        w[0] |= ((self.dst.write_mask as u32) & 0xF) << 3; // bits 3-6
        w[0] |= ((self.cc_test as u32) & 0x7) << 7; // bits 7-9
        for (i, s) in self.cc_swizzle.iter().enumerate() {
            w[0] |= ((*s as u32) & 0x3) << (10 + 2 * i); // bits 10-17
        }
        w[0] |= ((self.dst.index as u32) & 0x3F) << 18; // bits 18-23
        w[0] |= ((self.opcode as u32) & 0x3F) << 24; // bits 24-29
        if self.cc_update {
            w[0] |= 1 << 30; // bit 30
        }

        w[1] |= self.srcs[0].descriptor(); // bits 0-15
        w[1] |= self.srcs[1].descriptor() << 16; // bits 16-31
        w[2] |= self.srcs[2].descriptor(); // bits 0-15

        let mut ext = None;
        match self.external {
            Some(ExternalRef::Input(slot)) => {
                w[3] |= slot & 0x1FF; // bits 0-8
            }
            Some(ExternalRef::Const(slot)) => {
                w[2] |= 1 << 16; // bit 16: external kind = constant
                ext = Some([slot, 0, 0, 0]);
            }
            None => {}
        }

        if let Some(label) = self.branch_label {
            w[2] |= (label & 0x1FF) << 17; // bits 17-25
        }

        for (i, s) in self.srcs.iter().enumerate() {
            if s.abs {
                w[3] |= 1 << (29 + i); // bits 29-31
            }
        }

        (w, ext)
    }

    /// Decode a word group (plus optional extension)
    pub fn decode(w: &[u32; 4], ext: Option<&[u32; 4]>) -> Self {
        let has_const = (w[2] >> 16) & 1 != 0;
        let external = if has_const {
            Some(ExternalRef::Const(ext.map(|e| e[0]).unwrap_or(0)))
        } else {
            let srcs_external = [w[1] & 1, (w[1] >> 16) & 1, w[2] & 1];
            if srcs_external.iter().any(|b| *b != 0) {
                Some(ExternalRef::Input(w[3] & 0x1FF))
            } else {
                None
            }
        };

        let branch = (w[2] >> 17) & 0x1FF;
        let opcode = HwOpcode::from(((w[0] >> 24) & 0x3F) as u8);

        Self {
            opcode,
            dst: HwDst {
                bank: if w[0] & 1 != 0 {
                    DstBank::Output
                } else {
                    DstBank::Temp
                },
                index: ((w[0] >> 18) & 0x3F) as u8,
                write_mask: ((w[0] >> 3) & 0xF) as u8,
            },
            saturate: (w[0] >> 1) & 1 != 0,
            end: (w[0] >> 2) & 1 != 0,
            cc_test: CondTest::from(((w[0] >> 7) & 0x7) as u8),
            cc_swizzle: [
                ((w[0] >> 10) & 0x3) as u8,
                ((w[0] >> 12) & 0x3) as u8,
                ((w[0] >> 14) & 0x3) as u8,
                ((w[0] >> 16) & 0x3) as u8,
            ],
            cc_update: (w[0] >> 30) & 1 != 0,
            srcs: [
                HwSrc::from_descriptor(w[1] & 0xFFFF, (w[3] >> 29) & 1 != 0),
                HwSrc::from_descriptor(w[1] >> 16, (w[3] >> 30) & 1 != 0),
                HwSrc::from_descriptor(w[2] & 0xFFFF, (w[3] >> 31) & 1 != 0),
            ],
            external,
            branch_label: if opcode == HwOpcode::Bra {
                Some(branch)
            } else {
                None
            },
        }
    }

    /// Files read by this instruction other than the temp bank, as a count
    /// of distinct externals (0 or 1 by construction)
    pub fn reads_external(&self) -> bool {
        self.srcs.iter().any(|s| s.bank == SrcBank::External)
    }
}

/// Rewrite the branch-target field in place
pub fn set_branch_target(w: &mut [u32; 4], target: u32) {
    w[2] &= !(0x1FF << 17);
    w[2] |= (target & 0x1FF) << 17;
}

/// Read the branch-target field
pub fn branch_target(w: &[u32; 4]) -> u32 {
    (w[2] >> 17) & 0x1FF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_mov() {
        let mut insn = HwInstruction::new(HwOpcode::Mov, HwDst::output(0, 0xF));
        insn.srcs[0] = HwSrc::external();
        insn.external = Some(ExternalRef::Input(2));

        let (w, ext) = insn.encode();
        assert!(ext.is_none());
        assert_eq!((w[0] >> 24) & 0x3F, HwOpcode::Mov as u32);
        assert_eq!(w[0] & 1, 1); // output bank
        assert_eq!((w[0] >> 3) & 0xF, 0xF); // full write mask
        assert_eq!(w[3] & 0x1FF, 2); // input slot
        assert_eq!(w[1] & 1, 1); // src0 external
    }

    #[test]
    fn test_encode_const_ext_group() {
        let mut insn = HwInstruction::new(HwOpcode::Add, HwDst::temp(1, 0x3));
        insn.srcs[0] = HwSrc::temp(4);
        insn.srcs[1] = HwSrc::external();
        insn.external = Some(ExternalRef::Const(17));

        assert_eq!(insn.slot_len(), 2);
        let (w, ext) = insn.encode();
        assert_eq!((w[2] >> 16) & 1, 1);
        assert_eq!(ext, Some([17, 0, 0, 0]));
    }

    #[test]
    fn test_decode_roundtrip() {
        let mut insn = HwInstruction::new(HwOpcode::Mad, HwDst::temp(5, 0xF));
        insn.srcs[0] = HwSrc {
            bank: SrcBank::Temp,
            index: 2,
            swizzle: [2, 0, 1, 3],
            negate: true,
            abs: false,
        };
        insn.srcs[1] = HwSrc {
            bank: SrcBank::Temp,
            index: 3,
            swizzle: HwSrc::IDENTITY_SWZ,
            negate: false,
            abs: true,
        };
        insn.srcs[2] = HwSrc::external();
        insn.external = Some(ExternalRef::Const(9));
        insn.saturate = true;

        let (w, ext) = insn.encode();
        let back = HwInstruction::decode(&w, ext.as_ref());
        assert_eq!(back, insn);
    }

    #[test]
    fn test_branch_field_patch() {
        let mut insn = HwInstruction::new(HwOpcode::Bra, HwDst::none());
        insn.branch_label = Some(12);
        let (mut w, _) = insn.encode();
        assert_eq!(branch_target(&w), 12);
        set_branch_target(&mut w, 200);
        assert_eq!(branch_target(&w), 200);
        // Other fields untouched
        assert_eq!((w[0] >> 24) & 0x3F, HwOpcode::Bra as u32);
    }
}
