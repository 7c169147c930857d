//! Decoded shader IR
//!
//! The portable intermediate representation handed to the translator: an
//! ordered list of typed declarations followed by an ordered list of
//! instructions. Decoding the wire format is the state tracker's job; this
//! module only models the decoded form.

use bitflags::bitflags;

bitflags! {
    /// Destination component write mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteMask: u8 {
        const X = 0x1;
        const Y = 0x2;
        const Z = 0x4;
        const W = 0x8;
    }
}

impl WriteMask {
    pub const ALL: WriteMask = WriteMask::all();
}

/// One lane of a source swizzle
///
/// Zero and One are IR-level extended lanes; the hardware only understands
/// pure XYZW permutations and the translator materializes the rest.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    X = 0,
    Y = 1,
    Z = 2,
    W = 3,
    Zero = 4,
    One = 5,
}

impl Lane {
    /// True for lanes the hardware can select directly
    pub fn is_component(self) -> bool {
        matches!(self, Lane::X | Lane::Y | Lane::Z | Lane::W)
    }
}

/// Per-source 4-lane component selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Swizzle(pub [Lane; 4]);

impl Swizzle {
    pub const IDENTITY: Swizzle = Swizzle([Lane::X, Lane::Y, Lane::Z, Lane::W]);

    /// True when every lane is a plain component (no Zero/One)
    pub fn is_native(&self) -> bool {
        self.0.iter().all(|l| l.is_component())
    }

    pub fn lane(&self, i: usize) -> Lane {
        self.0[i]
    }

    /// Compose: apply `self` on top of `inner`
    pub fn compose(&self, inner: &Swizzle) -> Swizzle {
        let mut out = [Lane::X; 4];
        for (i, l) in self.0.iter().enumerate() {
            out[i] = match l {
                Lane::X => inner.0[0],
                Lane::Y => inner.0[1],
                Lane::Z => inner.0[2],
                Lane::W => inner.0[3],
                other => *other,
            };
        }
        Swizzle(out)
    }
}

impl Default for Swizzle {
    fn default() -> Self {
        Swizzle::IDENTITY
    }
}

/// Register files a source operand may name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrcFile {
    Temp,
    Input,
    Const,
    Immediate,
}

/// Register files a destination operand may name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstFile {
    Temp,
    Output,
    /// Discard: the instruction runs (e.g. for condition-code update) but
    /// writes no register
    Null,
}

/// Files a declaration may introduce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclFile {
    Input,
    Output,
    Temp,
    Const,
    Sampler,
}

/// Semantic name attached to Input/Output declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantic {
    Position,
    Color(u32),
    BackColor(u32),
    Fog,
    PointSize,
    Generic(u32),
}

/// One IR declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Declaration {
    pub file: DeclFile,
    /// Register index within the file
    pub index: u32,
    /// Present for Input/Output files only
    pub semantic: Option<Semantic>,
}

/// Source operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcOperand {
    pub file: SrcFile,
    pub index: u32,
    pub swizzle: Swizzle,
    pub negate: bool,
    pub abs: bool,
}

impl SrcOperand {
    pub fn new(file: SrcFile, index: u32) -> Self {
        Self {
            file,
            index,
            swizzle: Swizzle::IDENTITY,
            negate: false,
            abs: false,
        }
    }

    pub fn swizzled(mut self, swizzle: Swizzle) -> Self {
        self.swizzle = swizzle;
        self
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }
}

/// Destination operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DstOperand {
    pub file: DstFile,
    pub index: u32,
    pub write_mask: WriteMask,
}

impl DstOperand {
    pub fn new(file: DstFile, index: u32) -> Self {
        Self {
            file,
            index,
            write_mask: WriteMask::ALL,
        }
    }

    pub fn masked(mut self, mask: WriteMask) -> Self {
        self.write_mask = mask;
        self
    }

    pub fn null() -> Self {
        Self::new(DstFile::Null, 0)
    }
}

/// IR opcodes (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop,
    Mov,
    Add,
    Sub,
    Mul,
    Mad,
    Abs,
    Min,
    Max,
    Dp3,
    Dp4,
    Frc,
    Flr,
    Slt,
    Sge,
    Sle,
    Sgt,
    Seq,
    Sne,
    Rcp,
    Rsq,
    Lg2,
    Ex2,
    Sin,
    Cos,
    Pow,
    Lrp,
    Cmp,
    Xpd,
    /// Unsigned integer division (integer path)
    UDiv,
    If,
    Else,
    EndIf,
    End,
    // Present in the wire format but with no hardware expansion here
    Kil,
    Tex,
    Bgnsub,
    Endsub,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Mov => "MOV",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Mad => "MAD",
            Opcode::Abs => "ABS",
            Opcode::Min => "MIN",
            Opcode::Max => "MAX",
            Opcode::Dp3 => "DP3",
            Opcode::Dp4 => "DP4",
            Opcode::Frc => "FRC",
            Opcode::Flr => "FLR",
            Opcode::Slt => "SLT",
            Opcode::Sge => "SGE",
            Opcode::Sle => "SLE",
            Opcode::Sgt => "SGT",
            Opcode::Seq => "SEQ",
            Opcode::Sne => "SNE",
            Opcode::Rcp => "RCP",
            Opcode::Rsq => "RSQ",
            Opcode::Lg2 => "LG2",
            Opcode::Ex2 => "EX2",
            Opcode::Sin => "SIN",
            Opcode::Cos => "COS",
            Opcode::Pow => "POW",
            Opcode::Lrp => "LRP",
            Opcode::Cmp => "CMP",
            Opcode::Xpd => "XPD",
            Opcode::UDiv => "UDIV",
            Opcode::If => "IF",
            Opcode::Else => "ELSE",
            Opcode::EndIf => "ENDIF",
            Opcode::End => "END",
            Opcode::Kil => "KIL",
            Opcode::Tex => "TEX",
            Opcode::Bgnsub => "BGNSUB",
            Opcode::Endsub => "ENDSUB",
        }
    }
}

/// One IR instruction
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub dst: DstOperand,
    pub srcs: Vec<SrcOperand>,
    pub saturate: bool,
    /// Branch target for If/Else: IR instruction index of the matching
    /// Else/EndIf, filled in by the decoder
    pub label: Option<u32>,
}

impl Instruction {
    pub fn new(opcode: Opcode, dst: DstOperand, srcs: Vec<SrcOperand>) -> Self {
        Self {
            opcode,
            dst,
            srcs,
            saturate: false,
            label: None,
        }
    }

    pub fn saturated(mut self) -> Self {
        self.saturate = true;
        self
    }
}

/// A decoded IR program
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub declarations: Vec<Declaration>,
    /// Immediate constants, indexed by the Immediate file
    pub immediates: Vec<[f32; 4]>,
    pub instructions: Vec<Instruction>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest declared index for `file`, if any is declared
    pub fn high_index(&self, file: DeclFile) -> Option<u32> {
        self.declarations
            .iter()
            .filter(|d| d.file == file)
            .map(|d| d.index)
            .max()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Declaration> {
        self.declarations
            .iter()
            .filter(|d| d.file == DeclFile::Output)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Declaration> {
        self.declarations
            .iter()
            .filter(|d| d.file == DeclFile::Input)
    }
}
