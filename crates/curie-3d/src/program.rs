//! Compiled shader programs and address patching
//!
//! A [`ShaderProgram`] owns its decoded IR and, once translated, the encoded
//! instruction groups plus the constant table. Instruction words bake
//! absolute constant-register and branch addresses, so whenever the
//! program's heap ranges move (first allocation, or reallocation after
//! eviction) the relocation lists are replayed against the new bases before
//! upload.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::heap::{HeapRange, ProgramId};
use crate::ir;
use crate::isa::{self, HwInstruction};

static NEXT_PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

fn next_program_id() -> ProgramId {
    NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where a constant slot's value comes from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstSource {
    /// Baked immediate (uploaded once per allocation)
    Value([f32; 4]),
    /// Index into the context's external constant buffer (re-uploaded when
    /// the buffer value changes)
    External(u32),
}

/// One constant-table entry
#[derive(Debug, Clone, PartialEq)]
pub struct ConstEntry {
    pub source: ConstSource,
    /// Last value uploaded to the hardware slot
    pub value: [f32; 4],
}

/// A pending address fixup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    /// Instruction index the fixup applies to
    pub location: u32,
    /// Constant-table slot (const relocs) or instruction index (branch relocs)
    pub target: u32,
}

/// Translator output: encoded instructions plus relocation bookkeeping
#[derive(Debug, Clone, Default)]
pub struct TranslatedProgram {
    pub insns: Vec<HwInstruction>,
    /// Encoded 4-word groups in program-store order
    pub groups: Vec<[u32; 4]>,
    /// Group index of each instruction
    pub group_index: Vec<u32>,
    /// Extension-group index of each instruction, when present
    pub ext_index: Vec<Option<u32>>,
    pub consts: Vec<ConstEntry>,
    pub const_relocs: Vec<Reloc>,
    pub branch_relocs: Vec<Reloc>,
    /// Input slots referenced, as a bitmask
    pub input_mask: u32,
    /// Output slots written, as a bitmask
    pub output_mask: u32,
}

impl TranslatedProgram {
    /// Instruction-store footprint in slots (one per 4-word group)
    pub fn slot_len(&self) -> u32 {
        self.groups.len() as u32
    }

    /// The encoded image as raw bytes, for winsys buffer writes
    pub fn image_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.groups)
    }

    /// Append an instruction, encoding it into word groups
    pub fn push(&mut self, insn: HwInstruction) -> u32 {
        let idx = self.insns.len() as u32;
        let (w, ext) = insn.encode();
        self.group_index.push(self.groups.len() as u32);
        self.groups.push(w);
        self.ext_index.push(ext.map(|e| {
            let gi = self.groups.len() as u32;
            self.groups.push(e);
            gi
        }));
        self.insns.push(insn);
        idx
    }

    /// Write each constant's current value into its extension group.
    ///
    /// The fragment pipe has no constant register file: constants ride
    /// inline in the program image, so the extension group carries the
    /// four value words instead of a register-file slot. Returns true when
    /// any word changed (the resident image is stale and must be placed
    /// and uploaded afresh).
    pub fn bake_const_values(&mut self) -> bool {
        let mut changed = false;
        for reloc in &self.const_relocs {
            let Some(ext) = self.ext_index[reloc.location as usize] else {
                continue;
            };
            let value = self.consts[reloc.target as usize].value;
            let words = value.map(f32::to_bits);
            if self.groups[ext as usize] != words {
                self.groups[ext as usize] = words;
                changed = true;
            }
        }
        changed
    }

    /// Rebase constant references: a pure rewrite of the extension words as
    /// `const_base + table_slot`
    pub fn patch_const_addresses(&mut self, const_base: u32) {
        for reloc in &self.const_relocs {
            // Relocations are only recorded for const-bearing instructions
            debug_assert!(self.ext_index[reloc.location as usize].is_some());
            if let Some(ext) = self.ext_index[reloc.location as usize] {
                self.groups[ext as usize][0] = const_base + reloc.target;
            }
        }
    }

    /// Rebase branch targets against the instruction-slot base
    pub fn patch_branch_addresses(&mut self, exec_base: u32) {
        for reloc in &self.branch_relocs {
            let group = self.group_index[reloc.location as usize] as usize;
            let target_slot = exec_base + self.group_index[reloc.target as usize];
            isa::set_branch_target(&mut self.groups[group], target_slot);
        }
    }
}

/// A shader object as the context sees it
#[derive(Debug)]
pub struct ShaderProgram {
    pub id: ProgramId,
    pub ir: ir::Program,
    /// Set once translation succeeded and the compiled image is current.
    /// Cleared by eviction and by IR changes (clip-plane augmentation).
    pub translated: bool,
    pub compiled: Option<TranslatedProgram>,
    /// Instruction-store range, once allocated
    pub exec: Option<HeapRange>,
    /// Constant-register range, once allocated
    pub data: Option<HeapRange>,
    /// Base the instruction words were last patched against
    pub exec_base: Option<u32>,
    /// Base the constant references were last patched against
    pub const_base: Option<u32>,
    /// Clip-plane mask the program was compiled with
    pub clip_planes: u8,
}

impl ShaderProgram {
    pub fn new(ir: ir::Program) -> Self {
        Self {
            id: next_program_id(),
            ir,
            translated: false,
            compiled: None,
            exec: None,
            data: None,
            exec_base: None,
            const_base: None,
            clip_planes: 0,
        }
    }

    /// Record a successful translation
    pub fn set_compiled(&mut self, compiled: TranslatedProgram, clip_planes: u8) {
        self.compiled = Some(compiled);
        self.translated = true;
        self.clip_planes = clip_planes;
        self.exec_base = None;
        self.const_base = None;
    }

    /// Called when another program's allocation reclaimed our ranges:
    /// forget the ranges and the patched bases, and require a fresh
    /// translate-allocate-patch cycle on next use.
    pub fn on_evicted(&mut self) {
        self.exec = None;
        self.data = None;
        self.exec_base = None;
        self.const_base = None;
        self.translated = false;
    }

    /// Clip-plane state changed in a way that alters the generated code
    pub fn set_clip_planes(&mut self, mask: u8) {
        if self.clip_planes != mask && self.translated {
            tracing::debug!(id = self.id, mask, "clip plane change forces retranslation");
            self.translated = false;
        }
        self.clip_planes = mask;
    }

    /// Apply address patching for the current ranges. Returns true when any
    /// word changed (the image must be re-uploaded).
    pub fn patch_addresses(&mut self) -> bool {
        let compiled = match &mut self.compiled {
            Some(c) => c,
            None => return false,
        };
        let mut changed = false;

        if let Some(exec) = self.exec {
            if self.exec_base != Some(exec.start) {
                compiled.patch_branch_addresses(exec.start);
                self.exec_base = Some(exec.start);
                changed = true;
            }
        }
        if let Some(data) = self.data {
            if self.const_base != Some(data.start) {
                compiled.patch_const_addresses(data.start);
                self.const_base = Some(data.start);
                changed = true;
            }
        }
        changed
    }
}
