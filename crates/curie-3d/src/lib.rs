//! Driver core for Curie-class fixed-function-era GPUs
//!
//! Covers the path from decoded shader IR to command-stream emission:
//! translation to the native ISA, program-store and constant-register
//! allocation with eviction, address patching, cached state objects with
//! dirty-bit validation, and the software fallback ladder.

pub mod context;
pub mod emit;
pub mod fallback;
pub mod heap;
pub mod ir;
pub mod isa;
pub mod program;
pub mod pushbuf;
pub mod regs;
pub mod state;
pub mod stateobj;
pub mod translate;
pub mod validate;

pub use context::{Channel, Context, Screen};
pub use fallback::RenderMode;
pub use program::ShaderProgram;
pub use validate::ValidationOutcome;
