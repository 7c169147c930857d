//! Error types for the curie driver core
//!
//! Translation and allocation failures are expected conditions: they
//! propagate up to the fallback controller, which downgrades the render
//! mode instead of surfacing them to the caller. Only the loss of every
//! rendering path is a hard error.

use thiserror::Error;

/// Top-level error type for driver operations
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Shader translation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslationError {
    #[error("Unsupported opcode: {0}")]
    UnsupportedOpcode(&'static str),

    #[error("Out of temporary registers (limit {limit})")]
    OutOfTemporaries { limit: u32 },

    #[error("Out of constant slots (limit {limit})")]
    OutOfConstantSlots { limit: u32 },

    #[error("Too many shader outputs: {count} (limit {limit})")]
    TooManyOutputs { count: u32, limit: u32 },

    #[error("Bad semantic index {index} for {semantic}")]
    BadSemanticIndex { semantic: &'static str, index: u32 },
}

/// Hardware resource heap errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Out of heap space: requested {requested} slots, capacity {capacity}")]
    OutOfSpace { requested: u32, capacity: u32 },
}

/// State validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Hardware-incompatible state: {0}")]
    HardwareIncompatible(&'static str),

    #[error("No rendering path remains for the current state")]
    NoRenderPath,
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;
