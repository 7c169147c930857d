//! Core types for the curie driver backend
//!
//! This crate provides the error taxonomy and device limit configuration
//! shared by every part of the driver core.

pub mod error;
pub mod limits;

pub use error::{AllocationError, DriverError, Result, TranslationError, ValidationError};
pub use limits::DeviceLimits;
