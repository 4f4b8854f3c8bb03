//! Domain model for the sampling core
//!
//! Core domain types and errors:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

pub use errors::{IbsError, Result};
pub use types::{CpuId, Flavor};
