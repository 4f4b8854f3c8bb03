//! Structured error types for the sampling core
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! The variants map one-to-one onto the failure taxonomy the rest of the
//! crate relies on: the two startup-fatal kinds, the per-call recoverable
//! kinds, and the per-core hot-plug failures that never spread beyond their
//! core.

use super::types::{CpuId, Flavor};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IbsError>;

#[derive(Error, Debug)]
pub enum IbsError {
    /// Fatal at startup: the running processor cannot do instruction
    /// sampling at all. The module refuses to load.
    #[error("unsupported hardware: {0}")]
    UnsupportedHardware(String),

    /// Fatal at startup: a per-core buffer or device table could not be
    /// allocated. Everything allocated so far is unwound.
    #[error("failed to allocate {0}")]
    AllocationFailed(&'static str),

    /// The device is already held by another consumer. Retry later.
    #[error("device busy")]
    Busy,

    /// The requested sampling parameter needs a capability this processor
    /// does not report. No configuration change was made.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    /// Out-of-range or wrong-flavor sampling parameter. No configuration
    /// change was made.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Non-blocking drain found the buffer empty. No data lost.
    #[error("no sample data available")]
    WouldBlock,

    /// A blocked drain was cancelled by an interrupt signal directed at the
    /// waiting consumer. No data lost.
    #[error("read interrupted")]
    Interrupted,

    /// No externally visible device for this (core, flavor) pair; the core
    /// is offline or the flavor unsupported.
    #[error("no sampling device for {cpu} ({flavor})")]
    NoSuchDevice { cpu: CpuId, flavor: Flavor },

    /// A core hot-plug transition failed; its partial state was rolled
    /// back. Only this core is affected.
    #[error("hot-plug transition failed on {cpu}: {reason}")]
    HotplugFailed { cpu: CpuId, reason: String },

    /// A hardware register access failed in the backend.
    #[error("hardware access failed: {0}")]
    Hw(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_error_display() {
        assert_eq!(IbsError::Busy.to_string(), "device busy");
    }

    #[test]
    fn no_such_device_names_cpu_and_flavor() {
        let err = IbsError::NoSuchDevice { cpu: CpuId(2), flavor: Flavor::Fetch };
        assert!(err.to_string().contains("cpu2"));
        assert!(err.to_string().contains("fetch"));
    }
}
