//! # Hardware Access Layer
//!
//! One trait stands between the sampling core and the machine: CPUID
//! queries, per-core MSR access, topology enumeration and interrupt-vector
//! arming all go through [`HwBackend`]. The capability prober resolves the
//! host's answers exactly once at startup; nothing else in the crate
//! branches on processor revision directly.
//!
//! [`sim::SimulatedMachine`] is the backend used by the CLI and the test
//! suite: a full software model of the register file, including sample
//! injection and the sticky-indicator erratum.

pub mod sim;

pub use sim::SimulatedMachine;

use crate::domain::{CpuId, Result};

/// Processor vendor, as reported by CPUID leaf 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuVendor {
    Amd,
    Other,
}

/// Raw CPUID output registers.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuidRegs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Access to the machine the sampling core runs on.
///
/// Implementations must be callable from any thread; MSR operations target
/// the named core regardless of where the caller runs.
pub trait HwBackend: Send + Sync {
    fn vendor(&self) -> CpuVendor;

    /// Processor family (already display-model adjusted).
    fn family(&self) -> u16;

    /// Processor model within the family.
    fn model(&self) -> u8;

    /// Execute CPUID for the given leaf.
    fn cpuid(&self, leaf: u32) -> CpuidRegs;

    /// Number of cores that can ever exist on this machine, online or not.
    fn possible_cpus(&self) -> usize;

    /// Cores currently online, ascending.
    fn online_cpus(&self) -> Vec<CpuId>;

    /// Read an MSR on the given core.
    fn rdmsr(&self, cpu: CpuId, msr: u32) -> Result<u64>;

    /// Write an MSR on the given core.
    fn wrmsr(&self, cpu: CpuId, msr: u32, value: u64) -> Result<()>;

    /// Point the core's sampling interrupt at the NMI vector using the
    /// offset advertised in the IBS control MSR.
    fn arm_sampling_vector(&self, cpu: CpuId, offset: u8) -> Result<()>;

    /// Current timestamp counter value, used to stamp captured records.
    fn timestamp(&self) -> u64;
}
