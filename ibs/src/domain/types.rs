//! Core domain types

use ibs_common::{FETCH_RECORD_SIZE, OP_RECORD_SIZE};
use std::fmt;

/// CPU core identifier (0-based)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl CpuId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Sampling flavor. Each core carries one independent device per flavor,
/// with its own buffer and record layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Flavor {
    /// Micro-op sampling
    Op = 0,
    /// Instruction-fetch sampling
    Fetch = 1,
}

impl Flavor {
    /// Fixed size of one captured record for this flavor.
    #[must_use]
    pub fn record_size(self) -> usize {
        match self {
            Flavor::Op => OP_RECORD_SIZE,
            Flavor::Fetch => FETCH_RECORD_SIZE,
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flavor::Op => write!(f, "op"),
            Flavor::Fetch => write!(f, "fetch"),
        }
    }
}
