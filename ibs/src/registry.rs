//! # Device Class and Naming
//!
//! The externally visible side of a sampling device: one addressable node
//! per (core, flavor) under a stable name, grouped into a single class so
//! every node shares default access permissions. Node lifetime follows the
//! hot-plug lifecycle, not the underlying device storage: nodes come and go
//! as cores do, the storage lives for the whole module.
//!
//! Node names encode core and flavor (`cpu/<cpu>/ibs/<flavor>`), and so do
//! the minor numbers, so either can be mapped back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use log::debug;

use crate::domain::{CpuId, Flavor, Result};

/// Default node access mode; everyone may open a sampler.
pub const DEFAULT_NODE_MODE: u32 = 0o666;

/// First major number handed out by the process-wide allocator.
const MAJOR_BASE: u32 = 240;

static NEXT_MAJOR: AtomicU32 = AtomicU32::new(MAJOR_BASE);

/// Minor number for a (flavor, core) pair.
#[must_use]
pub fn minor(flavor: Flavor, cpu: CpuId) -> u32 {
    (cpu.0 << 1) | flavor as u32
}

#[must_use]
pub fn minor_cpu(minor: u32) -> CpuId {
    CpuId(minor >> 1)
}

#[must_use]
pub fn minor_flavor(minor: u32) -> Flavor {
    if minor & 1 == 0 {
        Flavor::Op
    } else {
        Flavor::Fetch
    }
}

/// Stable node name for a (flavor, core) pair.
#[must_use]
pub fn node_name(flavor: Flavor, cpu: CpuId) -> String {
    format!("cpu/{}/ibs/{flavor}", cpu.0)
}

/// Creation and destruction of externally visible device nodes.
///
/// The lifecycle coordinator drives this through a trait so transition
/// rollback can be exercised against a failing registry.
pub trait NodeRegistry: Send + Sync {
    /// Create the node for a (flavor, core) pair. Idempotent.
    fn create(&self, flavor: Flavor, cpu: CpuId) -> Result<()>;

    /// Destroy the node. Idempotent; destroying an absent node is a no-op.
    fn destroy(&self, flavor: Flavor, cpu: CpuId);

    /// Whether the node currently exists.
    fn exists(&self, flavor: Flavor, cpu: CpuId) -> bool;
}

/// The real registry: one device class named `ibs`, a major number from
/// the process-wide allocator, and a minor-indexed node table.
pub struct DeviceClass {
    name: &'static str,
    major: u32,
    nodes: Mutex<BTreeMap<u32, String>>,
}

impl DeviceClass {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        let major = NEXT_MAJOR.fetch_add(1, Ordering::Relaxed);
        debug!("device class {name} registered with major {major}");
        Self { name, major, nodes: Mutex::new(BTreeMap::new()) }
    }

    #[must_use]
    pub fn major(&self) -> u32 {
        self.major
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of live nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl NodeRegistry for DeviceClass {
    fn create(&self, flavor: Flavor, cpu: CpuId) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        let m = minor(flavor, cpu);
        if nodes.insert(m, node_name(flavor, cpu)).is_none() {
            debug!("node {} created ({}:{m}, mode {DEFAULT_NODE_MODE:o})",
                node_name(flavor, cpu), self.major);
        }
        Ok(())
    }

    fn destroy(&self, flavor: Flavor, cpu: CpuId) {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        if nodes.remove(&minor(flavor, cpu)).is_some() {
            debug!("node {} destroyed", node_name(flavor, cpu));
        }
    }

    fn exists(&self, flavor: Flavor, cpu: CpuId) -> bool {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&minor(flavor, cpu))
    }
}
