//! # ibs - Per-Core Instruction Sampling Subsystem
//!
//! A userspace rendition of an AMD Instruction-Based Sampling driver: it
//! arms a core's sampling facility, captures asynchronously delivered
//! hardware samples, stages them in per-core ring buffers, and hands them
//! to waiting consumers while cores come and go underneath it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Sampling Hardware (per core)              │
//! │        FETCH_CTL / OP_CTL MSRs, pending-sample registers     │
//! └─────────────────────────┬────────────────────────────────────┘
//!                           │ NMI per sample
//!                           ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  interrupt (restricted context)                              │
//! │  claim check → register snapshot → staging slot → schedule   │
//! └─────────────────────────┬────────────────────────────────────┘
//!                           │ bounded channel, try_send only
//!                           ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  BottomHalf (deferred completion)                            │
//! │  staged sample → ring buffer → wake read/poll waiters        │
//! └─────────────────────────┬────────────────────────────────────┘
//!                           │ drain / poll
//!                           ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  One consumer per device (open → read/poll/control → close)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`capability`]: one-shot processor probe; produces the immutable
//!   capability and workaround sets everything else reads
//! - [`workarounds`]: per-core apply/revert of revision-specific fixes,
//!   including the continuous enable re-assert for Family 17h Model 01h
//! - [`device`]: per-(core, flavor) state block — ring buffer, locks,
//!   read wait queue, single-opener flag, staging slot
//! - [`interrupt`]: restricted-context NMI handler plus the deferred
//!   completion worker
//! - [`hotplug`]: core add/remove lifecycle driving node creation, vector
//!   arming and forced disable
//! - [`module`]: one-time load/unload orchestration and the consumer-facing
//!   [`DeviceHandle`](module::DeviceHandle)
//! - [`registry`]: device class, stable node naming, minor numbering
//! - [`hw`]: the single hardware-access trait and the simulated machine
//! - [`domain`]: core types ([`CpuId`](domain::CpuId),
//!   [`Flavor`](domain::Flavor)) and the error taxonomy
//!
//! ## Key Concepts
//!
//! - **Flavor**: fetch sampling and op sampling are independent devices
//!   per core, with different fixed record layouts (`ibs-common`)
//! - **Restricted context**: the interrupt half never blocks, allocates,
//!   or waits on a lock a blocking path could hold
//! - **Deferred completion**: at most one in flight per device; a second
//!   interrupt before completion overwrites the staging slot (or, if it
//!   collides with the completion's take, is counted and discarded)
//! - **Drop-oldest**: a full ring evicts its oldest records and counts
//!   them rather than stalling the capture path

pub mod capability;
pub mod cli;
pub mod device;
pub mod domain;
pub mod hotplug;
pub mod hw;
pub mod interrupt;
pub mod module;
pub mod registry;
pub mod workarounds;

pub use capability::{probe, CapabilitySet, IbsSupport, WorkaroundSet};
pub use device::{CancelFlag, ControlOp, Drained, IbsDevice, OpCountMode, SamplingConfig};
pub use domain::{CpuId, Flavor, IbsError, Result};
pub use hotplug::CpuAction;
pub use hw::{CpuVendor, HwBackend, SimulatedMachine};
pub use interrupt::NmiDisposition;
pub use module::{DeviceHandle, IbsModule, ReadCanceller};
