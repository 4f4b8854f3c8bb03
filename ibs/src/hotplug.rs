//! # Core Lifecycle Coordinator
//!
//! Reacts to core hot-plug notifications from the platform's event layer.
//! Per-core state machine:
//!
//! ```text
//! Absent --UpPrepare--> Preparing --Online--> Online
//!   ^                       |                    |
//!   |   UpCanceled/Dead     |                DownPrepare
//!   +-----------------------+                    |
//!   ^                                            v
//!   +------------Dead------------------- DownPreparing
//! ```
//!
//! `UpPrepare` creates the visible nodes (op first, then fetch, rolling
//! back op if fetch fails); its errors fail the whole transition. `Online`
//! arms the interrupt vector and engages the continuous workaround.
//! `DownPrepare` force-disables sampling on both flavors even if nobody
//! holds the devices. Teardown actions never propagate errors: teardown
//! must always complete.

use log::info;

use crate::domain::{CpuId, Flavor, IbsError, Result};
use crate::interrupt;
use crate::module::{supported_flavors, IbsModule};

/// Core hot-plug actions delivered by the platform's event layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuAction {
    /// The core is preparing to come online; create its visible nodes.
    UpPrepare,
    /// The core is running; arm its interrupt vector.
    Online,
    /// Preparation was abandoned; destroy the nodes.
    UpCanceled,
    /// The core is gone; destroy the nodes.
    Dead,
    /// The core is about to go away; stop its sampling hardware.
    DownPrepare,
}

impl IbsModule {
    /// Hot-plug notification entry point, one call per (core, action).
    ///
    /// # Errors
    ///
    /// Only `UpPrepare` can fail, with [`IbsError::HotplugFailed`]; its
    /// partial state is rolled back and the rest of the system is
    /// unaffected.
    pub fn cpu_notify(&self, cpu: CpuId, action: CpuAction) -> Result<()> {
        let core = self.core(cpu)?;
        let support = *self.support();

        match action {
            CpuAction::UpPrepare => {
                let mut created: Vec<Flavor> = Vec::new();
                for flavor in supported_flavors(&support) {
                    if let Err(e) = self.registry.create(flavor, cpu) {
                        for &f in &created {
                            self.registry.destroy(f, cpu);
                        }
                        return Err(IbsError::HotplugFailed { cpu, reason: e.to_string() });
                    }
                    created.push(flavor);
                }
            }
            CpuAction::Online => {
                interrupt::arm_vector(self.hw(), cpu);
                if support.workarounds.fam17h_m01h {
                    self.workarounds.apply(cpu);
                }
            }
            CpuAction::UpCanceled | CpuAction::Dead => {
                for flavor in supported_flavors(&support) {
                    self.registry.destroy(flavor, cpu);
                }
            }
            CpuAction::DownPrepare => {
                info!("preparing to take {cpu} down");
                core.op.disable_on_core_down();
                core.fetch.disable_on_core_down();
                if support.workarounds.fam17h_m01h {
                    self.workarounds.revert(cpu);
                }
            }
        }
        Ok(())
    }
}
