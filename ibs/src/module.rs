//! # Module Orchestrator
//!
//! One-time system-wide setup and its exact mirror teardown. Load order:
//! probe → per-core device allocation (both flavors, every possible core)
//! → device class and numbering → vector arming on online cores → visible
//! nodes for online cores → interrupt handler registration (the bottom-half
//! worker). Any failure unwinds everything done so far, in reverse.
//!
//! Device storage is allocated for every *possible* core and freed only at
//! teardown; a core can be removed and re-added many times in between, and
//! only its visible node follows that cycle.

use std::sync::Arc;

use log::info;

use crate::capability::{probe, IbsSupport};
use crate::device::{CancelFlag, ControlOp, Drained, IbsDevice, SamplingConfig};
use crate::domain::{CpuId, Flavor, IbsError, Result};
use crate::hw::HwBackend;
use crate::interrupt::{self, BottomHalf, NmiDisposition};
use crate::registry::{DeviceClass, NodeRegistry};
use crate::workarounds::WorkaroundEngine;

/// Upper bound on cores the per-core device table supports.
pub const MAX_CPUS: usize = 1024;

pub(crate) struct CoreDevices {
    pub op: Arc<IbsDevice>,
    pub fetch: Arc<IbsDevice>,
}

/// The loaded sampling subsystem. Dropping it (or calling [`unload`]) runs
/// the mirror-image teardown.
///
/// [`unload`]: IbsModule::unload
pub struct IbsModule {
    hw: Arc<dyn HwBackend>,
    support: IbsSupport,
    pub(crate) devices: Vec<CoreDevices>,
    pub(crate) registry: Arc<dyn NodeRegistry>,
    pub(crate) workarounds: WorkaroundEngine,
    bottom_half: Option<BottomHalf>,
}

impl IbsModule {
    /// Load against the given machine with the default `ibs` device class.
    ///
    /// # Errors
    ///
    /// [`IbsError::UnsupportedHardware`] when the probe refuses the
    /// processor, [`IbsError::AllocationFailed`] when per-core storage
    /// cannot be allocated; both leave nothing behind.
    pub fn load(hw: Arc<dyn HwBackend>) -> Result<Self> {
        Self::load_with_registry(hw, Arc::new(DeviceClass::new("ibs")))
    }

    /// Load with a caller-supplied node registry.
    pub fn load_with_registry(
        hw: Arc<dyn HwBackend>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Result<Self> {
        let support = probe(hw.as_ref())?;
        info!("initializing sampling module");

        let possible = hw.possible_cpus();
        if possible == 0 || possible > MAX_CPUS {
            return Err(IbsError::UnsupportedHardware(format!(
                "{possible} cores outside the supported range (1..={MAX_CPUS})"
            )));
        }

        // Storage for every possible core, both flavors. `?` unwinds the
        // devices built so far.
        let mut devices = Vec::with_capacity(possible);
        for cpu in 0..possible {
            #[allow(clippy::cast_possible_truncation)]
            let cpu = CpuId(cpu as u32);
            let op =
                Arc::new(IbsDevice::new(cpu, Flavor::Op, support, Arc::clone(&hw))?);
            let fetch =
                Arc::new(IbsDevice::new(cpu, Flavor::Fetch, support, Arc::clone(&hw))?);
            devices.push(CoreDevices { op, fetch });
        }

        let workarounds = WorkaroundEngine::new(Arc::clone(&hw));
        let online = hw.online_cpus();

        for &cpu in &online {
            interrupt::arm_vector(hw.as_ref(), cpu);
        }

        // Visible nodes for every online core; roll back to nothing on
        // failure.
        let mut created: Vec<(Flavor, CpuId)> = Vec::new();
        for &cpu in &online {
            for flavor in supported_flavors(&support) {
                if let Err(e) = registry.create(flavor, cpu) {
                    for &(f, c) in &created {
                        registry.destroy(f, c);
                    }
                    return Err(e);
                }
                created.push((flavor, cpu));
            }
        }

        if support.workarounds.fam17h_m01h {
            for &cpu in &online {
                workarounds.apply(cpu);
            }
        }

        // Interrupt handler registration, last: from here on NMIs can land.
        let bottom_half = BottomHalf::start(possible * 2);

        info!("sampling module ready on {} online cores", online.len());
        Ok(Self {
            hw,
            support,
            devices,
            registry,
            workarounds,
            bottom_half: Some(bottom_half),
        })
    }

    #[must_use]
    pub fn support(&self) -> &IbsSupport {
        &self.support
    }

    pub(crate) fn hw(&self) -> &dyn HwBackend {
        self.hw.as_ref()
    }

    #[must_use]
    pub fn possible_cpus(&self) -> usize {
        self.devices.len()
    }

    pub(crate) fn core(&self, cpu: CpuId) -> Result<&CoreDevices> {
        self.devices.get(cpu.index()).ok_or(IbsError::HotplugFailed {
            cpu,
            reason: format!("core beyond supported range ({})", self.devices.len()),
        })
    }

    /// The registered interrupt entry point. Called (conceptually) from
    /// NMI context on `cpu`; restricted-context rules apply throughout.
    pub fn handle_nmi(&self, cpu: CpuId) -> NmiDisposition {
        let (Some(core), Some(bh)) = (self.devices.get(cpu.index()), self.bottom_half.as_ref())
        else {
            return NmiDisposition::Unclaimed;
        };
        interrupt::handle_sampling_nmi(self.hw.as_ref(), cpu, &core.op, &core.fetch, bh)
    }

    /// Open the visible device for (core, flavor): the single-consumer
    /// entry the command-surface layer sits on.
    ///
    /// # Errors
    ///
    /// [`IbsError::NoSuchDevice`] if the node does not exist (core offline
    /// or flavor unsupported), [`IbsError::Busy`] if already held.
    pub fn open(&self, cpu: CpuId, flavor: Flavor) -> Result<DeviceHandle> {
        if !self.registry.exists(flavor, cpu) {
            return Err(IbsError::NoSuchDevice { cpu, flavor });
        }
        let core = self.core(cpu)?;
        let dev = match flavor {
            Flavor::Op => &core.op,
            Flavor::Fetch => &core.fetch,
        };
        dev.acquire()?;
        Ok(DeviceHandle { dev: Arc::clone(dev), cancel: CancelFlag::new() })
    }

    /// Explicit teardown; identical to dropping the module.
    pub fn unload(self) {
        drop(self);
    }
}

impl Drop for IbsModule {
    fn drop(&mut self) {
        // Mirror of load: interrupt handler first, so no new completions
        // get scheduled while the rest comes apart.
        if let Some(mut bh) = self.bottom_half.take() {
            bh.shutdown();
        }
        for (i, _core) in self.devices.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let cpu = CpuId(i as u32);
            for flavor in supported_flavors(&self.support) {
                self.registry.destroy(flavor, cpu);
            }
        }
        self.workarounds.shutdown();
        // Device storage and ring buffers free when `devices` drops.
        info!("sampling module unloaded");
    }
}

pub(crate) fn supported_flavors(support: &IbsSupport) -> impl Iterator<Item = Flavor> + '_ {
    [Flavor::Op, Flavor::Fetch].into_iter().filter(move |f| match f {
        Flavor::Op => support.caps.op_sampling,
        Flavor::Fetch => support.caps.fetch_sampling,
    })
}

/// An opened sampling device. Exactly one exists per device at a time;
/// dropping it stops sampling and releases the device.
pub struct DeviceHandle {
    dev: Arc<IbsDevice>,
    cancel: CancelFlag,
}

impl DeviceHandle {
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.dev.cpu
    }

    #[must_use]
    pub fn flavor(&self) -> Flavor {
        self.dev.flavor
    }

    /// Drain buffered records; see [`IbsDevice::drain`]. An interrupt
    /// signal cancels one read; the next call may block again.
    pub fn read(&self, max_bytes: usize, blocking: bool) -> Result<Drained> {
        let result = self.dev.drain(max_bytes, blocking, &self.cancel);
        if matches!(result, Err(IbsError::Interrupted)) {
            self.cancel.clear();
        }
        result
    }

    /// Readiness without blocking.
    #[must_use]
    pub fn poll(&self) -> bool {
        self.dev.poll_ready()
    }

    /// Issue a control operation; see [`IbsDevice::configure`].
    pub fn control(&self, op: ControlOp) -> Result<()> {
        self.dev.configure(op)
    }

    #[must_use]
    pub fn config(&self) -> SamplingConfig {
        self.dev.current_config()
    }

    /// Token for interrupting a blocked [`read`] from another thread.
    ///
    /// [`read`]: DeviceHandle::read
    #[must_use]
    pub fn canceller(&self) -> ReadCanceller {
        ReadCanceller { cancel: self.cancel.clone(), dev: Arc::clone(&self.dev) }
    }

    #[must_use]
    pub fn dropped_records(&self) -> u64 {
        self.dev.dropped_records()
    }

    #[must_use]
    pub fn coalesced_samples(&self) -> u64 {
        self.dev.coalesced_samples()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        // Closing stops sampling; release is the one path back to
        // availability.
        self.dev.disable_on_core_down();
        self.dev.release();
    }
}

/// Interrupts a blocked read, failing it with `Interrupted`.
pub struct ReadCanceller {
    cancel: CancelFlag,
    dev: Arc<IbsDevice>,
}

impl ReadCanceller {
    pub fn interrupt(&self) {
        self.cancel.set();
        self.dev.wake_readers();
    }
}
