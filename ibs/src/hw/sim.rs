//! # Simulated Machine
//!
//! Software model of the sampling hardware: per-core MSR files, CPUID
//! answers derived from a configurable family/model/capability description,
//! and helpers that stage a pending sample the way the real silicon would
//! (write the sample registers, raise the valid bit).
//!
//! The model also reproduces the one piece of misbehavior the core has to
//! live with: [`SimulatedMachine::set_sticky_valid`] makes the pending
//! indicator refuse to clear, which is what the Family 10h erratum does on
//! real parts.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use ibs_common::{
    CPUID_EXT_FEATURES, CPUID_EXT_FEATURES_IBS, CPUID_IBS_FEATURES, IBS_CAP_BRN_TRGT, IBS_CAP_FFV,
    IBS_CAP_FETCH_CTL_EXTD, IBS_CAP_FETCH_SAM, IBS_CAP_OP_BRN_FUSE, IBS_CAP_OP_CNT,
    IBS_CAP_OP_CNT_EXT, IBS_CAP_OP_DATA4, IBS_CAP_OP_RDWR_CNT, IBS_CAP_OP_SAM,
    IBS_CAP_RIP_INVALID_CHK, IBS_FETCH_VAL, IBS_LVT_OFFSET_VAL, IBS_OP_VAL, MSR_IBS_CONTROL,
    MSR_IBS_DC_LIN_AD, MSR_IBS_DC_PHYS_AD, MSR_IBS_FETCH_CTL, MSR_IBS_FETCH_LIN_AD,
    MSR_IBS_FETCH_PHYS_AD, MSR_IBS_OP_CTL, MSR_IBS_OP_DATA, MSR_IBS_OP_DATA2, MSR_IBS_OP_DATA3,
    MSR_IBS_OP_RIP,
};

use super::{CpuVendor, CpuidRegs, HwBackend};
use crate::domain::{CpuId, IbsError, Result};

/// Every optional capability bit plus fetch/op sampling and the valid flag.
pub const ALL_IBS_CAPS: u32 = IBS_CAP_FFV
    | IBS_CAP_FETCH_SAM
    | IBS_CAP_OP_SAM
    | IBS_CAP_OP_RDWR_CNT
    | IBS_CAP_OP_CNT
    | IBS_CAP_BRN_TRGT
    | IBS_CAP_OP_CNT_EXT
    | IBS_CAP_RIP_INVALID_CHK
    | IBS_CAP_OP_BRN_FUSE
    | IBS_CAP_FETCH_CTL_EXTD
    | IBS_CAP_OP_DATA4;

struct SimCore {
    msrs: Mutex<HashMap<u32, u64>>,
}

impl SimCore {
    fn new() -> Self {
        let mut msrs = HashMap::new();
        // LVT offset 1, advertised valid, so vector arming succeeds.
        msrs.insert(MSR_IBS_CONTROL, IBS_LVT_OFFSET_VAL | 0x1);
        Self { msrs: Mutex::new(msrs) }
    }
}

/// A configurable fake machine backing the test suite and the CLI.
pub struct SimulatedMachine {
    vendor: CpuVendor,
    family: u16,
    model: u8,
    /// IBS capability leaf EAX value.
    ibs_caps: u32,
    /// Whether `CPUID_EXT_FEATURES` advertises IBS at all.
    cpuid_ibs_bit: bool,
    cores: Vec<SimCore>,
    online: Mutex<BTreeSet<u32>>,
    armed: Mutex<BTreeSet<u32>>,
    /// Family 10h Erratum 420 model: writes can't clear the valid bits.
    sticky_valid: AtomicBool,
    tsc: AtomicU64,
}

impl SimulatedMachine {
    /// A machine with `n_cpus` cores, all online, full IBS support.
    #[must_use]
    pub fn new(n_cpus: usize) -> Self {
        Self {
            vendor: CpuVendor::Amd,
            family: 0x19,
            model: 0x01,
            ibs_caps: ALL_IBS_CAPS,
            cpuid_ibs_bit: true,
            cores: (0..n_cpus).map(|_| SimCore::new()).collect(),
            online: Mutex::new((0..n_cpus as u32).collect()),
            armed: Mutex::new(BTreeSet::new()),
            sticky_valid: AtomicBool::new(false),
            tsc: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn with_vendor(mut self, vendor: CpuVendor) -> Self {
        self.vendor = vendor;
        self
    }

    #[must_use]
    pub fn with_family_model(mut self, family: u16, model: u8) -> Self {
        self.family = family;
        self.model = model;
        self
    }

    /// Replace the IBS capability leaf contents.
    #[must_use]
    pub fn with_ibs_caps(mut self, caps: u32) -> Self {
        self.ibs_caps = caps;
        self
    }

    /// Clear the IBS presence bit in the extended-features leaf.
    #[must_use]
    pub fn without_cpuid_ibs(mut self) -> Self {
        self.cpuid_ibs_bit = false;
        self
    }

    /// Model the Family 10h erratum: the pending indicator never clears.
    pub fn set_sticky_valid(&self, sticky: bool) {
        self.sticky_valid.store(sticky, Ordering::SeqCst);
    }

    pub fn set_online(&self, cpu: CpuId, online: bool) {
        let mut set = lock(&self.online);
        if online {
            set.insert(cpu.0);
        } else {
            set.remove(&cpu.0);
        }
    }

    /// Whether the sampling vector was armed on this core.
    #[must_use]
    pub fn vector_armed(&self, cpu: CpuId) -> bool {
        lock(&self.armed).contains(&cpu.0)
    }

    /// Peek at a core's MSR file (0 when never written).
    #[must_use]
    pub fn msr(&self, cpu: CpuId, msr: u32) -> u64 {
        self.cores
            .get(cpu.index())
            .map_or(0, |core| lock(&core.msrs).get(&msr).copied().unwrap_or(0))
    }

    /// Stage a pending op sample on `cpu`: write the sample registers and
    /// raise the valid bit, exactly what silicon does right before the NMI.
    /// The caller still has to deliver the interrupt.
    pub fn inject_op_sample(&self, cpu: CpuId, rip: u64, data3: u64) {
        let Some(core) = self.cores.get(cpu.index()) else { return };
        let mut msrs = lock(&core.msrs);
        msrs.insert(MSR_IBS_OP_RIP, rip);
        msrs.insert(MSR_IBS_OP_DATA, rip ^ 0x1111);
        msrs.insert(MSR_IBS_OP_DATA2, rip ^ 0x2222);
        msrs.insert(MSR_IBS_OP_DATA3, data3);
        msrs.insert(MSR_IBS_DC_LIN_AD, rip.wrapping_add(0x40));
        msrs.insert(MSR_IBS_DC_PHYS_AD, rip.wrapping_add(0x80));
        let ctl = msrs.get(&MSR_IBS_OP_CTL).copied().unwrap_or(0);
        msrs.insert(MSR_IBS_OP_CTL, ctl | IBS_OP_VAL);
    }

    /// Stage a pending fetch sample on `cpu`.
    pub fn inject_fetch_sample(&self, cpu: CpuId, lin_ad: u64) {
        let Some(core) = self.cores.get(cpu.index()) else { return };
        let mut msrs = lock(&core.msrs);
        msrs.insert(MSR_IBS_FETCH_LIN_AD, lin_ad);
        msrs.insert(MSR_IBS_FETCH_PHYS_AD, lin_ad.wrapping_add(0x1000));
        let ctl = msrs.get(&MSR_IBS_FETCH_CTL).copied().unwrap_or(0);
        msrs.insert(MSR_IBS_FETCH_CTL, ctl | IBS_FETCH_VAL);
    }

    fn core(&self, cpu: CpuId) -> Result<&SimCore> {
        self.cores
            .get(cpu.index())
            .ok_or_else(|| IbsError::Hw(format!("{cpu} does not exist")))
    }
}

impl HwBackend for SimulatedMachine {
    fn vendor(&self) -> CpuVendor {
        self.vendor
    }

    fn family(&self) -> u16 {
        self.family
    }

    fn model(&self) -> u8 {
        self.model
    }

    fn cpuid(&self, leaf: u32) -> CpuidRegs {
        match leaf {
            CPUID_EXT_FEATURES => {
                // The fam17h workaround MSR forces the CPUID bit on, the
                // same way the BIOS setting would.
                let forced = self.cores.iter().any(|c| {
                    lock(&c.msrs)
                        .get(&ibs_common::MSR_CPUID_EXT_FEATURES)
                        .is_some_and(|v| v & ibs_common::FAM17H_CPUID_IBS_EN != 0)
                });
                let ecx = if self.cpuid_ibs_bit || forced { CPUID_EXT_FEATURES_IBS } else { 0 };
                CpuidRegs { ecx, ..CpuidRegs::default() }
            }
            CPUID_IBS_FEATURES => CpuidRegs { eax: self.ibs_caps, ..CpuidRegs::default() },
            _ => CpuidRegs::default(),
        }
    }

    fn possible_cpus(&self) -> usize {
        self.cores.len()
    }

    fn online_cpus(&self) -> Vec<CpuId> {
        lock(&self.online).iter().map(|&c| CpuId(c)).collect()
    }

    fn rdmsr(&self, cpu: CpuId, msr: u32) -> Result<u64> {
        Ok(lock(&self.core(cpu)?.msrs).get(&msr).copied().unwrap_or(0))
    }

    fn wrmsr(&self, cpu: CpuId, msr: u32, value: u64) -> Result<()> {
        let core = self.core(cpu)?;
        let mut msrs = lock(&core.msrs);
        let mut value = value;
        if self.sticky_valid.load(Ordering::SeqCst) {
            // Erratum model: the hardware re-asserts the pending bit no
            // matter what the handler writes.
            let old = msrs.get(&msr).copied().unwrap_or(0);
            if msr == MSR_IBS_OP_CTL {
                value |= old & IBS_OP_VAL;
            } else if msr == MSR_IBS_FETCH_CTL {
                value |= old & IBS_FETCH_VAL;
            }
        }
        msrs.insert(msr, value);
        Ok(())
    }

    fn arm_sampling_vector(&self, cpu: CpuId, _offset: u8) -> Result<()> {
        self.core(cpu)?;
        lock(&self.armed).insert(cpu.0);
        Ok(())
    }

    fn timestamp(&self) -> u64 {
        self.tsc.fetch_add(1, Ordering::Relaxed)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
