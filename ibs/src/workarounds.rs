//! # Workaround Engine
//!
//! Per-core application and reversal of the hardware-revision fixes the
//! prober decided on. Two of the three known defects are passive flags the
//! capture path consults; only the Family 17h Model 01h fix needs an active
//! engine, because those parts forget their IBS enable unless somebody
//! keeps re-asserting it.
//!
//! `apply` and `revert` are idempotent per core. Failure to apply is
//! reported and tolerated: the core may then sample inaccurately, which is
//! an accepted limitation, not a crash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use ibs_common::{FAM17H_CPUID_IBS_EN, MSR_CPUID_EXT_FEATURES};

use crate::domain::CpuId;
use crate::hw::HwBackend;

/// How often the enable bits are re-asserted. Low frequency on purpose;
/// the bits only drop across power-management events.
const REASSERT_PERIOD: Duration = Duration::from_millis(50);

struct ReassertTask {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Drives the Family 17h Model 01h continuous enable fix.
///
/// The periodic corrective action is not pinned to the core it repairs; it
/// issues targeted per-core register writes through the backend from
/// wherever it happens to run.
pub struct WorkaroundEngine {
    hw: Arc<dyn HwBackend>,
    tasks: Mutex<HashMap<CpuId, ReassertTask>>,
}

impl WorkaroundEngine {
    #[must_use]
    pub fn new(hw: Arc<dyn HwBackend>) -> Self {
        Self { hw, tasks: Mutex::new(HashMap::new()) }
    }

    /// Start the continuous enable fix for one core. Idempotent; a core
    /// that already has its task keeps it. Apply failures are logged, not
    /// returned: module load must survive them.
    pub fn apply(&self, cpu: CpuId) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(&cpu) {
            return;
        }

        if let Err(e) = reassert_enable(self.hw.as_ref(), cpu) {
            warn!("could not apply enable workaround on {cpu}: {e}; sampling may be inaccurate");
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let hw = Arc::clone(&self.hw);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if let Err(e) = reassert_enable(hw.as_ref(), cpu) {
                        warn!("enable workaround write failed on {cpu}: {e}");
                    }
                    thread::sleep(REASSERT_PERIOD);
                }
            })
        };

        debug!("continuous enable workaround engaged on {cpu}");
        tasks.insert(cpu, ReassertTask { stop, thread });
    }

    /// Cancel the continuous fix for one core and clear the forced enable.
    /// Idempotent; reverting a core without a task is a no-op.
    pub fn revert(&self, cpu: CpuId) {
        let task = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).remove(&cpu);
        let Some(task) = task else { return };

        task.stop.store(true, Ordering::SeqCst);
        let _ = task.thread.join();

        match self.hw.rdmsr(cpu, MSR_CPUID_EXT_FEATURES) {
            Ok(v) => {
                if let Err(e) = self.hw.wrmsr(cpu, MSR_CPUID_EXT_FEATURES, v & !FAM17H_CPUID_IBS_EN)
                {
                    warn!("could not clear forced enable on {cpu}: {e}");
                }
            }
            Err(e) => warn!("could not read enable register on {cpu}: {e}"),
        }
        debug!("continuous enable workaround disengaged on {cpu}");
    }

    /// Whether a core currently has its re-assert task running.
    #[must_use]
    pub fn active(&self, cpu: CpuId) -> bool {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&cpu)
    }

    /// Revert every core. Run at module teardown.
    pub fn shutdown(&self) {
        let cpus: Vec<CpuId> =
            self.tasks.lock().unwrap_or_else(PoisonError::into_inner).keys().copied().collect();
        for cpu in cpus {
            self.revert(cpu);
        }
    }
}

impl Drop for WorkaroundEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reassert_enable(hw: &dyn HwBackend, cpu: CpuId) -> crate::domain::Result<()> {
    let v = hw.rdmsr(cpu, MSR_CPUID_EXT_FEATURES)?;
    hw.wrmsr(cpu, MSR_CPUID_EXT_FEATURES, v | FAM17H_CPUID_IBS_EN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::SimulatedMachine;

    #[test]
    fn apply_sets_enable_bit_and_revert_clears_it() {
        let sim = Arc::new(SimulatedMachine::new(2));
        let engine = WorkaroundEngine::new(sim.clone());

        engine.apply(CpuId(1));
        assert!(engine.active(CpuId(1)));
        assert_ne!(sim.msr(CpuId(1), MSR_CPUID_EXT_FEATURES) & FAM17H_CPUID_IBS_EN, 0);

        engine.revert(CpuId(1));
        assert!(!engine.active(CpuId(1)));
        assert_eq!(sim.msr(CpuId(1), MSR_CPUID_EXT_FEATURES) & FAM17H_CPUID_IBS_EN, 0);
    }

    #[test]
    fn apply_and_revert_are_idempotent() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let engine = WorkaroundEngine::new(sim);

        engine.apply(CpuId(0));
        engine.apply(CpuId(0));
        assert!(engine.active(CpuId(0)));

        engine.revert(CpuId(0));
        engine.revert(CpuId(0));
        assert!(!engine.active(CpuId(0)));
    }

    #[test]
    fn shutdown_reverts_all_cores() {
        let sim = Arc::new(SimulatedMachine::new(3));
        let engine = WorkaroundEngine::new(sim.clone());
        for c in 0..3 {
            engine.apply(CpuId(c));
        }
        engine.shutdown();
        for c in 0..3 {
            assert!(!engine.active(CpuId(c)));
            assert_eq!(sim.msr(CpuId(c), MSR_CPUID_EXT_FEATURES) & FAM17H_CPUID_IBS_EN, 0);
        }
    }
}
