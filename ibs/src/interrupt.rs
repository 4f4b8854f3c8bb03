//! # Interrupt Capture Path
//!
//! The handoff from restricted interrupt context to a schedulable
//! completion. [`handle_sampling_nmi`] is the restricted half: it decides
//! whether one of this core's devices produced the event (unclaimed
//! interrupts fall through to whoever is next in line), snapshots the
//! sample registers into the device's staging slot, clears the pending
//! indicator, and schedules a deferred completion. It never blocks, never
//! allocates, and never takes a lock a blocking path could hold.
//!
//! [`BottomHalf`] is the schedulable half: a worker fed over a bounded
//! channel that moves staged samples into ring buffers and wakes waiting
//! consumers. The restricted side only ever `try_send`s.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use log::warn;

use ibs_common::{
    FetchRecord, OpRecord, ERR718_STUCK_BITS, IBS_FETCH_VAL, IBS_LVT_OFFSET_MASK,
    IBS_LVT_OFFSET_VAL, IBS_OP_VAL, MSR_IBS_BR_TARGET, MSR_IBS_CONTROL, MSR_IBS_DC_LIN_AD,
    MSR_IBS_DC_PHYS_AD, MSR_IBS_FETCH_CTL, MSR_IBS_FETCH_CTL_EXTD, MSR_IBS_FETCH_LIN_AD,
    MSR_IBS_FETCH_PHYS_AD, MSR_IBS_OP_CTL, MSR_IBS_OP_DATA, MSR_IBS_OP_DATA2, MSR_IBS_OP_DATA3,
    MSR_IBS_OP_DATA4, MSR_IBS_OP_RIP,
};

use crate::device::{IbsDevice, RawSample};
use crate::domain::CpuId;
use crate::hw::HwBackend;

/// Whether the interrupt was ours. Unclaimed events take the normal
/// interrupt fallback path in the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmiDisposition {
    Claimed,
    Unclaimed,
}

/// The deferred-completion worker. One per module, shared by every device;
/// per-device serialization comes from the work-pending token, which
/// guarantees at most one queued completion per device.
pub struct BottomHalf {
    tx: Option<Sender<Arc<IbsDevice>>>,
    thread: Option<JoinHandle<()>>,
}

impl BottomHalf {
    /// `capacity` must cover one token per device; the pending-token gate
    /// then keeps the channel from ever filling.
    #[must_use]
    pub fn start(capacity: usize) -> Self {
        let (tx, rx) = bounded::<Arc<IbsDevice>>(capacity.max(1));
        let thread = thread::spawn(move || {
            while let Ok(dev) = rx.recv() {
                dev.complete_deferred();
            }
        });
        Self { tx: Some(tx), thread: Some(thread) }
    }

    /// Restricted-context safe: non-blocking enqueue of a completion.
    pub fn schedule(&self, dev: &Arc<IbsDevice>) {
        if let Some(tx) = &self.tx {
            if tx.try_send(Arc::clone(dev)).is_err() {
                // Shutting down (or a sizing bug); release the token so a
                // later interrupt can reschedule instead of wedging.
                dev.abandon_pending();
            }
        }
    }

    /// Stop accepting work and join the worker. Mirror of `start`.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BottomHalf {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Restricted-context interrupt handler for one core's pair of devices.
///
/// Checks the op device first, then fetch; both may claim the same NMI if
/// both have pending samples.
pub fn handle_sampling_nmi(
    hw: &dyn HwBackend,
    cpu: CpuId,
    op_dev: &Arc<IbsDevice>,
    fetch_dev: &Arc<IbsDevice>,
    bottom_half: &BottomHalf,
) -> NmiDisposition {
    let mut claimed = false;

    if capture_op(hw, cpu, op_dev, bottom_half) {
        claimed = true;
    }
    if capture_fetch(hw, cpu, fetch_dev, bottom_half) {
        claimed = true;
    }

    if claimed {
        NmiDisposition::Claimed
    } else {
        NmiDisposition::Unclaimed
    }
}

fn capture_op(hw: &dyn HwBackend, cpu: CpuId, dev: &Arc<IbsDevice>, bh: &BottomHalf) -> bool {
    let Ok(ctl) = hw.rdmsr(cpu, MSR_IBS_OP_CTL) else { return false };
    if ctl & IBS_OP_VAL == 0 {
        return false;
    }

    let support = dev.support();
    let rd = |msr| hw.rdmsr(cpu, msr).unwrap_or(0);
    let mut record = OpRecord {
        op_ctl: ctl,
        op_rip: rd(MSR_IBS_OP_RIP),
        op_data: rd(MSR_IBS_OP_DATA),
        op_data2: rd(MSR_IBS_OP_DATA2),
        op_data3: rd(MSR_IBS_OP_DATA3),
        op_data4: if support.caps.op_data4 { rd(MSR_IBS_OP_DATA4) } else { 0 },
        dc_lin_ad: rd(MSR_IBS_DC_LIN_AD),
        dc_phys_ad: rd(MSR_IBS_DC_PHYS_AD),
        br_target: if support.caps.branch_target { rd(MSR_IBS_BR_TARGET) } else { 0 },
        tsc: hw.timestamp(),
    };
    if support.workarounds.fam15h_err_718 {
        // Erratum 718: these bits latch on and carry stale state.
        record.op_data3 &= !ERR718_STUCK_BITS;
    }

    clear_pending(hw, cpu, dev, MSR_IBS_OP_CTL, ctl, IBS_OP_VAL);

    if dev.stage_sample(RawSample::Op(record)) {
        bh.schedule(dev);
    }
    true
}

fn capture_fetch(hw: &dyn HwBackend, cpu: CpuId, dev: &Arc<IbsDevice>, bh: &BottomHalf) -> bool {
    let Ok(ctl) = hw.rdmsr(cpu, MSR_IBS_FETCH_CTL) else { return false };
    if ctl & IBS_FETCH_VAL == 0 {
        return false;
    }

    let support = dev.support();
    let rd = |msr| hw.rdmsr(cpu, msr).unwrap_or(0);
    let record = FetchRecord {
        fetch_ctl: ctl,
        fetch_lin_ad: rd(MSR_IBS_FETCH_LIN_AD),
        fetch_phys_ad: rd(MSR_IBS_FETCH_PHYS_AD),
        fetch_ctl_extd: if support.caps.fetch_ctl_extd { rd(MSR_IBS_FETCH_CTL_EXTD) } else { 0 },
        tsc: hw.timestamp(),
    };

    clear_pending(hw, cpu, dev, MSR_IBS_FETCH_CTL, ctl, IBS_FETCH_VAL);

    if dev.stage_sample(RawSample::Fetch(record)) {
        bh.schedule(dev);
    }
    true
}

/// Drop the valid bit, keeping the enable state so sampling re-arms.
/// A bit that refuses to clear is the Family 10h erratum; noted, never
/// escalated.
fn clear_pending(
    hw: &dyn HwBackend,
    cpu: CpuId,
    dev: &IbsDevice,
    msr: u32,
    ctl: u64,
    valid_bit: u64,
) {
    if hw.wrmsr(cpu, msr, ctl & !valid_bit).is_err() {
        dev.note_stuck_indicator();
        return;
    }
    match hw.rdmsr(cpu, msr) {
        Ok(after) if after & valid_bit != 0 => dev.note_stuck_indicator(),
        _ => {}
    }
}

/// Arm the core's sampling interrupt vector from the offset advertised in
/// the IBS control MSR. Failure is logged and tolerated, matching the
/// hardware reality that some cores simply come up without a valid offset.
pub fn arm_vector(hw: &dyn HwBackend, cpu: CpuId) {
    let control = match hw.rdmsr(cpu, MSR_IBS_CONTROL) {
        Ok(v) => v,
        Err(e) => {
            warn!("sampling vector setup failed on {cpu}: {e}");
            return;
        }
    };
    if control & IBS_LVT_OFFSET_VAL == 0 {
        warn!("sampling vector setup failed on {cpu}: no valid LVT offset");
        return;
    }
    #[allow(clippy::cast_possible_truncation)]
    let offset = (control & IBS_LVT_OFFSET_MASK) as u8;
    if let Err(e) = hw.arm_sampling_vector(cpu, offset) {
        warn!("sampling vector setup failed on {cpu}: {e}");
    }
}
