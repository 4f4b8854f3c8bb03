//! # Sampling Device
//!
//! One `IbsDevice` exists per (core, flavor). It owns the fixed-capacity
//! ring buffer samples land in, the read wait queue consumers sleep on, the
//! single-opener flag, and the staging slot the interrupt path fills.
//!
//! ## Concurrency contract
//!
//! Three contexts touch a device: the restricted interrupt handler (never
//! blocks, only `try_lock`s the staging slot and flips atomics), the
//! deferred completion (moves the staged record into the ring under the
//! data lock), and at most one consumer at a time (arbitrated by an atomic
//! compare-and-set on the in-use flag). The control-path lock and the
//! data-path lock are distinct so a configuration update never waits behind
//! a drain; when both are ever needed, control is taken first.
//!
//! ## Buffer policy
//!
//! The ring is allocated once at module load and freed only at teardown.
//! Overflow drops the oldest records and counts them (`dropped`); the
//! capture path coalesces to the newest sample when a second interrupt
//! lands before the previous completion ran (`coalesced`). One narrow
//! exception: a sample that arrives while the completion holds the staging
//! slot mid-take is counted and discarded, since the interrupt side may not
//! wait for the lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use ibs_common::{
    FetchRecord, OpRecord, IBS_FETCH_EN, IBS_OP_CNT_CTL, IBS_OP_EN, IBS_RAND_EN, MSR_IBS_FETCH_CTL,
    MSR_IBS_OP_CTL,
};

use crate::capability::IbsSupport;
use crate::domain::{CpuId, Flavor, IbsError, Result};
use crate::hw::HwBackend;

/// Per-device ring capacity in bytes (rounded down to whole records).
pub const IBS_BUFFER_SIZE: usize = 1 << 20;

/// Granularity of the hardware max-count fields.
const MAX_CNT_UNIT: u64 = 16;
/// Largest max count expressible in the base 16-bit field.
const MAX_CNT_BASE_LIMIT: u64 = 0xFFFF * MAX_CNT_UNIT;
/// Largest max count with the 27-bit extension (bits 26:20 prepended).
const MAX_CNT_EXT_LIMIT: u64 = 0x7F_FFFF * MAX_CNT_UNIT;
/// Power-on default sampling period.
const DEFAULT_MAX_CNT: u64 = 0x10000;

/// How long a blocked drain sleeps between cancellation checks.
const DRAIN_WAIT_SLICE: Duration = Duration::from_millis(50);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the op counter counts when op sampling is armed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpCountMode {
    /// Count clock cycles (the hardware default).
    #[default]
    Cycles,
    /// Count dispatched ops.
    DispatchedOps,
}

/// Staged sampling configuration, programmed into hardware on `Enable`.
#[derive(Clone, Copy, Debug)]
pub struct SamplingConfig {
    /// Events between samples; multiple of 16.
    pub max_cnt: u64,
    /// Op flavor only.
    pub op_count_mode: OpCountMode,
    /// Fetch flavor only: randomize the counter's low bits.
    pub rand_en: bool,
    /// Whether sampling is currently armed in hardware.
    pub enabled: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_cnt: DEFAULT_MAX_CNT,
            op_count_mode: OpCountMode::Cycles,
            rand_en: false,
            enabled: false,
        }
    }
}

/// Typed control operations, issued by the device holder.
#[derive(Clone, Copy, Debug)]
pub enum ControlOp {
    /// Program the control register from the staged config and start
    /// sampling.
    Enable,
    /// Stop sampling.
    Disable,
    /// Set the sampling period (events between samples).
    SetMaxCount(u64),
    /// Choose what the op counter counts.
    SetOpCountMode(OpCountMode),
    /// Randomize the fetch counter's low bits.
    SetRandEn(bool),
}

/// A raw sample captured out of the hardware registers, before it reaches
/// the ring buffer.
#[derive(Clone, Copy, Debug)]
pub enum RawSample {
    Fetch(FetchRecord),
    Op(OpRecord),
}

impl RawSample {
    fn as_bytes(&self) -> &[u8] {
        match self {
            RawSample::Fetch(r) => r.as_bytes(),
            RawSample::Op(r) => r.as_bytes(),
        }
    }
}

/// Cancellation token for a blocked drain. Shared between the waiting
/// consumer and whoever interrupts it.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the token so the next wait can block again.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Result of a successful drain.
#[derive(Debug)]
pub struct Drained {
    /// Whole records, oldest first.
    pub data: Vec<u8>,
    /// Whether the buffer is now empty.
    pub emptied: bool,
}

/// Fixed-capacity FIFO of fixed-size records. Slot-granular, so a record
/// never wraps mid-copy.
struct SampleRing {
    buf: Box<[u8]>,
    entry_size: usize,
    slots: usize,
    /// Next slot to write.
    head: usize,
    /// Oldest filled slot.
    tail: usize,
    len: usize,
    dropped: u64,
}

impl SampleRing {
    fn try_new(capacity_bytes: usize, entry_size: usize) -> Result<Self> {
        let slots = capacity_bytes / entry_size;
        let bytes = slots * entry_size;
        let mut buf = Vec::new();
        buf.try_reserve_exact(bytes).map_err(|_| IbsError::AllocationFailed("sample ring"))?;
        buf.resize(bytes, 0);
        Ok(Self { buf: buf.into_boxed_slice(), entry_size, slots, head: 0, tail: 0, len: 0, dropped: 0 })
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one record, evicting the oldest when full (drop-oldest).
    fn push(&mut self, record: &[u8]) {
        debug_assert_eq!(record.len(), self.entry_size);
        if self.len == self.slots {
            self.tail = (self.tail + 1) % self.slots;
            self.len -= 1;
            self.dropped += 1;
        }
        let at = self.head * self.entry_size;
        self.buf[at..at + self.entry_size].copy_from_slice(record);
        self.head = (self.head + 1) % self.slots;
        self.len += 1;
    }

    /// Copy out up to `max_bytes` worth of whole records, oldest first.
    fn pop(&mut self, max_bytes: usize) -> Vec<u8> {
        let n = (max_bytes / self.entry_size).min(self.len);
        let mut out = Vec::with_capacity(n * self.entry_size);
        for _ in 0..n {
            let at = self.tail * self.entry_size;
            out.extend_from_slice(&self.buf[at..at + self.entry_size]);
            self.tail = (self.tail + 1) % self.slots;
            self.len -= 1;
        }
        out
    }
}

/// The staging slot the interrupt handler fills and the deferred
/// completion empties. Single-sample deep by design.
#[derive(Default)]
struct Staging {
    slot: Option<RawSample>,
}

/// Per-(core, flavor) sampling device state.
pub struct IbsDevice {
    pub cpu: CpuId,
    pub flavor: Flavor,
    support: IbsSupport,
    hw: Arc<dyn HwBackend>,

    in_use: AtomicBool,
    /// Control-path lock: hardware configuration. Taken before `data` if
    /// ever both are held.
    ctl: Mutex<SamplingConfig>,
    /// Data-path lock: ring buffer access.
    data: Mutex<SampleRing>,
    readq: Condvar,

    staging: Mutex<Staging>,
    work_pending: AtomicBool,
    coalesced: AtomicU64,
    stuck_events: AtomicU64,
    stuck_logged: AtomicBool,
}

impl IbsDevice {
    /// Allocate the device and its ring. Runs once per possible core at
    /// module load.
    pub fn new(
        cpu: CpuId,
        flavor: Flavor,
        support: IbsSupport,
        hw: Arc<dyn HwBackend>,
    ) -> Result<Self> {
        let ring = SampleRing::try_new(IBS_BUFFER_SIZE, flavor.record_size())?;
        Ok(Self {
            cpu,
            flavor,
            support,
            hw,
            in_use: AtomicBool::new(false),
            ctl: Mutex::new(SamplingConfig::default()),
            data: Mutex::new(ring),
            readq: Condvar::new(),
            staging: Mutex::new(Staging::default()),
            work_pending: AtomicBool::new(false),
            coalesced: AtomicU64::new(0),
            stuck_events: AtomicU64::new(0),
            stuck_logged: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn support(&self) -> &IbsSupport {
        &self.support
    }

    // ------------------------------------------------------------------
    // Exclusivity
    // ------------------------------------------------------------------

    /// Claim the device for one consumer. Never blocks; concurrent callers
    /// race on a compare-and-set and exactly one wins.
    pub fn acquire(&self) -> Result<()> {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| IbsError::Busy)
    }

    /// Return the device to availability. The only path back from in-use.
    pub fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Control path
    // ------------------------------------------------------------------

    /// Apply one control operation under the control-path lock. Rejected
    /// operations leave the staged configuration untouched.
    pub fn configure(&self, op: ControlOp) -> Result<()> {
        let mut cfg = lock(&self.ctl);
        match op {
            ControlOp::SetMaxCount(v) => {
                self.validate_max_cnt(v)?;
                cfg.max_cnt = v;
                if cfg.enabled {
                    self.program(&cfg)?;
                }
            }
            ControlOp::SetOpCountMode(mode) => {
                if self.flavor != Flavor::Op {
                    return Err(IbsError::InvalidParameter(
                        "op count mode only applies to op devices".into(),
                    ));
                }
                if !self.support.caps.op_cnt {
                    return Err(IbsError::UnsupportedFeature("op count mode selection"));
                }
                cfg.op_count_mode = mode;
                if cfg.enabled {
                    self.program(&cfg)?;
                }
            }
            ControlOp::SetRandEn(en) => {
                if self.flavor != Flavor::Fetch {
                    return Err(IbsError::InvalidParameter(
                        "counter randomization only applies to fetch devices".into(),
                    ));
                }
                cfg.rand_en = en;
                if cfg.enabled {
                    self.program(&cfg)?;
                }
            }
            ControlOp::Enable => {
                cfg.enabled = true;
                self.program(&cfg)?;
            }
            ControlOp::Disable => {
                cfg.enabled = false;
                self.hw.wrmsr(self.cpu, self.ctl_msr(), 0)?;
            }
        }
        Ok(())
    }

    /// Snapshot of the staged configuration.
    #[must_use]
    pub fn current_config(&self) -> SamplingConfig {
        *lock(&self.ctl)
    }

    fn validate_max_cnt(&self, v: u64) -> Result<()> {
        if v == 0 || v % MAX_CNT_UNIT != 0 {
            return Err(IbsError::InvalidParameter(format!(
                "max count {v} must be a non-zero multiple of {MAX_CNT_UNIT}"
            )));
        }
        let limit = match self.flavor {
            Flavor::Fetch => MAX_CNT_BASE_LIMIT,
            Flavor::Op => {
                if v > MAX_CNT_BASE_LIMIT && !self.support.caps.op_cnt_ext {
                    return Err(IbsError::UnsupportedFeature("extended op max count"));
                }
                if self.support.caps.op_cnt_ext { MAX_CNT_EXT_LIMIT } else { MAX_CNT_BASE_LIMIT }
            }
        };
        if v > limit {
            return Err(IbsError::InvalidParameter(format!("max count {v} exceeds {limit}")));
        }
        Ok(())
    }

    fn ctl_msr(&self) -> u32 {
        match self.flavor {
            Flavor::Op => MSR_IBS_OP_CTL,
            Flavor::Fetch => MSR_IBS_FETCH_CTL,
        }
    }

    /// Build and write the hardware control value for the staged config.
    fn program(&self, cfg: &SamplingConfig) -> Result<()> {
        let units = cfg.max_cnt / MAX_CNT_UNIT;
        let value = match self.flavor {
            Flavor::Op => {
                let mut v = (units & 0xFFFF) | ((units >> 16) & 0x7F) << 20 | IBS_OP_EN;
                if cfg.op_count_mode == OpCountMode::DispatchedOps {
                    v |= IBS_OP_CNT_CTL;
                }
                v
            }
            Flavor::Fetch => {
                let mut v = (units & 0xFFFF) | IBS_FETCH_EN;
                if cfg.rand_en {
                    v |= IBS_RAND_EN;
                }
                v
            }
        };
        self.hw.wrmsr(self.cpu, self.ctl_msr(), value)
    }

    /// Forcibly stop hardware sampling, without requiring the device to be
    /// held. Used on core removal; errors are logged because teardown must
    /// always complete.
    pub fn disable_on_core_down(&self) {
        let mut cfg = lock(&self.ctl);
        cfg.enabled = false;
        if let Err(e) = self.hw.wrmsr(self.cpu, self.ctl_msr(), 0) {
            warn!("could not disable {} sampling on {}: {e}", self.flavor, self.cpu);
        }
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    /// Copy whole records out of the ring, up to `max_bytes`.
    ///
    /// Empty buffer: non-blocking drains return [`IbsError::WouldBlock`]
    /// immediately; blocking drains sleep on the read queue until a sample
    /// arrives or `cancel` fires ([`IbsError::Interrupted`]).
    pub fn drain(&self, max_bytes: usize, blocking: bool, cancel: &CancelFlag) -> Result<Drained> {
        let mut ring = lock(&self.data);
        loop {
            if !ring.is_empty() {
                let data = ring.pop(max_bytes);
                return Ok(Drained { emptied: ring.is_empty(), data });
            }
            if !blocking {
                return Err(IbsError::WouldBlock);
            }
            if cancel.is_set() {
                return Err(IbsError::Interrupted);
            }
            let (guard, _timeout) = self
                .readq
                .wait_timeout(ring, DRAIN_WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner);
            ring = guard;
        }
    }

    /// Non-blocking readiness check: at least one whole record buffered.
    #[must_use]
    pub fn poll_ready(&self) -> bool {
        !lock(&self.data).is_empty()
    }

    /// Wake blocked readers so they notice a cancellation promptly.
    pub fn wake_readers(&self) {
        let _ring = lock(&self.data);
        self.readq.notify_all();
    }

    /// Records evicted because the ring was full.
    #[must_use]
    pub fn dropped_records(&self) -> u64 {
        lock(&self.data).dropped
    }

    /// Samples overwritten in the staging slot before their completion ran.
    #[must_use]
    pub fn coalesced_samples(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Times the hardware pending indicator refused to clear.
    #[must_use]
    pub fn stuck_indicator_events(&self) -> u64 {
        self.stuck_events.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Interrupt-side entry points
    // ------------------------------------------------------------------

    /// Restricted-context handoff: place a captured sample in the staging
    /// slot. Never blocks; a slot still holding an undrained sample is
    /// overwritten (newest wins, counted). The one exception to newest-wins:
    /// a sample colliding with the completion's take of the slot is counted
    /// and discarded, because waiting for the lock is not an option here.
    /// Returns `true` when the caller must schedule a deferred completion;
    /// at most one is ever in flight.
    pub fn stage_sample(&self, raw: RawSample) -> bool {
        match self.staging.try_lock() {
            Ok(mut staging) => {
                if staging.slot.is_some() {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                }
                staging.slot = Some(raw);
                !self.work_pending.swap(true, Ordering::AcqRel)
            }
            Err(_) => {
                // Completion is mid-take on another core; the new sample is
                // counted and discarded rather than waited for.
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Deferred completion: move the staged sample into the ring and wake
    /// waiting readers. Runs in a context where brief blocking is fine.
    pub fn complete_deferred(&self) {
        // Clear the token before taking the slot so an interrupt landing
        // in between schedules a fresh completion instead of being lost.
        self.work_pending.store(false, Ordering::Release);
        let sample = lock(&self.staging).slot.take();
        let Some(sample) = sample else { return };

        {
            let mut ring = lock(&self.data);
            ring.push(sample.as_bytes());
            self.readq.notify_all();
        }
        debug!("{} {} sample buffered", self.cpu, self.flavor);
    }

    /// Give back the work-pending token without running the completion.
    /// Only for the scheduling-failed path during shutdown.
    pub(crate) fn abandon_pending(&self) {
        self.work_pending.store(false, Ordering::Release);
    }

    /// The pending indicator would not clear (Family 10h erratum). Logged
    /// loudly once per device, quietly afterwards, never escalated.
    pub fn note_stuck_indicator(&self) {
        self.stuck_events.fetch_add(1, Ordering::Relaxed);
        if self.stuck_logged.swap(true, Ordering::Relaxed) {
            debug!("{} {} pending indicator stuck again", self.cpu, self.flavor);
        } else {
            warn!(
                "{} {} pending indicator cannot be cleared; erratum workaround not engaged?",
                self.cpu, self.flavor
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::probe;
    use crate::hw::SimulatedMachine;
    use ibs_common::{IBS_OP_VAL, OP_RECORD_SIZE};

    fn op_device(sim: &Arc<SimulatedMachine>) -> IbsDevice {
        let support = probe(sim.as_ref()).unwrap();
        IbsDevice::new(CpuId(0), Flavor::Op, support, Arc::clone(sim) as Arc<dyn HwBackend>)
            .unwrap()
    }

    fn record(tag: u64) -> RawSample {
        RawSample::Op(OpRecord { op_rip: tag, ..OpRecord::default() })
    }

    #[test]
    fn ring_is_fifo() {
        let mut ring = SampleRing::try_new(OP_RECORD_SIZE * 4, OP_RECORD_SIZE).unwrap();
        for tag in 0..3u64 {
            let rec = OpRecord { op_rip: tag, ..OpRecord::default() };
            ring.push(rec.as_bytes());
        }
        let out = ring.pop(usize::MAX);
        assert_eq!(out.len(), 3 * OP_RECORD_SIZE);
        for tag in 0..3u64 {
            let at = tag as usize * OP_RECORD_SIZE;
            let rec = OpRecord::from_bytes(&out[at..at + OP_RECORD_SIZE]).unwrap();
            assert_eq!(rec.op_rip, tag);
        }
    }

    #[test]
    fn ring_overflow_drops_oldest() {
        let mut ring = SampleRing::try_new(OP_RECORD_SIZE * 2, OP_RECORD_SIZE).unwrap();
        for tag in 0..5u64 {
            let rec = OpRecord { op_rip: tag, ..OpRecord::default() };
            ring.push(rec.as_bytes());
        }
        assert_eq!(ring.dropped, 3);
        let out = ring.pop(usize::MAX);
        // The two newest survive, still in order.
        let first = OpRecord::from_bytes(&out[..OP_RECORD_SIZE]).unwrap();
        let second = OpRecord::from_bytes(&out[OP_RECORD_SIZE..]).unwrap();
        assert_eq!((first.op_rip, second.op_rip), (3, 4));
    }

    #[test]
    fn ring_pop_respects_max_bytes_and_whole_records() {
        let mut ring = SampleRing::try_new(OP_RECORD_SIZE * 8, OP_RECORD_SIZE).unwrap();
        for tag in 0..4u64 {
            let rec = OpRecord { op_rip: tag, ..OpRecord::default() };
            ring.push(rec.as_bytes());
        }
        // One and a half records' worth of space yields exactly one record.
        let out = ring.pop(OP_RECORD_SIZE + OP_RECORD_SIZE / 2);
        assert_eq!(out.len(), OP_RECORD_SIZE);
        assert_eq!(ring.len, 3);
    }

    #[test]
    fn acquire_is_exclusive_until_release() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let dev = op_device(&sim);
        dev.acquire().unwrap();
        assert!(matches!(dev.acquire(), Err(IbsError::Busy)));
        dev.release();
        dev.acquire().unwrap();
    }

    #[test]
    fn concurrent_acquire_has_exactly_one_winner() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let dev = Arc::new(op_device(&sim));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let dev = Arc::clone(&dev);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                dev.acquire().is_ok()
            }));
        }
        let wins =
            handles.into_iter().map(|h| h.join().unwrap()).filter(|&won| won).count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn nonblocking_drain_on_empty_returns_would_block() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let dev = op_device(&sim);
        let cancel = CancelFlag::new();
        assert!(matches!(dev.drain(4096, false, &cancel), Err(IbsError::WouldBlock)));
    }

    #[test]
    fn blocking_drain_is_cancellable() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let dev = Arc::new(op_device(&sim));
        let cancel = CancelFlag::new();
        let waiter = {
            let dev = Arc::clone(&dev);
            let cancel = cancel.clone();
            std::thread::spawn(move || dev.drain(4096, true, &cancel))
        };
        std::thread::sleep(Duration::from_millis(20));
        cancel.set();
        dev.wake_readers();
        assert!(matches!(waiter.join().unwrap(), Err(IbsError::Interrupted)));
    }

    #[test]
    fn staged_sample_flows_to_ring_and_poll() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let dev = op_device(&sim);
        assert!(!dev.poll_ready());
        assert!(dev.stage_sample(record(7)));
        dev.complete_deferred();
        assert!(dev.poll_ready());
        let cancel = CancelFlag::new();
        let drained = dev.drain(OP_RECORD_SIZE, true, &cancel).unwrap();
        let rec = OpRecord::from_bytes(&drained.data).unwrap();
        assert_eq!(rec.op_rip, 7);
        assert!(drained.emptied);
    }

    #[test]
    fn second_stage_before_completion_coalesces_to_newest() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let dev = op_device(&sim);
        assert!(dev.stage_sample(record(1)));
        // Completion has not run; the second interrupt overwrites the slot
        // and must not schedule a second completion.
        assert!(!dev.stage_sample(record(2)));
        assert_eq!(dev.coalesced_samples(), 1);
        dev.complete_deferred();
        let cancel = CancelFlag::new();
        let drained = dev.drain(usize::MAX, false, &cancel).unwrap();
        assert_eq!(drained.data.len(), OP_RECORD_SIZE);
        assert_eq!(OpRecord::from_bytes(&drained.data).unwrap().op_rip, 2);
    }

    #[test]
    fn rejects_unsupported_extended_max_count_unchanged() {
        let sim = Arc::new(SimulatedMachine::new(1).with_ibs_caps(
            ibs_common::IBS_CAP_FFV | ibs_common::IBS_CAP_OP_SAM | ibs_common::IBS_CAP_FETCH_SAM,
        ));
        let dev = op_device(&sim);
        let before = dev.current_config().max_cnt;
        let err = dev.configure(ControlOp::SetMaxCount(MAX_CNT_BASE_LIMIT * 2)).unwrap_err();
        assert!(matches!(err, IbsError::UnsupportedFeature(_)));
        assert_eq!(dev.current_config().max_cnt, before);
    }

    #[test]
    fn extended_max_count_works_when_capable() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let dev = op_device(&sim);
        dev.configure(ControlOp::SetMaxCount(MAX_CNT_BASE_LIMIT * 2)).unwrap();
        assert_eq!(dev.current_config().max_cnt, MAX_CNT_BASE_LIMIT * 2);
    }

    #[test]
    fn rejects_misaligned_and_oversized_max_count() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let dev = op_device(&sim);
        assert!(matches!(
            dev.configure(ControlOp::SetMaxCount(17)),
            Err(IbsError::InvalidParameter(_))
        ));
        assert!(matches!(
            dev.configure(ControlOp::SetMaxCount(MAX_CNT_EXT_LIMIT + MAX_CNT_UNIT)),
            Err(IbsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn op_count_mode_requires_counting_capability() {
        // Parts can report op sampling without the counting-mode selector.
        let sim = Arc::new(SimulatedMachine::new(1).with_ibs_caps(
            ibs_common::IBS_CAP_FFV | ibs_common::IBS_CAP_OP_SAM | ibs_common::IBS_CAP_FETCH_SAM,
        ));
        let dev = op_device(&sim);
        let err =
            dev.configure(ControlOp::SetOpCountMode(OpCountMode::DispatchedOps)).unwrap_err();
        assert!(matches!(err, IbsError::UnsupportedFeature(_)));
        assert_eq!(dev.current_config().op_count_mode, OpCountMode::Cycles);
    }

    #[test]
    fn stage_colliding_with_completion_take_is_counted_and_discarded() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let dev = op_device(&sim);
        // Emulate the completion holding the staging slot mid-take.
        let held = dev.staging.lock().unwrap();
        assert!(!dev.stage_sample(record(9)));
        assert_eq!(dev.coalesced_samples(), 1);
        drop(held);
        // Nothing was staged, so the completion finds an empty slot.
        dev.complete_deferred();
        assert!(!dev.poll_ready());
    }

    #[test]
    fn rejects_wrong_flavor_controls() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let dev = op_device(&sim);
        assert!(matches!(
            dev.configure(ControlOp::SetRandEn(true)),
            Err(IbsError::InvalidParameter(_))
        ));
        let support = probe(sim.as_ref()).unwrap();
        let fetch =
            IbsDevice::new(CpuId(0), Flavor::Fetch, support, sim.clone() as Arc<dyn HwBackend>)
                .unwrap();
        assert!(matches!(
            fetch.configure(ControlOp::SetOpCountMode(OpCountMode::DispatchedOps)),
            Err(IbsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn enable_programs_and_disable_clears_the_control_register() {
        let sim = Arc::new(SimulatedMachine::new(1));
        let dev = op_device(&sim);
        dev.configure(ControlOp::SetMaxCount(0x2000)).unwrap();
        dev.configure(ControlOp::SetOpCountMode(OpCountMode::DispatchedOps)).unwrap();
        dev.configure(ControlOp::Enable).unwrap();
        let ctl = sim.msr(CpuId(0), MSR_IBS_OP_CTL);
        assert_ne!(ctl & IBS_OP_EN, 0);
        assert_ne!(ctl & IBS_OP_CNT_CTL, 0);
        assert_eq!(ctl & 0xFFFF, 0x2000 / MAX_CNT_UNIT);
        assert_eq!(ctl & IBS_OP_VAL, 0);

        dev.disable_on_core_down();
        assert_eq!(sim.msr(CpuId(0), MSR_IBS_OP_CTL), 0);
        assert!(!dev.current_config().enabled);
    }
}
