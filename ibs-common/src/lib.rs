//! # Shared Sampling-Hardware Definitions
//!
//! Defines the fixed sample-record layouts and the hardware register map
//! shared between the sampling core and anything that consumes raw records
//! (the CLI, external decoders). All record types use `#[repr(C)]` so a
//! record drained out of a device buffer can be reinterpreted byte-for-byte.
//!
//! ## Key Types
//!
//! - [`FetchRecord`] - One instruction-fetch sample (5 x u64)
//! - [`OpRecord`] - One micro-op sample (10 x u64)
//!
//! The MSR indices and CPUID bits below follow the AMD Instruction-Based
//! Sampling register map (CPUID `Fn8000_001B`, MSRs `C001_1030..C001_103D`).

#![no_std]

// ============================================================================
// CPUID leaves and feature bits
// ============================================================================

/// Extended processor features leaf; ECX bit 10 indicates IBS presence.
pub const CPUID_EXT_FEATURES: u32 = 0x8000_0001;

/// IBS bit in `CPUID_EXT_FEATURES` ECX.
pub const CPUID_EXT_FEATURES_IBS: u32 = 1 << 10;

/// IBS capability leaf (`Fn8000_001B`); flags live in EAX.
pub const CPUID_IBS_FEATURES: u32 = 0x8000_001B;

/// Feature flags valid. If clear, nothing else in the leaf means anything.
pub const IBS_CAP_FFV: u32 = 1 << 0;
/// Fetch sampling supported.
pub const IBS_CAP_FETCH_SAM: u32 = 1 << 1;
/// Op sampling supported.
pub const IBS_CAP_OP_SAM: u32 = 1 << 2;
/// Read/write of the op counter supported.
pub const IBS_CAP_OP_RDWR_CNT: u32 = 1 << 3;
/// Op counting mode (cycles vs. dispatched ops) supported.
pub const IBS_CAP_OP_CNT: u32 = 1 << 4;
/// Branch target address reporting supported.
pub const IBS_CAP_BRN_TRGT: u32 = 1 << 5;
/// Extended (27-bit) op max count supported.
pub const IBS_CAP_OP_CNT_EXT: u32 = 1 << 6;
/// Invalid RIP indication supported.
pub const IBS_CAP_RIP_INVALID_CHK: u32 = 1 << 7;
/// Fused branch micro-op indication supported.
pub const IBS_CAP_OP_BRN_FUSE: u32 = 1 << 8;
/// Extended fetch control register supported.
pub const IBS_CAP_FETCH_CTL_EXTD: u32 = 1 << 9;
/// `OP_DATA4` register supported.
pub const IBS_CAP_OP_DATA4: u32 = 1 << 10;

// ============================================================================
// MSR indices
// ============================================================================

pub const MSR_IBS_FETCH_CTL: u32 = 0xC001_1030;
pub const MSR_IBS_FETCH_LIN_AD: u32 = 0xC001_1031;
pub const MSR_IBS_FETCH_PHYS_AD: u32 = 0xC001_1032;
pub const MSR_IBS_OP_CTL: u32 = 0xC001_1033;
pub const MSR_IBS_OP_RIP: u32 = 0xC001_1034;
pub const MSR_IBS_OP_DATA: u32 = 0xC001_1035;
pub const MSR_IBS_OP_DATA2: u32 = 0xC001_1036;
pub const MSR_IBS_OP_DATA3: u32 = 0xC001_1037;
pub const MSR_IBS_DC_LIN_AD: u32 = 0xC001_1038;
pub const MSR_IBS_DC_PHYS_AD: u32 = 0xC001_1039;
/// IBS control MSR; carries the interrupt-vector (LVT) offset.
pub const MSR_IBS_CONTROL: u32 = 0xC001_103A;
pub const MSR_IBS_BR_TARGET: u32 = 0xC001_103B;
pub const MSR_IBS_FETCH_CTL_EXTD: u32 = 0xC001_103C;
pub const MSR_IBS_OP_DATA4: u32 = 0xC001_103D;

/// CPUID feature-override MSR used by the Family 17h Model 01h workaround:
/// setting [`FAM17H_CPUID_IBS_EN`] makes the IBS CPUID bit read as set.
pub const MSR_CPUID_EXT_FEATURES: u32 = 0xC001_1005;
pub const FAM17H_CPUID_IBS_EN: u64 = 1 << 42;

// ============================================================================
// Control-register bits
// ============================================================================

/// Fetch max count field, bits 15:0, in units of 16 fetched bytes.
pub const IBS_FETCH_MAX_CNT_MASK: u64 = 0xFFFF;
/// Fetch sampling enable.
pub const IBS_FETCH_EN: u64 = 1 << 48;
/// Fetch sample valid (pending-interrupt indicator).
pub const IBS_FETCH_VAL: u64 = 1 << 49;
/// Randomize the fetch counter's low bits.
pub const IBS_RAND_EN: u64 = 1 << 57;

/// Op max count field, bits 15:0, in units of 16 ops.
pub const IBS_OP_MAX_CNT_MASK: u64 = 0xFFFF;
/// Op sampling enable.
pub const IBS_OP_EN: u64 = 1 << 17;
/// Op sample valid (pending-interrupt indicator).
pub const IBS_OP_VAL: u64 = 1 << 18;
/// Count dispatched ops (set) or clock cycles (clear).
pub const IBS_OP_CNT_CTL: u64 = 1 << 19;
/// Extended op max count, bits 26:20.
pub const IBS_OP_MAX_CNT_EXT_MASK: u64 = 0x7F << 20;

/// LVT offset field of [`MSR_IBS_CONTROL`], bits 3:0.
pub const IBS_LVT_OFFSET_MASK: u64 = 0xF;
/// LVT offset valid bit of [`MSR_IBS_CONTROL`].
pub const IBS_LVT_OFFSET_VAL: u64 = 1 << 8;

/// Family 15h Models 00h-1Fh Erratum 718: the processor sets but never
/// clears `OP_DATA3` bits 3, 6 and 19. Capture scrubs them when the
/// workaround is engaged.
pub const ERR718_STUCK_BITS: u64 = (1 << 3) | (1 << 6) | (1 << 19);

// ============================================================================
// Sample records
// ============================================================================

/// One instruction-fetch sample, in hardware register order.
///
/// Written into a device's ring buffer as raw bytes; `fetch_ctl_extd` is
/// zero on parts without the extended fetch control capability.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchRecord {
    pub fetch_ctl: u64,
    pub fetch_lin_ad: u64,
    pub fetch_phys_ad: u64,
    pub fetch_ctl_extd: u64,
    /// Timestamp counter at capture time.
    pub tsc: u64,
}

/// One micro-op sample, in hardware register order.
///
/// `br_target` and `op_data4` are zero on parts without the corresponding
/// capability bits.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpRecord {
    pub op_ctl: u64,
    pub op_rip: u64,
    pub op_data: u64,
    pub op_data2: u64,
    pub op_data3: u64,
    pub op_data4: u64,
    pub dc_lin_ad: u64,
    pub dc_phys_ad: u64,
    pub br_target: u64,
    /// Timestamp counter at capture time.
    pub tsc: u64,
}

/// Size in bytes of one fetch record in the ring buffer.
pub const FETCH_RECORD_SIZE: usize = core::mem::size_of::<FetchRecord>();

/// Size in bytes of one op record in the ring buffer.
pub const OP_RECORD_SIZE: usize = core::mem::size_of::<OpRecord>();

// These unsafe byte views are what lets a record cross the device buffer
// as plain bytes. Sound because both types are #[repr(C)] with only u64
// fields: no padding, no invalid bit patterns.
#[cfg(feature = "user")]
mod bytes {
    use super::{FetchRecord, OpRecord, FETCH_RECORD_SIZE, OP_RECORD_SIZE};

    impl FetchRecord {
        #[allow(unsafe_code)]
        #[must_use]
        pub fn as_bytes(&self) -> &[u8] {
            unsafe {
                core::slice::from_raw_parts(core::ptr::from_ref(self).cast(), FETCH_RECORD_SIZE)
            }
        }

        /// Reassemble a record from drained buffer bytes. Returns `None` if
        /// the slice is not exactly one record long.
        #[allow(unsafe_code)]
        #[must_use]
        pub fn from_bytes(raw: &[u8]) -> Option<Self> {
            if raw.len() != FETCH_RECORD_SIZE {
                return None;
            }
            Some(unsafe { core::ptr::read_unaligned(raw.as_ptr().cast()) })
        }
    }

    impl OpRecord {
        #[allow(unsafe_code)]
        #[must_use]
        pub fn as_bytes(&self) -> &[u8] {
            unsafe {
                core::slice::from_raw_parts(core::ptr::from_ref(self).cast(), OP_RECORD_SIZE)
            }
        }

        /// Reassemble a record from drained buffer bytes. Returns `None` if
        /// the slice is not exactly one record long.
        #[allow(unsafe_code)]
        #[must_use]
        pub fn from_bytes(raw: &[u8]) -> Option<Self> {
            if raw.len() != OP_RECORD_SIZE {
                return None;
            }
            Some(unsafe { core::ptr::read_unaligned(raw.as_ptr().cast()) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_are_fixed() {
        assert_eq!(FETCH_RECORD_SIZE, 40);
        assert_eq!(OP_RECORD_SIZE, 80);
    }

    #[cfg(feature = "user")]
    #[test]
    fn op_record_byte_round_trip() {
        let rec = OpRecord { op_rip: 0xdead_beef, op_data3: 7, tsc: 42, ..OpRecord::default() };
        let back = OpRecord::from_bytes(rec.as_bytes()).unwrap();
        assert_eq!(back, rec);
    }
}
