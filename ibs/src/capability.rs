//! # Capability Prober
//!
//! Interrogates the running processor once, before any sampling device
//! exists, and produces the immutable [`IbsSupport`] value every other
//! component receives by reference. There is no global capability state;
//! whoever needs the answers carries a copy.
//!
//! Refusal cases ("unsupported hardware", module does not load):
//! - not an AMD processor
//! - family predates sampling support (< 10h, or the 11h gap)
//! - CPUID says no IBS and no known-defective revision explains it
//! - the capability leaf's feature-flags-valid bit is clear
//! - neither fetch nor op sampling is present

use log::{error, info, warn};

use ibs_common::{
    CPUID_EXT_FEATURES, CPUID_EXT_FEATURES_IBS, CPUID_IBS_FEATURES, IBS_CAP_BRN_TRGT, IBS_CAP_FFV,
    IBS_CAP_FETCH_CTL_EXTD, IBS_CAP_FETCH_SAM, IBS_CAP_OP_BRN_FUSE, IBS_CAP_OP_CNT,
    IBS_CAP_OP_CNT_EXT, IBS_CAP_OP_DATA4, IBS_CAP_OP_RDWR_CNT, IBS_CAP_OP_SAM,
    IBS_CAP_RIP_INVALID_CHK,
};

use crate::domain::{IbsError, Result};
use crate::hw::{CpuVendor, HwBackend};

/// Which optional sampling facilities the processor reports.
#[derive(Clone, Copy, Debug, Default)]
pub struct CapabilitySet {
    pub fetch_sampling: bool,
    pub op_sampling: bool,
    /// Op counting-mode selection (cycles vs. dispatched ops).
    pub op_cnt: bool,
    pub branch_target: bool,
    pub op_cnt_ext: bool,
    pub rip_invalid_chk: bool,
    pub op_brn_fuse: bool,
    pub fetch_ctl_extd: bool,
    pub op_data4: bool,
}

/// Which hardware-revision defects need special handling.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkaroundSet {
    /// Family 10h Erratum 420: the sampling engine may generate an
    /// interrupt whose pending indicator cannot be cleared.
    pub fam10h_err_420: bool,
    /// Family 15h Models 00h-1Fh Erratum 718: OP_DATA3 bits 3, 6 and 19
    /// are set but never cleared by the processor.
    pub fam15h_err_718: bool,
    /// Family 17h Model 01h parts may ship with IBS disabled; the enable
    /// bits must be continuously re-asserted per core.
    pub fam17h_m01h: bool,
}

/// The process-wide probe result, computed once and then read-only.
#[derive(Clone, Copy, Debug, Default)]
pub struct IbsSupport {
    pub caps: CapabilitySet,
    pub workarounds: WorkaroundSet,
}

/// Examine the executing processor and decide what this machine can do.
///
/// # Errors
///
/// Returns [`IbsError::UnsupportedHardware`] for any of the refusal cases
/// listed in the module docs.
pub fn probe(hw: &dyn HwBackend) -> Result<IbsSupport> {
    if hw.vendor() != CpuVendor::Amd {
        error!("not an AMD processor; refusing to start sampling");
        return Err(IbsError::UnsupportedHardware("not an AMD processor".into()));
    }

    let family = hw.family();
    let model = hw.model();

    // Sampling exists on families 10h, 12h, 14h-17h and later; 11h and
    // everything before 10h never had it.
    if family < 0x10 || family == 0x11 {
        error!("family {family:#x} predates instruction sampling");
        return Err(IbsError::UnsupportedHardware(format!(
            "family {family:#x} has no sampling support"
        )));
    }

    let mut workarounds = WorkaroundSet::default();

    if family == 0x10 {
        info!("enabling workaround for Family 10h Erratum 420");
        workarounds.fam10h_err_420 = true;
    }

    if family == 0x15 && model <= 0x1f {
        info!("enabling workaround for Family 15h Models 00h-1Fh Erratum 718");
        workarounds.fam15h_err_718 = true;
    }

    let ext = hw.cpuid(CPUID_EXT_FEATURES);
    if ext.ecx & CPUID_EXT_FEATURES_IBS == 0 {
        if family == 0x17 && model == 0x01 {
            // Known-defective revision: IBS is present but not enabled by
            // default. Engage the continuous enable workaround instead of
            // failing.
            info!("enabling workaround for Family 17h Model 01h");
            warn!("this workaround may slow the processor down; unload for max performance");
            workarounds.fam17h_m01h = true;
        } else {
            error!("CPUID Fn8000_0001 indicates no IBS support");
            return Err(IbsError::UnsupportedHardware(
                "CPUID reports no instruction-sampling facility".into(),
            ));
        }
    }

    let leaf = hw.cpuid(CPUID_IBS_FEATURES).eax;
    if leaf & IBS_CAP_FFV == 0 {
        error!("CPUID Fn8000_001B feature flags invalid");
        return Err(IbsError::UnsupportedHardware("sampling capability leaf invalid".into()));
    }

    // Op support is spread across three bits; this driver wants all of the
    // op features, so any of them counts.
    let caps = CapabilitySet {
        fetch_sampling: leaf & IBS_CAP_FETCH_SAM != 0,
        op_sampling: leaf & (IBS_CAP_OP_SAM | IBS_CAP_OP_RDWR_CNT | IBS_CAP_OP_CNT) != 0,
        op_cnt: leaf & IBS_CAP_OP_CNT != 0,
        branch_target: leaf & IBS_CAP_BRN_TRGT != 0,
        op_cnt_ext: leaf & IBS_CAP_OP_CNT_EXT != 0,
        rip_invalid_chk: leaf & IBS_CAP_RIP_INVALID_CHK != 0,
        op_brn_fuse: leaf & IBS_CAP_OP_BRN_FUSE != 0,
        fetch_ctl_extd: leaf & IBS_CAP_FETCH_CTL_EXTD != 0,
        op_data4: leaf & IBS_CAP_OP_DATA4 != 0,
    };

    if !caps.fetch_sampling && !caps.op_sampling {
        error!("CPUID Fn8000_001B says neither op nor fetch sampling");
        return Err(IbsError::UnsupportedHardware(
            "neither op nor fetch sampling supported".into(),
        ));
    }

    Ok(IbsSupport { caps, workarounds })
}
