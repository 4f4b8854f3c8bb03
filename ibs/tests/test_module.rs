//! Module lifecycle: probe refusals, load/unload, hot-plug driven node
//! visibility, and the revision workarounds observable from the outside.

use std::sync::Arc;

use ibs::{CpuAction, CpuId, CpuVendor, Flavor, IbsError, IbsModule, SimulatedMachine};
use ibs_common::{FAM17H_CPUID_IBS_EN, IBS_CAP_FFV, MSR_CPUID_EXT_FEATURES};

#[test]
fn load_refuses_unsupported_processors() {
    let wrong_vendor = Arc::new(SimulatedMachine::new(2).with_vendor(CpuVendor::Other));
    assert!(matches!(
        IbsModule::load(wrong_vendor),
        Err(IbsError::UnsupportedHardware(_))
    ));

    let too_old = Arc::new(SimulatedMachine::new(2).with_family_model(0x0f, 0x00));
    assert!(matches!(IbsModule::load(too_old), Err(IbsError::UnsupportedHardware(_))));

    // The capability leaf advertises the valid flag but neither flavor.
    let no_flavors = Arc::new(SimulatedMachine::new(2).with_ibs_caps(IBS_CAP_FFV));
    assert!(matches!(IbsModule::load(no_flavors), Err(IbsError::UnsupportedHardware(_))));
}

#[test]
fn load_arms_vectors_and_creates_nodes_for_online_cores() {
    let sim = Arc::new(SimulatedMachine::new(4));
    sim.set_online(CpuId(3), false);
    let module = IbsModule::load(sim.clone()).unwrap();

    for cpu in [CpuId(0), CpuId(1), CpuId(2)] {
        assert!(sim.vector_armed(cpu));
        let handle = module.open(cpu, Flavor::Op).unwrap();
        drop(handle);
    }
    // The offline core has storage but no visible node.
    assert_eq!(module.possible_cpus(), 4);
    assert!(matches!(
        module.open(CpuId(3), Flavor::Op),
        Err(IbsError::NoSuchDevice { .. })
    ));
}

#[test]
fn hotplug_cycle_makes_nodes_appear_and_disappear() {
    let sim = Arc::new(SimulatedMachine::new(4));
    sim.set_online(CpuId(3), false);
    let module = IbsModule::load(sim.clone()).unwrap();

    // Bring core 3 up.
    module.cpu_notify(CpuId(3), CpuAction::UpPrepare).unwrap();
    sim.set_online(CpuId(3), true);
    module.cpu_notify(CpuId(3), CpuAction::Online).unwrap();
    assert!(sim.vector_armed(CpuId(3)));
    let handle = module.open(CpuId(3), Flavor::Fetch).unwrap();
    drop(handle);

    // And back down.
    module.cpu_notify(CpuId(3), CpuAction::DownPrepare).unwrap();
    sim.set_online(CpuId(3), false);
    module.cpu_notify(CpuId(3), CpuAction::Dead).unwrap();
    assert!(matches!(
        module.open(CpuId(3), Flavor::Fetch),
        Err(IbsError::NoSuchDevice { .. })
    ));
}

#[test]
fn continuous_enable_workaround_holds_the_bit_while_loaded() {
    // Family 17h Model 01h with the CPUID presence bit dark: load must
    // still succeed and keep the per-core enable asserted.
    let sim = Arc::new(
        SimulatedMachine::new(2).with_family_model(0x17, 0x01).without_cpuid_ibs(),
    );
    let module = IbsModule::load(sim.clone()).unwrap();
    assert!(module.support().workarounds.fam17h_m01h);

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while sim.msr(CpuId(0), MSR_CPUID_EXT_FEATURES) & FAM17H_CPUID_IBS_EN == 0 {
        assert!(std::time::Instant::now() < deadline, "enable bit never asserted");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_ne!(sim.msr(CpuId(1), MSR_CPUID_EXT_FEATURES) & FAM17H_CPUID_IBS_EN, 0);

    // Unload reverts the bit on every core.
    module.unload();
    assert_eq!(sim.msr(CpuId(0), MSR_CPUID_EXT_FEATURES) & FAM17H_CPUID_IBS_EN, 0);
    assert_eq!(sim.msr(CpuId(1), MSR_CPUID_EXT_FEATURES) & FAM17H_CPUID_IBS_EN, 0);
}

#[test]
fn unload_while_handle_gone_leaves_nothing_armed() {
    let sim = Arc::new(SimulatedMachine::new(2));
    let module = IbsModule::load(sim.clone()).unwrap();
    {
        let handle = module.open(CpuId(0), Flavor::Op).unwrap();
        handle.control(ibs::ControlOp::Enable).unwrap();
    }
    // Closing the handle already stopped the hardware.
    assert_eq!(sim.msr(CpuId(0), ibs_common::MSR_IBS_OP_CTL), 0);
    module.unload();
}
