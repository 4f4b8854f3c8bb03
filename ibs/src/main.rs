//! # ibs - Main Entry Point
//!
//! Drives the whole subsystem against a simulated machine: load the
//! module, open one device, arm sampling, deliver periodic sampling
//! interrupts from a producer thread, and drain records on the main
//! thread until the requested count arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use ibs::cli::Args;
use ibs::{ControlOp, CpuId, Flavor, IbsError, IbsModule, SimulatedMachine};
use ibs_common::{FetchRecord, OpRecord, FETCH_RECORD_SIZE, OP_RECORD_SIZE};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            if e.to_string().contains("flavor") { EXIT_USAGE } else { EXIT_ERROR }
        }
    });
}

#[allow(clippy::too_many_lines)]
fn run() -> Result<()> {
    let args = Args::parse();

    let flavor = match args.flavor.as_str() {
        "op" => Flavor::Op,
        "fetch" => Flavor::Fetch,
        other => bail!("unknown flavor {other:?} (expected \"op\" or \"fetch\")"),
    };

    let mut sim = SimulatedMachine::new(args.cpus).with_family_model(args.family, args.model);
    if args.family == 0x17 && args.model == 0x01 {
        // Model the parts that ship with the CPUID bit dark, so the
        // continuous enable workaround actually engages.
        sim = sim.without_cpuid_ibs();
    }
    let sim = Arc::new(sim);

    let module = Arc::new(IbsModule::load(sim.clone())?);
    let support = module.support();
    info!(
        "loaded: fetch={} op={} workarounds: err420={} err718={} fam17h={}",
        support.caps.fetch_sampling,
        support.caps.op_sampling,
        support.workarounds.fam10h_err_420,
        support.workarounds.fam15h_err_718,
        support.workarounds.fam17h_m01h,
    );

    let cpu = CpuId(args.cpu);
    let handle = module.open(cpu, flavor)?;
    handle.control(ControlOp::SetMaxCount(0x4000))?;
    handle.control(ControlOp::Enable)?;

    // Producer: the "hardware" raising one sampling interrupt per period.
    let done = Arc::new(AtomicBool::new(false));
    let producer = {
        let sim = Arc::clone(&sim);
        let module = Arc::clone(&module);
        let done = Arc::clone(&done);
        let period = Duration::from_micros(args.period_us);
        let samples = args.samples;
        thread::spawn(move || {
            for i in 0..samples {
                match flavor {
                    Flavor::Op => sim.inject_op_sample(cpu, 0x40_0000 + i * 0x10, 0),
                    Flavor::Fetch => sim.inject_fetch_sample(cpu, 0x40_0000 + i * 0x10),
                }
                module.handle_nmi(cpu);
                thread::sleep(period);
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let record_size = flavor.record_size();
    let mut collected = 0u64;
    while collected < args.samples {
        match handle.read(64 * record_size, false) {
            Ok(drained) => {
                for raw in drained.data.chunks_exact(record_size) {
                    match flavor {
                        Flavor::Op => {
                            if let Some(rec) = OpRecord::from_bytes(&raw[..OP_RECORD_SIZE]) {
                                println!(
                                    "{cpu} op  rip={:#014x} data3={:#x} tsc={}",
                                    rec.op_rip, rec.op_data3, rec.tsc
                                );
                            }
                        }
                        Flavor::Fetch => {
                            if let Some(rec) = FetchRecord::from_bytes(&raw[..FETCH_RECORD_SIZE]) {
                                println!(
                                    "{cpu} fetch lin={:#014x} phys={:#014x} tsc={}",
                                    rec.fetch_lin_ad, rec.fetch_phys_ad, rec.tsc
                                );
                            }
                        }
                    }
                    collected += 1;
                }
            }
            Err(IbsError::WouldBlock) => {
                if done.load(Ordering::SeqCst) && !handle.poll() {
                    // Coalescing can eat samples injected faster than the
                    // completion path drains them; nothing more is coming.
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e.into()),
        }
    }

    let _ = producer.join();
    println!(
        "collected {collected} records (dropped={} coalesced={})",
        handle.dropped_records(),
        handle.coalesced_samples()
    );

    drop(handle);
    Ok(())
}
