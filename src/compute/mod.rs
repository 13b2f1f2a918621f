// Export the device scheduling layer of attack 5
pub mod device;
pub mod kernel;
pub mod queue;
pub mod scheduler;

use crate::attacks::state_recovery::{layer0_candidates, AuthCapture};
use crate::error::{Error, Result};
use crate::hitag2::MASK48;

use device::{DeviceSelection, Profile};
use kernel::{CpuSliceKernel, SliceKernel};
use queue::{QueueOrder, WorkQueue};
use scheduler::{FoundKey, SchedulerMode};

#[derive(Debug, Clone)]
pub struct SchedOptions {
    pub selection: DeviceSelection,
    pub mode: SchedulerMode,
    pub queue_order: QueueOrder,
    pub forced_profile: Option<usize>,
    pub verify_on_device: bool,
    pub verbose: bool,
}

/// Assemble and run the scheduled variant of attack 5: discover devices,
/// settle on a common profile, slice the layer-0 candidates into a work
/// queue and let one worker per device drain it.
pub fn run_attack(auth: &AuthCapture, opts: &SchedOptions) -> Result<Option<FoundKey>> {
    let mut platforms = device::discover();
    let selected = device::select(&mut platforms, &opts.selection, opts.forced_profile)?;
    if selected == 0 {
        return Err(Error::DeviceSetup(
            "no device matches the selection; list with -s".to_string(),
        ));
    }

    let profile_idx = device::smallest_profile(&platforms);
    let Profile {
        slice_count,
        chunk_bits,
    } = device::PROFILES[profile_idx];

    println!("Selected {} compute device(s)\n", selected);
    let mut worker_names = Vec::new();
    for p in &platforms {
        for d in p.devices.iter().filter(|d| d.selected) {
            println!("{:2} - {}", worker_names.len(), d.name);
            if opts.verbose {
                let kopts = device::KernelOptions::for_device(d, opts.verify_on_device);
                println!("     build options: {}", kopts);
            }
            worker_names.push(d.name.clone());
        }
    }
    println!();

    let candidates = layer0_candidates(auth.ar1);
    let kernel = CpuSliceKernel::new(auth, candidates, chunk_bits, opts.verify_on_device);

    // cover every candidate even when the layer-0 yield drifts off the
    // nominal slice count for this profile
    let units = kernel.unit_count();
    let queue = WorkQueue::new(opts.queue_order);
    for step in 0..units {
        queue.push(step, step << chunk_bits, units);
    }

    if opts.verbose {
        println!(
            "Max slices {} (profile {}, nominal {}), {} order, {} scheduler",
            units,
            profile_idx,
            slice_count,
            opts.queue_order,
            opts.mode
        );
    }

    scheduler::run(&kernel, auth, worker_names.len(), opts.mode, &queue)
}

/// Print the recovered key in the external hex convention.
pub fn report_key(found: &FoundKey) {
    println!(
        "\nKey found @ slice {}/{}: [ {} ]",
        found.slice,
        found.max_slices,
        crate::utils::format_key(found.key & MASK48)
    );
}
