// src/compute/device.rs
//
// Compute device discovery and workload profiles for the scheduled
// attack. The search runs against whatever backends are compiled in;
// this build carries the portable CPU bitslice backend, which shows up
// as one platform exposing one device per logical CPU. An OpenCL
// backend would enumerate its platforms and devices the same way and
// plug its kernels in through the `SliceKernel` trait.

use std::fmt;

use crate::error::{Error, Result};

/// Workload sizing: how many slices the candidate space is cut into and
/// how many candidates (log2) one kernel launch consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub slice_count: u64,
    pub chunk_bits: u64,
}

/// Fixed table from light kernels for weak devices (profile 0) down to
/// few, heavy launches for strong ones (profile 10).
pub const PROFILES: [Profile; 11] = [
    Profile { slice_count: 16384, chunk_bits: 5 },  // Intel GPUs with Neo
    Profile { slice_count: 8192, chunk_bits: 6 },   // Intel Neo only
    Profile { slice_count: 4096, chunk_bits: 7 },   // NVIDIA and most others
    Profile { slice_count: 2048, chunk_bits: 8 },   // a good fit for CPUs
    Profile { slice_count: 1024, chunk_bits: 9 },
    Profile { slice_count: 512, chunk_bits: 10 },
    Profile { slice_count: 256, chunk_bits: 11 },
    Profile { slice_count: 128, chunk_bits: 12 },
    Profile { slice_count: 64, chunk_bits: 13 },
    Profile { slice_count: 32, chunk_bits: 14 },
    Profile { slice_count: 16, chunk_bits: 15 },    // very small devices
];

/// Default profile for a CPU device.
const PROFILE_CPU: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTypeFilter {
    Gpu,
    Cpu,
    All,
}

impl DeviceTypeFilter {
    pub fn from_flag(v: u32) -> Result<Self> {
        match v {
            0 => Ok(DeviceTypeFilter::Gpu),
            1 => Ok(DeviceTypeFilter::Cpu),
            2 => Ok(DeviceTypeFilter::All),
            other => Err(Error::usage(
                "device type",
                format!("{} (use 0=GPU, 1=CPU, 2=ALL)", other),
            )),
        }
    }

    fn admits(&self, t: DeviceType) -> bool {
        matches!(
            (self, t),
            (DeviceTypeFilter::All, _)
                | (DeviceTypeFilter::Gpu, DeviceType::Gpu)
                | (DeviceTypeFilter::Cpu, DeviceType::Cpu)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub vendor: String,
    pub device_type: DeviceType,
    pub compute_units: u32,
    /// Ternary bitwise ops in hardware; halves the filter instruction
    /// count when a kernel can use it.
    pub have_lop3: bool,
    pub have_local_memory: bool,
    pub profile: usize,
    pub selected: bool,
}

#[derive(Debug, Clone)]
pub struct Platform {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub devices: Vec<Device>,
    pub selected: bool,
}

/// Which platforms/devices the user asked for (1-based indices, None
/// meaning all) and the admitted device type.
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub platforms: Option<Vec<usize>>,
    pub devices: Option<Vec<usize>>,
    pub device_type: DeviceTypeFilter,
}

impl Default for DeviceSelection {
    fn default() -> Self {
        DeviceSelection {
            platforms: None,
            devices: None,
            device_type: DeviceTypeFilter::Gpu,
        }
    }
}

/// Per-device kernel build switches, echoed verbatim in verbose mode.
#[derive(Debug, Clone, Copy)]
pub struct KernelOptions {
    pub lop3: bool,
    pub on_device_verify: bool,
    pub local_memory: bool,
    pub low_performance: bool,
}

impl KernelOptions {
    pub fn for_device(d: &Device, on_device_verify: bool) -> Self {
        KernelOptions {
            lop3: d.have_lop3,
            on_device_verify,
            local_memory: d.have_local_memory,
            low_performance: d.device_type == DeviceType::Gpu && d.vendor.starts_with("Intel"),
        }
    }
}

impl fmt::Display for KernelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut opts = Vec::new();
        if self.lop3 {
            opts.push("HAVE_LOP3");
        }
        if self.on_device_verify {
            opts.push("WITH_FULL_VERIFY");
        }
        if self.local_memory {
            opts.push("HAVE_LOCAL_MEMORY");
        }
        if self.low_performance {
            opts.push("LOWPERF");
        }
        if opts.is_empty() {
            f.write_str("(none)")
        } else {
            f.write_str(&opts.join(" "))
        }
    }
}

/// Enumerate every platform the build knows about.
pub fn discover() -> Vec<Platform> {
    let cpus = num_cpus::get().max(1);
    let devices = (0..cpus)
        .map(|i| Device {
            name: format!("host-cpu/{}", i),
            vendor: "host".to_string(),
            device_type: DeviceType::Cpu,
            compute_units: 1,
            have_lop3: false,
            have_local_memory: true,
            profile: PROFILE_CPU,
            selected: false,
        })
        .collect();

    vec![Platform {
        name: "Portable bitslice engine".to_string(),
        vendor: "host".to_string(),
        version: format!("cpu {} threads", cpus),
        devices,
        selected: false,
    }]
}

/// Apply the user selection, marking platforms and devices. Returns how
/// many devices were selected.
pub fn select(
    platforms: &mut [Platform],
    sel: &DeviceSelection,
    forced_profile: Option<usize>,
) -> Result<usize> {
    if let Some(p) = forced_profile {
        if p >= PROFILES.len() {
            return Err(Error::usage(
                "profile",
                format!("{} (accepted: 0 to {})", p, PROFILES.len() - 1),
            ));
        }
    }

    let mut count = 0;
    for (pi, platform) in platforms.iter_mut().enumerate() {
        let platform_wanted = match &sel.platforms {
            None => true,
            Some(list) => list.contains(&(pi + 1)),
        };
        if !platform_wanted {
            continue;
        }

        for (di, device) in platform.devices.iter_mut().enumerate() {
            let device_wanted = match &sel.devices {
                None => true,
                Some(list) => list.contains(&(di + 1)),
            };
            if !device_wanted || !sel.device_type.admits(device.device_type) {
                continue;
            }

            device.selected = true;
            if let Some(p) = forced_profile {
                device.profile = p;
            }
            platform.selected = true;
            count += 1;
        }
    }
    Ok(count)
}

/// The common profile across every selected device: the smallest one,
/// so the shared queue's slice size suits the weakest device.
pub fn smallest_profile(platforms: &[Platform]) -> usize {
    platforms
        .iter()
        .filter(|p| p.selected)
        .flat_map(|p| p.devices.iter())
        .filter(|d| d.selected)
        .map(|d| d.profile)
        .min()
        .unwrap_or(PROFILE_CPU)
}

/// Print the discovery listing (`-s`).
pub fn list(platforms: &[Platform]) {
    for (pi, p) in platforms.iter().enumerate() {
        println!("Platform {}: {} ({}, {})", pi + 1, p.name, p.vendor, p.version);
        for (di, d) in p.devices.iter().enumerate() {
            println!(
                "  Device {}: {} ({:?}, {} CU, lop3 {}, local memory {})",
                di + 1,
                d.name,
                d.device_type,
                d.compute_units,
                if d.have_lop3 { "yes" } else { "no" },
                if d.have_local_memory { "yes" } else { "no" },
            );
        }
    }
}
