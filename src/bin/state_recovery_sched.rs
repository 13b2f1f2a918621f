// src/bin/state_recovery_sched.rs
//
// Attack 5 on the compute-device scheduler: the layer-0 candidates are
// sliced into a work queue and drained by one worker per selected
// device. This build ships the portable CPU bitslice backend.
//
// Exit codes: 0 key found, 1 not found, 2 resource error, 3 setup
// error, 8 usage error.

use std::process;
use std::time::Instant;

use clap::{App, Arg};

use hitag2_attack_toolkit::attacks::state_recovery::AuthCapture;
use hitag2_attack_toolkit::compute::{self, device, queue::QueueOrder, scheduler::SchedulerMode};
use hitag2_attack_toolkit::error::Error;
use hitag2_attack_toolkit::utils;
use hitag2_attack_toolkit::VERSION;

fn run() -> Result<i32, Error> {
    let matches = App::new("state_recovery_sched")
        .about("Scheduled HiTag2 state recovery across compute devices")
        .override_usage(
            "state_recovery_sched [options] {UID} {nR1} {aR1} {nR2} {aR2}\n    \
             Example: state_recovery_sched -D 1 -Q 2 2ab12bf2 4B71E49D 6A606453 D79BD94B 16A2255B",
        )
        .arg(
            Arg::new("platforms")
                .short('p')
                .value_name("LIST")
                .help("Select platform(s), comma separated 1-based [default: all]")
                .takes_value(true),
        )
        .arg(
            Arg::new("devices")
                .short('d')
                .value_name("LIST")
                .help("Select device(s), comma separated 1-based [default: all]")
                .takes_value(true),
        )
        .arg(
            Arg::new("device-type")
                .short('D')
                .value_name("TYPE")
                .help("Device type. 0: GPU, 1: CPU, 2: all [default: GPU]")
                .takes_value(true),
        )
        .arg(
            Arg::new("scheduler")
                .short('S')
                .value_name("TYPE")
                .help("Scheduler. 0: sequential, 1: asynchronous [default: 1]")
                .takes_value(true),
        )
        .arg(
            Arg::new("profile")
                .short('P')
                .value_name("0-10")
                .help("Force a compute profile [default: smallest common]")
                .takes_value(true),
        )
        .arg(
            Arg::new("force-device-verify")
                .short('F')
                .help("Verify candidate keys on the device instead of the host"),
        )
        .arg(
            Arg::new("queue")
                .short('Q')
                .value_name("TYPE")
                .help("Queue order. 0: forward, 1: reverse, 2: random [default: 0]")
                .takes_value(true),
        )
        .arg(
            Arg::new("show")
                .short('s')
                .help("List platforms and devices, then exit"),
        )
        .arg(Arg::new("verbose").short('V').help("Enable debug messages"))
        .arg(Arg::new("version").short('v').help("Show the version"))
        .arg(Arg::new("UID").index(1))
        .arg(Arg::new("NR1").index(2))
        .arg(Arg::new("AR1").index(3))
        .arg(Arg::new("NR2").index(4))
        .arg(Arg::new("AR2").index(5))
        .try_get_matches()
        .map_err(|e| Error::usage("arguments", e.to_string()))?;

    if matches.is_present("version") {
        println!("Version: {}", VERSION);
        return Ok(0);
    }

    let verbose = matches.is_present("verbose");
    utils::init_logging(verbose).ok();

    if matches.is_present("show") {
        let mut platforms = device::discover();
        let everything = device::DeviceSelection {
            platforms: None,
            devices: None,
            device_type: device::DeviceTypeFilter::All,
        };
        device::select(&mut platforms, &everything, None)?;
        device::list(&platforms);
        return Ok(0);
    }

    let selection = device::DeviceSelection {
        platforms: utils::parse_index_list("platforms", matches.value_of("platforms"))?,
        devices: utils::parse_index_list("devices", matches.value_of("devices"))?,
        device_type: match matches.value_of("device-type") {
            Some(v) => device::DeviceTypeFilter::from_flag(
                v.parse()
                    .map_err(|_| Error::usage("device type", v.to_string()))?,
            )?,
            None => device::DeviceTypeFilter::Gpu,
        },
    };

    let mode = match matches.value_of("scheduler") {
        Some(v) => SchedulerMode::from_flag(
            v.parse()
                .map_err(|_| Error::usage("scheduler", v.to_string()))?,
        )?,
        None => SchedulerMode::Async,
    };

    let queue_order = match matches.value_of("queue") {
        Some(v) => QueueOrder::from_flag(
            v.parse()
                .map_err(|_| Error::usage("queue order", v.to_string()))?,
        )?,
        None => QueueOrder::Forward,
    };

    let forced_profile = match matches.value_of("profile") {
        Some(v) => Some(
            v.parse()
                .map_err(|_| Error::usage("profile", v.to_string()))?,
        ),
        None => None,
    };

    let missing = |what: &'static str| Error::usage(what, "missing argument".to_string());
    let auth = AuthCapture {
        uid: utils::parse_hex32_rev("UID", matches.value_of("UID").ok_or_else(|| missing("UID"))?)?,
        nr1: utils::parse_hex32_rev("nR1", matches.value_of("NR1").ok_or_else(|| missing("nR1"))?)?,
        ar1: utils::parse_hex32_raw("aR1", matches.value_of("AR1").ok_or_else(|| missing("aR1"))?)?,
        nr2: utils::parse_hex32_rev("nR2", matches.value_of("NR2").ok_or_else(|| missing("nR2"))?)?,
        ar2: utils::parse_hex32_raw("aR2", matches.value_of("AR2").ok_or_else(|| missing("aR2"))?)?,
    };

    let opts = compute::SchedOptions {
        selection,
        mode,
        queue_order,
        forced_profile,
        verify_on_device: matches.is_present("force-device-verify"),
        verbose,
    };

    println!("Attack 5 - scheduled - start ({} order, {} scheduler)\n", queue_order, mode);
    let started = Instant::now();
    let outcome = compute::run_attack(&auth, &opts)?;
    let elapsed = started.elapsed();

    match outcome {
        Some(found) => {
            compute::report_key(&found);
            println!("\nAttack 5 - scheduled - end in {:.2} second(s)", elapsed.as_secs_f64());
            Ok(0)
        }
        None => {
            println!("\nKey not found :|");
            println!("\nAttack 5 - scheduled - end in {:.2} second(s)", elapsed.as_secs_f64());
            Ok(1)
        }
    }
}

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    }
}
