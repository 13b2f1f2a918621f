// src/bin/build_table.rs
//
// Attack 2 table builder. Enumerates 2^37 PRNG states and writes the
// keystream-to-state table (about 1.2 TB), then sorts it in place.

use std::path::PathBuf;
use std::process;

use clap::{App, Arg};

use hitag2_attack_toolkit::attacks::table_build;
use hitag2_attack_toolkit::config::BuildConfig;
use hitag2_attack_toolkit::error::Error;
use hitag2_attack_toolkit::utils;
use hitag2_attack_toolkit::VERSION;

fn parse_args() -> Result<BuildConfig, Error> {
    let matches = App::new("build_table")
        .about("Builds and sorts the HiTag2 keystream lookup table")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON config file")
                .takes_value(true),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .value_name("N")
                .help("Builder threads (power of two)")
                .takes_value(true),
        )
        .arg(
            Arg::new("sort-threads")
                .short('s')
                .long("sort-threads")
                .value_name("N")
                .help("Sorter threads; reduce on slow disks")
                .takes_value(true),
        )
        .arg(
            Arg::new("bucket-capacity")
                .short('b')
                .long("bucket-capacity")
                .value_name("BYTES")
                .help("In-memory buffer per bucket")
                .takes_value(true),
        )
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .value_name("DIR")
                .help("Directory for table/ and sorted/")
                .takes_value(true),
        )
        .arg(
            Arg::new("verbose")
                .short('V')
                .long("verbose")
                .help("Enable debug logging"),
        )
        .try_get_matches()
        .map_err(|e| Error::usage("arguments", e.to_string()))?;

    utils::init_logging(matches.is_present("verbose")).ok();

    let mut cfg = match matches.value_of("config") {
        Some(path) => BuildConfig::load(&PathBuf::from(path))?,
        None => BuildConfig::default(),
    };

    if let Some(v) = matches.value_of("threads") {
        cfg.thread_count = v
            .parse()
            .map_err(|_| Error::usage("threads", v.to_string()))?;
    }
    if let Some(v) = matches.value_of("sort-threads") {
        cfg.sort_threads = v
            .parse()
            .map_err(|_| Error::usage("sort-threads", v.to_string()))?;
    }
    if let Some(v) = matches.value_of("bucket-capacity") {
        cfg.bucket_capacity = v
            .parse()
            .map_err(|_| Error::usage("bucket-capacity", v.to_string()))?;
    }
    if let Some(v) = matches.value_of("root") {
        cfg.root_dir = PathBuf::from(v);
    }

    cfg.validate()?;
    Ok(cfg)
}

fn main() {
    println!("build_table {} - HiTag2 TMTO table builder", VERSION);

    let cfg = match parse_args() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    };

    // an interrupted build cannot be resumed
    if ctrlc::set_handler(|| {
        eprintln!("\ninterrupted; the partial table is unusable, restart from scratch");
        process::exit(2);
    })
    .is_err()
    {
        eprintln!("warning: cannot install the interrupt handler");
    }

    if let Err(e) = table_build::build_table(&cfg) {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}
