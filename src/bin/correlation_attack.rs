// src/bin/correlation_attack.rs
//
// Attack 4, after K. Sheldrake's implementation of the Garcia et al.
// fast correlation attack. Works from as few as 4 pairs; 16 is
// comfortable. Double the table size on failure and run again.

use std::path::PathBuf;
use std::process;

use clap::{App, Arg};

use hitag2_attack_toolkit::attacks::correlation::{self, CorrelationOptions};
use hitag2_attack_toolkit::error::Error;
use hitag2_attack_toolkit::nonces::{self, MAX_TRACES_CORRELATION};
use hitag2_attack_toolkit::utils;

fn run() -> Result<i32, Error> {
    let matches = App::new("correlation_attack")
        .about("Cracks a HiTag2 key from a small number of nR/aR pairs by fast correlation")
        .arg(
            Arg::new("uid")
                .short('u')
                .value_name("UID")
                .help("Transponder UID, 8 hex chars")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::new("noncefile")
                .short('n')
                .value_name("FILE")
                .help("File of '<nR> <aR>' lines")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::new("num-pairs")
                .short('N')
                .value_name("N")
                .help("Pairs to use (defaults to all loaded)")
                .takes_value(true),
        )
        .arg(
            Arg::new("table-size")
                .short('t')
                .value_name("SIZE")
                .help("Guess table size; larger is slower but more successful")
                .takes_value(true),
        )
        .arg(
            Arg::new("test-key")
                .short('T')
                .value_name("KEY")
                .help("Known key to track through the rounds")
                .takes_value(true),
        )
        .arg(
            Arg::new("threads")
                .short('j')
                .long("threads")
                .value_name("N")
                .takes_value(true),
        )
        .arg(Arg::new("verbose").short('V').long("verbose"))
        .try_get_matches()
        .map_err(|e| Error::usage("arguments", e.to_string()))?;

    utils::init_logging(matches.is_present("verbose")).ok();

    let uid = utils::parse_hex32_rev("UID", matches.value_of("uid").unwrap_or_default())?;
    let path = PathBuf::from(matches.value_of("noncefile").unwrap_or_default());
    let mut traces = nonces::load_traces(&path, MAX_TRACES_CORRELATION)?;
    println!("Loaded {} nR/aR pairs", traces.len());

    if let Some(v) = matches.value_of("num-pairs") {
        let n: usize = v
            .parse()
            .map_err(|_| Error::usage("num-pairs", v.to_string()))?;
        if n > 0 && n <= traces.len() {
            traces.truncate(n);
        }
    }
    println!("Using {} nR/aR pairs", traces.len());

    let mut opts = CorrelationOptions::default();
    if let Some(v) = matches.value_of("table-size") {
        opts.table_size = v
            .parse()
            .map_err(|_| Error::usage("table-size", v.to_string()))?;
    }
    if let Some(v) = matches.value_of("test-key") {
        opts.test_key = Some(utils::parse_key(v)?);
    }
    if let Some(v) = matches.value_of("threads") {
        opts.threads = v
            .parse()
            .map_err(|_| Error::usage("threads", v.to_string()))?;
    }

    match correlation::crack(uid, &traces, &opts)? {
        Some(key) => {
            println!("WIN!!! :)");
            println!("key = {}", utils::format_key(key));
            Ok(0)
        }
        None => {
            println!("FAIL :( - none of the potential keys in the table are correct.");
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
