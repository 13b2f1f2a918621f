// src/bin/state_recovery.rs
//
// Attack 5, CPU variant. Two captured authentications are enough: the
// first pins down the state search, the second verifies the candidate
// keys.

use std::process;

use clap::{App, Arg};

use hitag2_attack_toolkit::attacks::state_recovery::{self, AuthCapture};
use hitag2_attack_toolkit::error::Error;
use hitag2_attack_toolkit::utils;

fn run() -> Result<i32, Error> {
    let matches = App::new("state_recovery")
        .about("Bitsliced HiTag2 state recovery from two authentications")
        .arg(Arg::new("UID").required(true).index(1))
        .arg(Arg::new("NR1").required(true).index(2))
        .arg(Arg::new("AR1").required(true).index(3))
        .arg(Arg::new("NR2").required(true).index(4))
        .arg(Arg::new("AR2").required(true).index(5))
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

    let auth = AuthCapture {
        uid: utils::parse_hex32_rev("UID", matches.value_of("UID").unwrap_or_default())?,
        nr1: utils::parse_hex32_rev("nR1", matches.value_of("NR1").unwrap_or_default())?,
        ar1: utils::parse_hex32_raw("aR1", matches.value_of("AR1").unwrap_or_default())?,
        nr2: utils::parse_hex32_rev("nR2", matches.value_of("NR2").unwrap_or_default())?,
        ar2: utils::parse_hex32_raw("aR2", matches.value_of("AR2").unwrap_or_default())?,
    };

    let threads = match matches.value_of("threads") {
        Some(v) => v.parse().map_err(|_| Error::usage("threads", v.to_string()))?,
        None => num_cpus::get(),
    };

    match state_recovery::crack(&auth, threads)? {
        Some(key) => {
            println!("Key: {}", utils::format_key(key));
            Ok(0)
        }
        None => {
            println!("Key not found");
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
