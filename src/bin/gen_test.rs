// src/bin/gen_test.rs
//
// Test-vector generator. Writes keystream dump files for exercising the
// table search, and nR/aR pair files for the partial-key and
// correlation attacks.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;

use clap::{App, Arg};
use rand::Rng;

use hitag2_attack_toolkit::attacks::table_search::keystream_file_name;
use hitag2_attack_toolkit::error::Error;
use hitag2_attack_toolkit::hitag2::{Hitag2State, MASK48};
use hitag2_attack_toolkit::utils;

fn write_keystream_file(key: u64, uid: u32, enc_nr: u32) -> Result<PathBuf, Error> {
    let key_hex = utils::format_key(key);
    let uid_hex = format!("{:08X}", uid.reverse_bits());
    let nr_hex = format!("{:08X}", enc_nr.reverse_bits());
    let path = keystream_file_name(&key_hex, &uid_hex, &nr_hex);

    let f = File::create(&path).map_err(|e| Error::io(&path, e))?;
    let mut w = BufWriter::new(f);

    let mut st = Hitag2State::init(key, uid, enc_nr);
    // skip the authentication response and its trailer
    st.nstep(64);
    for _ in 0..64 {
        writeln!(w, "{:08X}", st.nstep(32)).map_err(|e| Error::io(&path, e))?;
    }
    w.flush().map_err(|e| Error::io(&path, e))?;
    Ok(path)
}

fn write_pair_file(path: &PathBuf, key: u64, uid: u32, count: usize) -> Result<(), Error> {
    let f = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut w = BufWriter::new(f);
    let mut rng = rand::thread_rng();

    for _ in 0..count {
        let enc_nr_msb: u32 = rng.gen();
        let enc_nr = enc_nr_msb.reverse_bits();
        let ar_msb = !Hitag2State::init(key, uid, enc_nr).nstep(32);
        writeln!(w, "{:08X} {:08X}", enc_nr_msb, ar_msb).map_err(|e| Error::io(path, e))?;
    }
    w.flush().map_err(|e| Error::io(path, e))
}

fn run() -> Result<i32, Error> {
    let matches = App::new("gen_test")
        .about("Generates keystream dumps and nR/aR pair files for known random keys")
        .arg(
            Arg::new("COUNT")
                .help("Number of keystream files to generate")
                .index(1),
        )
        .arg(
            Arg::new("pairs")
                .short('p')
                .long("pairs")
                .value_name("N")
                .help("Also write a pair file with N entries")
                .takes_value(true),
        )
        .arg(
            Arg::new("pairfile")
                .short('o')
                .long("pairfile")
                .value_name("FILE")
                .help("Pair file name [default: nrar.txt]")
                .takes_value(true),
        )
        .arg(
            Arg::new("key")
                .short('K')
                .long("key")
                .value_name("KEY")
                .help("Use this key instead of a random one")
                .takes_value(true),
        )
        .arg(
            Arg::new("uid")
                .short('u')
                .long("uid")
                .value_name("UID")
                .help("Use this UID instead of a random one")
                .takes_value(true),
        )
        .try_get_matches()
        .map_err(|e| Error::usage("arguments", e.to_string()))?;

    let mut rng = rand::thread_rng();

    let count: usize = match matches.value_of("COUNT") {
        Some(v) => v.parse().map_err(|_| Error::usage("count", v.to_string()))?,
        None => 0,
    };
    let pairs: usize = match matches.value_of("pairs") {
        Some(v) => v.parse().map_err(|_| Error::usage("pairs", v.to_string()))?,
        None => 0,
    };
    if count == 0 && pairs == 0 {
        return Err(Error::usage("count", "nothing to generate".to_string()));
    }

    for _ in 0..count {
        let key = rng.gen::<u64>() & MASK48;
        let uid: u32 = rng.gen();
        let enc_nr: u32 = rng.gen();
        let path = write_keystream_file(key, uid, enc_nr)?;
        println!("wrote {}", path.display());
    }

    if pairs > 0 {
        let key = match matches.value_of("key") {
            Some(v) => utils::parse_key(v)?,
            None => rng.gen::<u64>() & MASK48,
        };
        let uid = match matches.value_of("uid") {
            Some(v) => utils::parse_hex32_rev("UID", v)?,
            None => rng.gen(),
        };
        let path = PathBuf::from(matches.value_of("pairfile").unwrap_or("nrar.txt"));
        write_pair_file(&path, key, uid, pairs)?;
        println!(
            "wrote {} pairs to {} (key {}, uid {:08X})",
            pairs,
            path.display(),
            utils::format_key(key),
            uid.reverse_bits()
        );
    }

    Ok(0)
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
