/// This is a Rust implementation of the HiTag2 stream cipher used in
/// contactless transponders, based on the C implementation from the
/// Proxmark3 project and the RFIDler reference code.
///
/// The cipher is a 48-bit shift register with a nonlinear output filter.
/// Internally everything is LSB-first: bit 0 of the register is the next
/// bit to fall out, new bits enter at bit 47. Values that cross the I/O
/// boundary (keys, UIDs, nonces in hex) are bit-reversed relative to this
/// convention; see `utils` for the parsers.

/// Boolean tables for the three filter sub-functions.
pub const FA: u32 = 0x2C79; // 0010 1100 0111 1001
pub const FB: u32 = 0x6671; // 0110 0110 0111 0001
pub const FC: u32 = 0x7907287B; // 0111 1001 0000 0111 0010 1000 0111 1011

/// Positions of FC that give the same output whether the top index bit
/// (the fa nibble of state bits 34..46) is 0 or 1. Attack 3 keys off this.
pub const FP: u32 = 0xAE83;

/// Forward feedback taps {0,2,3,6,7,8,16,22,23,26,30,41,42,43,46,47}.
pub const TAPS: u64 = 0xCE00_44C1_01CD;

/// Inverse feedback taps, used to run the register backwards.
pub const INV_TAPS: u64 = (TAPS >> 1) | (1 << 47);

/// Twin-register update constant for the fast n-step path.
const LFSR_TWIN_STEP: u64 = 0xB380_8322_0073;

pub const MASK48: u64 = 0xFFFF_FFFF_FFFF;

#[inline]
fn bit(x: u64, n: u32) -> u32 {
    ((x >> n) & 1) as u32
}

#[inline]
fn fa(i: u32) -> u32 {
    (FA >> i) & 1
}

#[inline]
fn fb(i: u32) -> u32 {
    (FB >> i) & 1
}

#[inline]
fn fc(i: u32) -> u32 {
    (FC >> i) & 1
}

/// The filter function on the pre-shifted register (the form used in the
/// academic description): one output bit from twenty state bits.
#[inline]
pub fn filter(s: u64) -> u32 {
    let x1 = bit(s, 2) | (bit(s, 3) << 1) | (bit(s, 5) << 2) | (bit(s, 6) << 3);
    let x2 = bit(s, 8) | (bit(s, 12) << 1) | (bit(s, 14) << 2) | (bit(s, 15) << 3);
    let x3 = bit(s, 17) | (bit(s, 21) << 1) | (bit(s, 23) << 2) | (bit(s, 26) << 3);
    let x4 = bit(s, 28) | (bit(s, 29) << 1) | (bit(s, 31) << 2) | (bit(s, 33) << 3);
    let x5 = bit(s, 34) | (bit(s, 43) << 1) | (bit(s, 44) << 2) | (bit(s, 46) << 3);

    let x6 = fa(x1) | (fb(x2) << 1) | (fb(x3) << 2) | (fb(x4) << 3) | (fa(x5) << 4);
    fc(x6)
}

/// The same filter on the post-shifted register (the form used in the
/// reference implementation); `filter_post(s >> 1) == filter(s)`.
#[inline]
pub fn filter_post(s: u64) -> u32 {
    let x1 = bit(s, 1) | (bit(s, 2) << 1) | (bit(s, 4) << 2) | (bit(s, 5) << 3);
    let x2 = bit(s, 7) | (bit(s, 11) << 1) | (bit(s, 13) << 2) | (bit(s, 14) << 3);
    let x3 = bit(s, 16) | (bit(s, 20) << 1) | (bit(s, 22) << 2) | (bit(s, 25) << 3);
    let x4 = bit(s, 27) | (bit(s, 28) << 1) | (bit(s, 30) << 2) | (bit(s, 32) << 3);
    let x5 = bit(s, 33) | (bit(s, 42) << 1) | (bit(s, 43) << 2) | (bit(s, 45) << 3);

    let x6 = fa(x1) | (fb(x2) << 1) | (fb(x3) << 2) | (fb(x4) << 3) | (fa(x5) << 4);
    fc(x6)
}

/// Squash the twenty filter input bits of a pre-shifted state into one
/// 20-bit value, nibble by nibble.
#[inline]
pub fn pack_state(s: u64) -> u32 {
    let x1 = bit(s, 2) | (bit(s, 3) << 1) | (bit(s, 5) << 2) | (bit(s, 6) << 3);
    let x2 = bit(s, 8) | (bit(s, 12) << 1) | (bit(s, 14) << 2) | (bit(s, 15) << 3);
    let x3 = bit(s, 17) | (bit(s, 21) << 1) | (bit(s, 23) << 2) | (bit(s, 26) << 3);
    let x4 = bit(s, 28) | (bit(s, 29) << 1) | (bit(s, 31) << 2) | (bit(s, 33) << 3);
    let x5 = bit(s, 34) | (bit(s, 43) << 1) | (bit(s, 44) << 2) | (bit(s, 46) << 3);

    x1 | (x2 << 4) | (x3 << 8) | (x4 << 12) | (x5 << 16)
}

/// The filter on the packed 20-bit form produced by `pack_state`.
#[inline]
pub fn f20(packed: u32) -> u32 {
    let x6 = fa(packed & 0xf)
        | (fb((packed >> 4) & 0xf) << 1)
        | (fb((packed >> 8) & 0xf) << 2)
        | (fb((packed >> 12) & 0xf) << 3)
        | (fa((packed >> 16) & 0xf) << 4);
    fc(x6)
}

/// True when the filter output for this 34-bit register prefix does not
/// depend on the 14 unknown high bits (the fa nibble of bits 34..46).
#[inline]
pub fn filter_prefix_determined(prefix: u64) -> bool {
    let x1 = bit(prefix, 2) | (bit(prefix, 3) << 1) | (bit(prefix, 5) << 2) | (bit(prefix, 6) << 3);
    let x2 = bit(prefix, 8) | (bit(prefix, 12) << 1) | (bit(prefix, 14) << 2) | (bit(prefix, 15) << 3);
    let x3 =
        bit(prefix, 17) | (bit(prefix, 21) << 1) | (bit(prefix, 23) << 2) | (bit(prefix, 26) << 3);
    let x4 =
        bit(prefix, 28) | (bit(prefix, 29) << 1) | (bit(prefix, 31) << 2) | (bit(prefix, 33) << 3);

    let i = fa(x1) | (fb(x2) << 1) | (fb(x3) << 2) | (fb(x4) << 3);
    (FP >> i) & 1 == 1
}

/// Forward feedback bit for a state.
#[inline]
pub fn lfsr_feedback(s: u64) -> u64 {
    ((s & TAPS).count_ones() & 1) as u64
}

/// Bit shifted out by the inverse register; feeding it back in at bit 0
/// while shifting left undoes one forward step.
#[inline]
pub fn inverse_feedback(s: u64) -> u64 {
    ((s & INV_TAPS).count_ones() & 1) as u64
}

/// The PRNG state
///
/// `shiftreg` is the authoritative 48-bit register. `lfsr` is a linear
/// recombination of it that makes the n-step advance a shift and a
/// conditional XOR instead of a 16-tap parity per step; bit i of `lfsr` is
/// the feedback the register will produce after i further shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hitag2State {
    pub shiftreg: u64,
    lfsr: u64,
}

impl Hitag2State {
    /// Wrap a raw 48-bit register value.
    pub fn from_state(shiftreg: u64) -> Self {
        let mut s = Hitag2State {
            shiftreg: shiftreg & MASK48,
            lfsr: 0,
        };
        s.rebuild_lfsr();
        s
    }

    /// Initialize the cipher from key, transponder UID and reader nonce.
    ///
    /// The register is loaded with the low 16 key bits over the UID, then
    /// 32 bits of `key_high ^ nonce ^ filter(S)` are shifted in. The bits
    /// emitted by the filter during this phase are the same bits that
    /// encrypt the nonce on the air.
    pub fn init(key: u64, uid: u32, nonce: u32) -> Self {
        let mut s = ((key & 0xffff) << 32) | uid as u64;
        let stream = (key >> 16) as u32 ^ nonce;

        for i in 0..32 {
            let inject = ((stream >> i) & 1) as u64 ^ filter(s) as u64;
            s = (s >> 1) | (inject << 47);
        }

        Hitag2State::from_state(s)
    }

    fn rebuild_lfsr(&mut self) {
        let mut l = 0u64;
        for i in 0..48 {
            l |= lfsr_feedback(self.shiftreg >> i) << i;
        }
        self.lfsr = l;
    }

    /// Advance one step and return the emitted keystream bit.
    #[inline]
    pub fn step(&mut self) -> u32 {
        let out = filter(self.shiftreg);
        if self.lfsr & 1 == 1 {
            self.shiftreg = (self.shiftreg >> 1) | (1 << 47);
            self.lfsr = (self.lfsr >> 1) ^ LFSR_TWIN_STEP;
        } else {
            self.shiftreg >>= 1;
            self.lfsr >>= 1;
        }
        out
    }

    /// Advance `steps` steps and return the keystream, first bit in the
    /// most significant position. Only the last 32 bits are kept when
    /// `steps` exceeds 32.
    pub fn nstep(&mut self, steps: u32) -> u32 {
        let mut out = 0u32;
        for _ in 0..steps {
            out = (out << 1) | self.step();
        }
        out
    }

    /// Run the register backwards.
    pub fn rollback(&mut self, steps: u32) {
        for _ in 0..steps {
            self.shiftreg = ((self.shiftreg << 1) & MASK48) | inverse_feedback(self.shiftreg);
        }
        self.rebuild_lfsr();
    }
}

/// Invert the initialisation protocol. Given the register as it stood
/// right after `init`, the UID, and the encrypted reader nonce, rebuild
/// the key: the low 16 key bits sit in the low 16 state bits, and the
/// upper 32 are `state_high ^ enc_nR ^ b` where `b` are the filter bits
/// observed while shifting the UID back in.
pub fn recover_key(state_after_init: u64, uid: u32, enc_nr: u32) -> u64 {
    let mut s = state_after_init & MASK48;
    let key_low = s & 0xffff;
    let nr_xor_key = (s >> 16) & 0xffff_ffff;

    let mut b: u32 = 0;
    for i in 0..32 {
        s = ((s << 1) | ((uid >> (31 - i)) & 1) as u64) & MASK48;
        b = (b << 1) | filter(s);
    }

    key_low | ((nr_xor_key ^ enc_nr as u64 ^ b as u64) << 16)
}

/// Replay a candidate key against one authentication pair. `ar` is the raw
/// (MSB-first) response word; the keystream XOR response must come out as
/// all ones because the transmitted response is the complement of the
/// expected value.
pub fn verify_key(key: u64, uid: u32, enc_nr: u32, ar: u32) -> bool {
    let mut state = Hitag2State::init(key, uid, enc_nr);
    ar ^ state.nstep(32) == 0xFFFF_FFFF
}

/// Candidate check used by the state-recovery attacks: `state_after_init`
/// yields a key via the UID and first encrypted nonce, and the key stands
/// only if it also explains the second pair.
pub fn try_state(
    state_after_init: u64,
    uid: u32,
    enc_nr1: u32,
    enc_nr2: u32,
    ar2: u32,
) -> Option<u64> {
    let key = recover_key(state_after_init, uid, enc_nr1);
    if verify_key(key, uid, enc_nr2, ar2) {
        Some(key)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x48697461_6732)
    }

    #[test]
    fn filter_conventions_agree() {
        let mut r = rng();
        for _ in 0..1000 {
            let s = r.gen::<u64>() & MASK48;
            assert_eq!(filter(s), filter_post(s >> 1));
            assert_eq!(filter(s), f20(pack_state(s)));
        }
    }

    #[test]
    fn twin_register_tracks_feedback() {
        let mut r = rng();
        for _ in 0..100 {
            let mut st = Hitag2State::from_state(r.gen::<u64>() & MASK48);
            for _ in 0..96 {
                assert_eq!(st.lfsr & 1, lfsr_feedback(st.shiftreg));
                st.step();
            }
        }
    }

    #[test]
    fn rollback_undoes_step() {
        let mut r = rng();
        for _ in 0..200 {
            let start = Hitag2State::from_state(r.gen::<u64>() & MASK48);
            let mut st = start;
            st.nstep(17);
            st.rollback(17);
            assert_eq!(st, start);
        }
    }

    #[test]
    fn init_inversion_recovers_key() {
        let mut r = rng();
        for _ in 0..200 {
            let key = r.gen::<u64>() & MASK48;
            let uid = r.gen::<u32>();
            let enc_nr = r.gen::<u32>();
            let state = Hitag2State::init(key, uid, enc_nr);
            assert_eq!(recover_key(state.shiftreg, uid, enc_nr), key);
        }
    }

    #[test]
    fn verifier_accepts_true_key_only() {
        let mut r = rng();
        for _ in 0..20 {
            let key = r.gen::<u64>() & MASK48;
            let uid = r.gen::<u32>();
            let enc_nr = r.gen::<u32>();
            let ks = Hitag2State::init(key, uid, enc_nr).nstep(32);
            let ar = !ks;

            assert!(verify_key(key, uid, enc_nr, ar));
            for flip in [0u32, 7, 23, 40, 47] {
                assert!(!verify_key(key ^ (1u64 << flip), uid, enc_nr, ar));
            }
        }
    }

    #[test]
    fn try_state_round_trip() {
        let mut r = rng();
        let key = r.gen::<u64>() & MASK48;
        let uid = r.gen::<u32>();
        let (nr1, nr2) = (r.gen::<u32>(), r.gen::<u32>());
        let ar2 = !Hitag2State::init(key, uid, nr2).nstep(32);

        let state = Hitag2State::init(key, uid, nr1);
        assert_eq!(try_state(state.shiftreg, uid, nr1, nr2, ar2), Some(key));
        assert_eq!(try_state(state.shiftreg ^ 1, uid, nr1, nr2, ar2), None);
    }

    #[test]
    fn prefix_determined_means_high_bits_ignored() {
        let mut r = rng();
        let mut seen = 0;
        while seen < 40 {
            let prefix = r.gen::<u64>() & ((1u64 << 34) - 1);
            if !filter_prefix_determined(prefix) {
                continue;
            }
            seen += 1;
            let reference = filter(prefix);
            for x in 0..(1u64 << 14) {
                assert_eq!(filter(prefix | (x << 34)), reference);
            }
        }
    }
}
