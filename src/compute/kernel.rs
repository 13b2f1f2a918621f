// src/compute/kernel.rs
//
// The slice-kernel seam between the scheduler and a compute backend.
// A kernel consumes one work unit (a contiguous run of layer-0
// candidates) and reports either surviving states for the worker to
// verify, or, when verification runs on the device itself, the key.

use crate::attacks::state_recovery::{verify_candidate, AuthCapture, LayeredSearch};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelOutput {
    NoMatch,
    /// Surviving registers, two steps past init, for host verification.
    States(Vec<u64>),
    /// Verified on the device; at most one key can survive.
    Key(u64),
}

pub trait SliceKernel: Send + Sync {
    /// Candidates consumed per work unit.
    fn slice_len(&self) -> u64;

    /// Work units needed to cover the whole candidate space.
    fn unit_count(&self) -> u64;

    /// Run one slice starting at candidate `off`.
    fn run(&self, device_index: usize, off: u64) -> Result<KernelOutput>;
}

/// The portable backend: the bitsliced layered search run on the host.
pub struct CpuSliceKernel {
    auth: AuthCapture,
    candidates: Vec<u64>,
    search: LayeredSearch,
    chunk_bits: u64,
    verify_on_device: bool,
}

impl CpuSliceKernel {
    pub fn new(
        auth: &AuthCapture,
        candidates: Vec<u64>,
        chunk_bits: u64,
        verify_on_device: bool,
    ) -> Self {
        CpuSliceKernel {
            auth: *auth,
            search: LayeredSearch::new(auth.ar1),
            candidates,
            chunk_bits,
            verify_on_device,
        }
    }

    pub fn candidate_count(&self) -> u64 {
        self.candidates.len() as u64
    }
}

impl SliceKernel for CpuSliceKernel {
    fn slice_len(&self) -> u64 {
        1 << self.chunk_bits
    }

    fn unit_count(&self) -> u64 {
        (self.candidate_count() + self.slice_len() - 1) / self.slice_len()
    }

    fn run(&self, _device_index: usize, off: u64) -> Result<KernelOutput> {
        let start = off.min(self.candidate_count()) as usize;
        let end = (off + self.slice_len()).min(self.candidate_count()) as usize;

        let mut states = Vec::new();
        let mut key = None;

        for &cand in &self.candidates[start..end] {
            self.search.search_candidate(cand, &mut |s2| {
                if self.verify_on_device {
                    if key.is_none() {
                        key = verify_candidate(s2, &self.auth);
                    }
                } else {
                    states.push(s2);
                }
            });
            if key.is_some() {
                break;
            }
        }

        if let Some(k) = key {
            return Ok(KernelOutput::Key(k));
        }
        if states.is_empty() {
            Ok(KernelOutput::NoMatch)
        } else {
            Ok(KernelOutput::States(states))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attacks::state_recovery::EXPAND_MASK;
    use crate::hitag2::{Hitag2State, MASK48};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn capture(key: u64, uid: u32, nr1: u32, nr2: u32) -> AuthCapture {
        AuthCapture {
            uid,
            nr1,
            ar1: !Hitag2State::init(key, uid, nr1).nstep(32),
            nr2,
            ar2: !Hitag2State::init(key, uid, nr2).nstep(32),
        }
    }

    fn tiny_kernel(verify_on_device: bool) -> (CpuSliceKernel, u64) {
        let mut r = StdRng::seed_from_u64(31);
        let key = r.gen::<u64>() & MASK48;
        let uid = r.gen::<u32>();
        let auth = capture(key, uid, r.gen(), r.gen());

        // a handful of junk candidates plus the true one
        let s0 = Hitag2State::init(key, uid, auth.nr1).shiftreg;
        let mut candidates: Vec<u64> = (0..7).map(|_| r.gen::<u64>() & EXPAND_MASK).collect();
        candidates.push(s0 & EXPAND_MASK);

        (CpuSliceKernel::new(&auth, candidates, 2, verify_on_device), key)
    }

    #[test]
    fn unit_count_covers_every_candidate() {
        let (kernel, _) = tiny_kernel(false);
        assert_eq!(kernel.slice_len(), 4);
        assert_eq!(kernel.unit_count(), 2);
    }

    #[test]
    fn host_verification_mode_returns_states() {
        let (kernel, key) = tiny_kernel(false);
        let auth = kernel.auth;

        let mut recovered = None;
        for unit in 0..kernel.unit_count() {
            if let KernelOutput::States(states) = kernel.run(0, unit * kernel.slice_len()).unwrap()
            {
                for s2 in states {
                    if let Some(k) = verify_candidate(s2, &auth) {
                        recovered = Some(k);
                    }
                }
            }
        }
        assert_eq!(recovered, Some(key));
    }

    #[test]
    fn device_verification_mode_returns_the_key() {
        let (kernel, key) = tiny_kernel(true);

        let mut outputs = Vec::new();
        for unit in 0..kernel.unit_count() {
            outputs.push(kernel.run(0, unit * kernel.slice_len()).unwrap());
        }
        assert!(outputs.contains(&KernelOutput::Key(key)));
    }
}
