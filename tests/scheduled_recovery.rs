// tests/scheduled_recovery.rs
//
// The attack 5 pipeline at test scale: a reduced layer-0 candidate list
// pushed through the work queue, the CPU slice kernel and both
// scheduler modes. All modes must agree on the recovered key.

use hitag2_attack_toolkit::attacks::state_recovery::{AuthCapture, EXPAND_MASK};
use hitag2_attack_toolkit::compute::kernel::{CpuSliceKernel, SliceKernel};
use hitag2_attack_toolkit::compute::queue::{QueueOrder, WorkQueue};
use hitag2_attack_toolkit::compute::scheduler::{self, SchedulerMode};
use hitag2_attack_toolkit::hitag2::{Hitag2State, MASK48};

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

/// Candidates: junk patterns plus the true layer-0 pattern somewhere in
/// the middle.
fn test_setup(seed: u64) -> (AuthCapture, Vec<u64>, u64) {
    let mut r = StdRng::seed_from_u64(seed);
    let key = r.gen::<u64>() & MASK48;
    let uid = r.gen::<u32>();
    let auth = capture(key, uid, r.gen(), r.gen());

    let s0 = Hitag2State::init(key, uid, auth.nr1).shiftreg;
    let mut candidates: Vec<u64> = (0..47).map(|_| r.gen::<u64>() & EXPAND_MASK).collect();
    candidates.insert(29, s0 & EXPAND_MASK);

    (auth, candidates, key)
}

#[test]
fn both_schedulers_recover_the_same_key() {
    let (auth, candidates, key) = test_setup(1001);

    for mode in [SchedulerMode::Sequential, SchedulerMode::Async] {
        let kernel = CpuSliceKernel::new(&auth, candidates.clone(), 2, false);
        let queue = WorkQueue::new(QueueOrder::Forward);
        let units = kernel.unit_count();
        for step in 0..units {
            queue.push(step, step << 2, units);
        }

        let found = scheduler::run(&kernel, &auth, 3, mode, &queue)
            .unwrap()
            .unwrap_or_else(|| panic!("{} scheduler missed the key", mode));
        assert_eq!(found.key, key, "{} scheduler", mode);
    }
}

#[test]
fn on_device_verification_agrees_with_host_verification() {
    let (auth, candidates, key) = test_setup(1002);

    let kernel = CpuSliceKernel::new(&auth, candidates, 3, true);
    let queue = WorkQueue::new(QueueOrder::Random);
    let units = kernel.unit_count();
    for step in 0..units {
        queue.push(step, step << 3, units);
    }

    let found = scheduler::run(&kernel, &auth, 2, SchedulerMode::Async, &queue)
        .unwrap()
        .expect("key expected");
    assert_eq!(found.key, key);
}

#[test]
fn empty_candidate_space_reports_no_key() {
    let (auth, mut candidates, _) = test_setup(1003);
    candidates.remove(29);

    let kernel = CpuSliceKernel::new(&auth, candidates, 2, false);
    let queue = WorkQueue::new(QueueOrder::Reverse);
    let units = kernel.unit_count();
    for step in 0..units {
        queue.push(step, step << 2, units);
    }

    let found = scheduler::run(&kernel, &auth, 2, SchedulerMode::Async, &queue).unwrap();
    assert!(found.is_none());
}
