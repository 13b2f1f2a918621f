// src/compute/scheduler.rs
//
// Thread engine driving one worker per compute device. Worker lifecycle:
//
//   Start -> Wait -> Processing -> { Wait | FoundKey | Error } -> End
//
// In sequential mode the main thread launches a batch of workers, joins
// them, inspects the results and repeats until the queue drains or a key
// appears. In async mode workers are long-lived: each parks on its own
// condition variable in Wait, the master releases one work unit at a
// time by flipping its status to Processing, and cancellation is
// cooperative through status and the quit flag. With a single worker a
// shared sleep condvar lets the master block between status checks
// instead of polling.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::attacks::state_recovery::{verify_candidate, AuthCapture};
use crate::compute::kernel::{KernelOutput, SliceKernel};
use crate::compute::queue::{PoppedUnit, QueueOrder, WorkQueue};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    Sequential,
    Async,
}

impl SchedulerMode {
    pub fn from_flag(v: u32) -> Result<Self> {
        match v {
            0 => Ok(SchedulerMode::Sequential),
            1 => Ok(SchedulerMode::Async),
            other => Err(Error::usage("scheduler", format!("{} (use 0 or 1)", other))),
        }
    }
}

impl fmt::Display for SchedulerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedulerMode::Sequential => "sequential",
            SchedulerMode::Async => "async",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum WorkerStatus {
    Start,
    Wait,
    Processing,
    Error,
    FoundKey,
    End,
}

#[derive(Debug)]
struct WorkerState {
    status: WorkerStatus,
    quit: bool,
    slice: u64,
    key: Option<u64>,
    error: Option<String>,
}

struct WorkerSlot {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

impl WorkerSlot {
    fn new() -> Self {
        WorkerSlot {
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Start,
                quit: false,
                slice: 0,
                key: None,
                error: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn status(&self) -> WorkerStatus {
        self.lock().status
    }

    fn quit_requested(&self) -> bool {
        self.lock().quit
    }

    /// Push a live worker towards End, waking it if it is parked.
    fn drive_end(&self) {
        let mut st = self.lock();
        if st.status < WorkerStatus::FoundKey {
            let was_waiting = st.status == WorkerStatus::Wait;
            st.status = WorkerStatus::End;
            st.quit = true;
            if was_waiting {
                self.cond.notify_one();
            }
        }
    }
}

/// Sleep channel for the single-worker async deployment.
struct CondSleep {
    mutex: Mutex<()>,
    cond: Condvar,
}

impl CondSleep {
    fn new() -> Self {
        CondSleep {
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let _guard = self.mutex.lock().unwrap_or_else(|p| p.into_inner());
        self.cond.notify_one();
    }

    fn sleep(&self) {
        let guard = self.mutex.lock().unwrap_or_else(|p| p.into_inner());
        // timed, the worker may signal before we get here
        let _ = self.cond.wait_timeout(guard, Duration::from_millis(50));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundKey {
    pub key: u64,
    pub worker: usize,
    pub slice: u64,
    pub max_slices: u64,
}

fn print_progress(z: usize, unit: &PoppedUnit, order: QueueOrder) {
    if order == QueueOrder::Random {
        let pct = 100.0 - ((unit.remaining + 1) as f64 * 100.0) / unit.max as f64;
        print!(
            "\r[{}] Slice {}/{} ({} remain) ( {:4.1}% )",
            z,
            unit.id + 1,
            unit.max,
            unit.remaining,
            pct
        );
    } else {
        let pct = (unit.id + 1) as f64 * 100.0 / unit.max as f64;
        print!("\r[{}] Slice {}/{} ( {:4.1}% )", z, unit.id + 1, unit.max, pct);
    }
    io::stdout().flush().ok();
}

/// Run the search to completion. Returns the key if any worker found
/// one, None when the queue drained without a hit.
pub fn run(
    kernel: &dyn SliceKernel,
    auth: &AuthCapture,
    workers: usize,
    mode: SchedulerMode,
    queue: &WorkQueue,
) -> Result<Option<FoundKey>> {
    if workers == 0 {
        return Err(Error::DeviceSetup("no workers to schedule".to_string()));
    }
    match mode {
        SchedulerMode::Sequential => run_sequential(kernel, auth, workers, queue),
        SchedulerMode::Async => run_async(kernel, auth, workers, queue),
    }
}

fn run_sequential(
    kernel: &dyn SliceKernel,
    auth: &AuthCapture,
    workers: usize,
    queue: &WorkQueue,
) -> Result<Option<FoundKey>> {
    let max_slices = kernel.unit_count();
    let found: Mutex<Option<FoundKey>> = Mutex::new(None);
    let failure: Mutex<Option<Error>> = Mutex::new(None);

    let mut launched = 0u64;
    while launched < max_slices {
        thread::scope(|s| {
            for z in 0..workers {
                let (found, failure) = (&found, &failure);
                s.spawn(move || {
                    let unit = match queue.pop() {
                        Some(u) => u,
                        None => return,
                    };
                    print_progress(z, &unit, queue.order());

                    match kernel.run(z, unit.off) {
                        Err(e) => {
                            let mut slot = failure.lock().unwrap_or_else(|p| p.into_inner());
                            slot.get_or_insert(Error::Runtime {
                                worker: z,
                                detail: e.to_string(),
                            });
                        }
                        Ok(out) => {
                            if let Some(key) = settle_output(out, auth) {
                                let mut slot = found.lock().unwrap_or_else(|p| p.into_inner());
                                slot.get_or_insert(FoundKey {
                                    key,
                                    worker: z,
                                    slice: unit.id + 1,
                                    max_slices,
                                });
                            }
                        }
                    }
                });
            }
        });

        if let Some(e) = failure.lock().unwrap_or_else(|p| p.into_inner()).take() {
            return Err(e);
        }
        if found.lock().unwrap_or_else(|p| p.into_inner()).is_some() {
            break;
        }
        launched += workers as u64;
    }

    Ok(found.into_inner().unwrap_or_else(|p| p.into_inner()))
}

/// Resolve a kernel output to a verified key, if any.
fn settle_output(out: KernelOutput, auth: &AuthCapture) -> Option<u64> {
    match out {
        KernelOutput::NoMatch => None,
        KernelOutput::Key(k) => Some(k),
        KernelOutput::States(states) => states
            .into_iter()
            .find_map(|s2| verify_candidate(s2, auth)),
    }
}

fn run_async(
    kernel: &dyn SliceKernel,
    auth: &AuthCapture,
    workers: usize,
    queue: &WorkQueue,
) -> Result<Option<FoundKey>> {
    let max_slices = kernel.unit_count();
    let slots: Vec<WorkerSlot> = (0..workers).map(|_| WorkerSlot::new()).collect();
    let condusleep = if workers == 1 {
        Some(CondSleep::new())
    } else {
        None
    };

    thread::scope(|s| {
        for (z, slot) in slots.iter().enumerate() {
            let cs = condusleep.as_ref();
            s.spawn(move || worker_async(kernel, auth, queue, slot, cs, z));
        }

        // master loop: inspect every worker, release or retire it
        let mut found = false;
        let mut done = false;
        while !done {
            let mut finished = 0usize;

            for slot in slots.iter() {
                let cur = slot.status();

                if found {
                    if cur < WorkerStatus::FoundKey {
                        slot.drive_end();
                    } else {
                        finished += 1;
                    }
                    continue;
                }

                match cur {
                    WorkerStatus::Wait => {
                        let mut st = slot.lock();
                        if st.status == WorkerStatus::Wait {
                            if queue.is_empty() {
                                st.status = WorkerStatus::End;
                                st.quit = true;
                            } else {
                                st.status = WorkerStatus::Processing;
                            }
                            slot.cond.notify_one();
                        }
                    }
                    WorkerStatus::Processing => {
                        if let Some(cs) = condusleep.as_ref() {
                            cs.sleep();
                            if slot.status() == WorkerStatus::FoundKey {
                                found = true;
                            }
                        }
                    }
                    WorkerStatus::Error => {
                        slot.drive_end();
                        finished += 1;
                    }
                    WorkerStatus::FoundKey | WorkerStatus::End => {
                        finished += 1;
                        if cur == WorkerStatus::FoundKey {
                            for other in slots.iter() {
                                other.drive_end();
                            }
                            found = true;
                            done = true;
                        }
                    }
                    WorkerStatus::Start => {}
                }
            }

            if finished == workers {
                done = true;
            }
            if !done {
                thread::yield_now();
            }
        }
    });

    let mut result = None;
    let mut error = None;
    for (z, slot) in slots.iter().enumerate() {
        let st = slot.lock();
        if let Some(key) = st.key {
            result.get_or_insert(FoundKey {
                key,
                worker: z,
                slice: st.slice,
                max_slices,
            });
        }
        if let Some(e) = &st.error {
            error.get_or_insert(Error::Runtime {
                worker: z,
                detail: e.clone(),
            });
        }
    }

    match (result, error) {
        (Some(found), _) => Ok(Some(found)),
        (None, Some(e)) => Err(e),
        (None, None) => Ok(None),
    }
}

fn worker_async(
    kernel: &dyn SliceKernel,
    auth: &AuthCapture,
    queue: &WorkQueue,
    slot: &WorkerSlot,
    cs: Option<&CondSleep>,
    z: usize,
) {
    let signal_cs = || {
        if let Some(cs) = cs {
            cs.signal();
        }
    };

    loop {
        // park until the master releases or retires us
        let status = {
            {
                let mut st = slot.lock();
                if st.status == WorkerStatus::End {
                    return;
                }
                st.status = WorkerStatus::Wait;
            }
            signal_cs();

            let mut st = slot.lock();
            while st.status == WorkerStatus::Wait {
                st = match slot.cond.wait(st) {
                    Ok(g) => g,
                    Err(p) => p.into_inner(),
                };
            }
            st.status
        };

        match status {
            WorkerStatus::Processing => {}
            WorkerStatus::End | WorkerStatus::Error => return,
            _ => return,
        }

        let unit = match queue.pop() {
            Some(u) => u,
            None => continue,
        };
        slot.lock().slice = unit.id + 1;
        print_progress(z, &unit, queue.order());

        match kernel.run(z, unit.off) {
            Err(e) => {
                {
                    let mut st = slot.lock();
                    st.status = WorkerStatus::Error;
                    st.error = Some(e.to_string());
                }
                signal_cs();
                return;
            }
            Ok(KernelOutput::Key(key)) => {
                {
                    let mut st = slot.lock();
                    st.status = WorkerStatus::FoundKey;
                    st.key = Some(key);
                    st.quit = true;
                }
                signal_cs();
                return;
            }
            Ok(KernelOutput::NoMatch) => {
                {
                    let mut st = slot.lock();
                    st.status = if st.quit || unit.id + 1 >= unit.max {
                        WorkerStatus::End
                    } else {
                        WorkerStatus::Wait
                    };
                }
                signal_cs();
                // the loop head retires us if that was End
                continue;
            }
            Ok(KernelOutput::States(states)) => {
                for s2 in states {
                    if slot.quit_requested() {
                        slot.lock().status = WorkerStatus::End;
                        signal_cs();
                        return;
                    }
                    if let Some(key) = verify_candidate(s2, auth) {
                        {
                            let mut st = slot.lock();
                            st.status = WorkerStatus::FoundKey;
                            st.key = Some(key);
                            st.quit = true;
                        }
                        signal_cs();
                        return;
                    }
                }
                if slot.quit_requested() {
                    slot.lock().status = WorkerStatus::End;
                    signal_cs();
                    return;
                }
                // nothing verified, go back to Wait
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct MockKernel {
        units: u64,
        chunk_bits: u64,
        key_at: Option<u64>,
        fail_at: Option<u64>,
    }

    impl SliceKernel for MockKernel {
        fn slice_len(&self) -> u64 {
            1 << self.chunk_bits
        }

        fn unit_count(&self) -> u64 {
            self.units
        }

        fn run(&self, _device: usize, off: u64) -> crate::error::Result<KernelOutput> {
            if Some(off) == self.fail_at {
                return Err(Error::Resource("mock kernel fault".to_string()));
            }
            if Some(off) == self.key_at {
                return Ok(KernelOutput::Key(0x4d4b_4559));
            }
            Ok(KernelOutput::NoMatch)
        }
    }

    fn auth_stub() -> AuthCapture {
        AuthCapture {
            uid: 0,
            nr1: 0,
            ar1: 0,
            nr2: 0,
            ar2: 0,
        }
    }

    fn filled_queue(kernel: &MockKernel, order: QueueOrder) -> WorkQueue {
        let q = WorkQueue::new(order);
        for step in 0..kernel.unit_count() {
            q.push(step, step << kernel.chunk_bits, kernel.unit_count());
        }
        q
    }

    #[test]
    fn async_finds_key_and_all_workers_retire() {
        let kernel = MockKernel {
            units: 64,
            chunk_bits: 4,
            key_at: Some(13 << 4),
            fail_at: None,
        };
        let queue = filled_queue(&kernel, QueueOrder::Forward);
        let found = run(&kernel, &auth_stub(), 4, SchedulerMode::Async, &queue)
            .unwrap()
            .expect("key expected");
        assert_eq!(found.key, 0x4d4b_4559);
        assert_eq!(found.slice, 14);
    }

    #[test]
    fn async_single_worker_uses_the_sleep_channel() {
        let kernel = MockKernel {
            units: 16,
            chunk_bits: 4,
            key_at: Some(7 << 4),
            fail_at: None,
        };
        let queue = filled_queue(&kernel, QueueOrder::Forward);
        let found = run(&kernel, &auth_stub(), 1, SchedulerMode::Async, &queue).unwrap();
        assert_eq!(found.map(|f| f.key), Some(0x4d4b_4559));
    }

    #[test]
    fn async_drains_queue_without_key() {
        let kernel = MockKernel {
            units: 32,
            chunk_bits: 4,
            key_at: None,
            fail_at: None,
        };
        let queue = filled_queue(&kernel, QueueOrder::Random);
        let found = run(&kernel, &auth_stub(), 3, SchedulerMode::Async, &queue).unwrap();
        assert!(found.is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn async_surfaces_kernel_failures() {
        let kernel = MockKernel {
            units: 8,
            chunk_bits: 4,
            key_at: None,
            fail_at: Some(3 << 4),
        };
        let queue = filled_queue(&kernel, QueueOrder::Forward);
        let err = run(&kernel, &auth_stub(), 2, SchedulerMode::Async, &queue).unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
    }

    #[test]
    fn sequential_agrees_with_async() {
        for workers in [1, 3] {
            let kernel = MockKernel {
                units: 24,
                chunk_bits: 4,
                key_at: Some(19 << 4),
                fail_at: None,
            };
            let queue = filled_queue(&kernel, QueueOrder::Forward);
            let found = run(&kernel, &auth_stub(), workers, SchedulerMode::Sequential, &queue)
                .unwrap()
                .expect("key expected");
            assert_eq!(found.key, 0x4d4b_4559);
        }
    }

    #[test]
    fn sequential_reports_failures() {
        let kernel = MockKernel {
            units: 8,
            chunk_bits: 4,
            key_at: None,
            fail_at: Some(0),
        };
        let queue = filled_queue(&kernel, QueueOrder::Forward);
        let err = run(&kernel, &auth_stub(), 2, SchedulerMode::Sequential, &queue).unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
    }
}
