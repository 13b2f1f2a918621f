// src/compute/queue.rs
//
// Work-unit queue feeding the attack 5 workers. A unit names one slice
// of the layer-0 candidate space. Pop order is selectable: FORWARD hands
// slices out in push order, REVERSE from the tail, RANDOM uniformly.
// Whatever the order, every pushed unit is popped exactly once.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    Forward,
    Reverse,
    Random,
}

impl QueueOrder {
    pub fn from_flag(v: u32) -> Result<Self, Error> {
        match v {
            0 => Ok(QueueOrder::Forward),
            1 => Ok(QueueOrder::Reverse),
            2 => Ok(QueueOrder::Random),
            other => Err(Error::usage("queue order", format!("{} (use 0, 1 or 2)", other))),
        }
    }
}

impl fmt::Display for QueueOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueOrder::Forward => "FORWARD",
            QueueOrder::Reverse => "REVERSE",
            QueueOrder::Random => "RANDOM",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkUnit {
    pub id: u64,
    pub off: u64,
    pub max: u64,
}

/// A popped unit also reports how many remain, for progress output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoppedUnit {
    pub id: u64,
    pub off: u64,
    pub max: u64,
    pub remaining: u64,
}

struct Inner {
    items: VecDeque<WorkUnit>,
    rng: StdRng,
}

/// All operations serialize on one mutex; pops are cheap next to a
/// kernel run, so the lock is uncontended in steady state.
pub struct WorkQueue {
    order: QueueOrder,
    inner: Mutex<Inner>,
}

impl WorkQueue {
    pub fn new(order: QueueOrder) -> Self {
        WorkQueue {
            order,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                rng: StdRng::from_entropy(),
            }),
        }
    }

    pub fn order(&self) -> QueueOrder {
        self.order
    }

    pub fn push(&self, id: u64, off: u64, max: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.items.push_back(WorkUnit { id, off, max });
    }

    /// Take the next unit, or None once the queue is drained.
    pub fn pop(&self) -> Option<PoppedUnit> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.items.is_empty() {
            return None;
        }

        let unit = match self.order {
            QueueOrder::Forward => inner.items.pop_front(),
            QueueOrder::Reverse => inner.items.pop_back(),
            QueueOrder::Random => {
                let len = inner.items.len();
                let idx = inner.rng.gen_range(0..len);
                inner.items.swap_remove_back(idx)
            }
        }?;

        Some(PoppedUnit {
            id: unit.id,
            off: unit.off,
            max: unit.max,
            remaining: inner.items.len() as u64,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .items
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .items
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn drain_ids(q: &WorkQueue) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Some(u) = q.pop() {
            ids.push(u.id);
        }
        ids
    }

    #[test]
    fn every_order_yields_each_unit_exactly_once() {
        for order in [QueueOrder::Forward, QueueOrder::Reverse, QueueOrder::Random] {
            let q = WorkQueue::new(order);
            let n = 4096u64;
            for id in 0..n {
                q.push(id, id << 7, n);
            }
            assert_eq!(q.len(), n as usize);

            let ids = drain_ids(&q);
            assert_eq!(ids.len() as u64, n, "{} lost units", order);
            let distinct: HashSet<u64> = ids.iter().copied().collect();
            assert_eq!(distinct.len() as u64, n, "{} duplicated units", order);
            assert!(q.pop().is_none());
            assert!(q.is_empty());
        }
    }

    #[test]
    fn forward_and_reverse_are_ordered() {
        let fw = WorkQueue::new(QueueOrder::Forward);
        let rv = WorkQueue::new(QueueOrder::Reverse);
        for id in 0..100 {
            fw.push(id, 0, 100);
            rv.push(id, 0, 100);
        }
        assert_eq!(drain_ids(&fw), (0..100).collect::<Vec<_>>());
        assert_eq!(drain_ids(&rv), (0..100).rev().collect::<Vec<_>>());
    }

    #[test]
    fn remaining_counts_down() {
        let q = WorkQueue::new(QueueOrder::Forward);
        for id in 0..10 {
            q.push(id, 0, 10);
        }
        for expected in (0..10).rev() {
            assert_eq!(q.pop().unwrap().remaining, expected);
        }
    }

    #[test]
    fn concurrent_pops_do_not_lose_units() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let q = WorkQueue::new(QueueOrder::Random);
        let n = 10_000u64;
        for id in 0..n {
            q.push(id, 0, n);
        }

        let sum = AtomicU64::new(0);
        let count = AtomicU64::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                let (q, sum, count) = (&q, &sum, &count);
                s.spawn(move || {
                    while let Some(u) = q.pop() {
                        sum.fetch_add(u.id, Ordering::Relaxed);
                        count.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(count.load(Ordering::Relaxed), n);
        assert_eq!(sum.load(Ordering::Relaxed), n * (n - 1) / 2);
    }
}
