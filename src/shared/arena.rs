use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::linestats::LineCounter;

/// One shared per-line counter slot.
///
/// Fields are independent atomics so that sessions holding only the
/// shared table lock can fold their counters in concurrently. Sums use
/// plain adds, the maximum uses a CAS loop.
#[derive(Debug, Default)]
pub struct SharedLineSlot {
    exec_count: AtomicU64,
    total_time: AtomicU64,
    max_time: AtomicU64,
}

impl SharedLineSlot {
    /// Fold a local counter into this slot.
    pub fn add(&self, counter: &LineCounter) {
        self.exec_count
            .fetch_add(counter.exec_count, Ordering::Relaxed);
        self.total_time
            .fetch_add(counter.total_time, Ordering::Relaxed);

        // CAS loop for max.
        loop {
            let old_max = self.max_time.load(Ordering::Relaxed);
            if counter.max_time <= old_max {
                break;
            }
            if self
                .max_time
                .compare_exchange_weak(
                    old_max,
                    counter.max_time,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }

    /// Point-in-time view of the slot.
    pub fn load(&self) -> LineCounter {
        LineCounter {
            exec_count: self.exec_count.load(Ordering::Relaxed),
            total_time: self.total_time.load(Ordering::Relaxed),
            max_time: self.max_time.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.exec_count.store(0, Ordering::Relaxed);
        self.total_time.store(0, Ordering::Relaxed);
        self.max_time.store(0, Ordering::Relaxed);
    }
}

/// Fixed pool of shared line-counter slots.
///
/// Allocated once at startup and assigned to functions by a free-running
/// cursor kept in the shared tables; slots are never handed back. Every
/// reference into the arena is an index, never an address.
#[derive(Debug)]
pub struct LineSlotArena {
    slots: Box<[SharedLineSlot]>,
}

impl LineSlotArena {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, SharedLineSlot::default);
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &SharedLineSlot {
        &self.slots[index]
    }

    /// Zero a slot range before handing it to a new entry. Called under
    /// the exclusive table lock, so no merge can race the reset.
    pub fn reset_range(&self, first: usize, count: usize) {
        for slot in &self.slots[first..first + count] {
            slot.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_add_accumulates_and_tracks_max() {
        let slot = SharedLineSlot::default();
        slot.add(&LineCounter {
            exec_count: 3,
            total_time: 60,
            max_time: 30,
        });
        slot.add(&LineCounter {
            exec_count: 2,
            total_time: 40,
            max_time: 25,
        });

        let counter = slot.load();
        assert_eq!(counter.exec_count, 5);
        assert_eq!(counter.total_time, 100);
        assert_eq!(counter.max_time, 30);
    }

    #[test]
    fn test_reset_range_zeroes_reused_slots() {
        let arena = LineSlotArena::new(4);
        arena.slot(1).add(&LineCounter {
            exec_count: 1,
            total_time: 10,
            max_time: 10,
        });

        arena.reset_range(0, 3);
        assert!(arena.slot(1).load().is_zero());
    }

    #[test]
    fn test_concurrent_adds_converge() {
        let arena = Arc::new(LineSlotArena::new(1));
        let mut handles = Vec::new();

        for t in 0..4u64 {
            let arena = Arc::clone(&arena);
            handles.push(thread::spawn(move || {
                for i in 0..1000u64 {
                    arena.slot(0).add(&LineCounter {
                        exec_count: 1,
                        total_time: 2,
                        max_time: t * 1000 + i,
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        let counter = arena.slot(0).load();
        assert_eq!(counter.exec_count, 4000);
        assert_eq!(counter.total_time, 8000);
        assert_eq!(counter.max_time, 3999);
    }
}
