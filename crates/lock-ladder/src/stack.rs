//! The per-thread acquisition stack.
//!
//! Each thread tracks the ordered list of locks it currently holds as
//! (lock, level, recursion count) triples. The three checkpoints —
//! [`LadderToken::acquiring`], [`LadderToken::acquired`],
//! [`LadderToken::released`] — are called by [`OrderedMutex`](crate::OrderedMutex)
//! around the underlying mutex operations, and can be driven directly with
//! synthetic tokens when testing the checker itself (a real re-entrant
//! acquire of a `std::sync::Mutex` would deadlock the test).

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::level::LockLevel;
use crate::report::{report, Violation};

thread_local! {
    static LOCK_STACK: RefCell<Vec<Held>> = const { RefCell::new(Vec::new()) };
}

struct Held {
    id: usize,
    level: LockLevel,
    name: &'static str,
    recursion: u32,
}

/// Identifies one lock to the checker.
///
/// [`OrderedMutex`](crate::OrderedMutex) derives the id from its own address;
/// tests may construct tokens with arbitrary distinct ids.
#[derive(Debug, Clone, Copy)]
pub struct LadderToken {
    id: usize,
    level: LockLevel,
    name: &'static str,
}

impl LadderToken {
    /// Creates a token. `id` must be unique per lock for the token's lifetime.
    pub fn new(name: &'static str, level: LockLevel, id: usize) -> Self {
        Self { id, level, name }
    }

    /// Checkpoint: the current thread is about to block on this lock.
    ///
    /// Flags an ordering violation if this lock sits on a lower rung than the
    /// most specific lock the thread already holds, unless the thread already
    /// holds this very lock (re-entrant acquires are exempt from ordering).
    pub fn acquiring(&self) {
        if self.level == LockLevel::CheckingDisabled {
            return;
        }
        LOCK_STACK.with(|stack| {
            let stack = stack.borrow();
            // Most recently acquired lock that participates in ordering.
            let Some(held) = stack.iter().rev().find(|h| h.level.is_ordered()) else {
                return;
            };
            let held_rung = held
                .level
                .rung()
                .unwrap_or_default();

            match self.level {
                LockLevel::Unspecified => {
                    report(Violation::MissingLevel {
                        acquiring: self.name,
                        held: held.name,
                    });
                }
                LockLevel::Rung(rung) if rung >= held_rung => {}
                _ => {
                    let already_held = stack.iter().any(|h| h.id == self.id);
                    if !already_held {
                        report(Violation::OutOfOrder {
                            acquiring: self.name,
                            acquiring_level: self.level,
                            held: held.name,
                            held_level: held.level,
                        });
                    }
                }
            }
        });
    }

    /// Checkpoint: the current thread now holds this lock.
    ///
    /// `max_seen` is the lock's high-water recursion mark; a re-entry past it
    /// is flagged exactly once per new maximum.
    pub fn acquired(&self, max_seen: &AtomicU32) {
        if self.level == LockLevel::CheckingDisabled {
            return;
        }
        LOCK_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(held) = stack.iter_mut().find(|h| h.id == self.id) {
                held.recursion += 1;
                let depth = held.recursion;
                if depth > max_seen.fetch_max(depth, Ordering::Relaxed) {
                    report(Violation::ExcessiveRecursion {
                        lock: self.name,
                        depth,
                    });
                }
            } else {
                stack.push(Held {
                    id: self.id,
                    level: self.level,
                    name: self.name,
                    recursion: 1,
                });
            }
        });
    }

    /// Checkpoint: the current thread is releasing this lock.
    ///
    /// # Panics
    ///
    /// Panics if the thread does not hold the lock — that is corrupted
    /// bookkeeping, not an ordering question, and there is nothing sane to
    /// continue with.
    pub fn released(&self) {
        if self.level == LockLevel::CheckingDisabled {
            return;
        }
        LOCK_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let Some(pos) = stack.iter().position(|h| h.id == self.id) else {
                panic!(
                    "lock {} ({}) released by a thread that does not hold it",
                    self.name, self.level
                );
            };
            stack[pos].recursion -= 1;
            if stack[pos].recursion == 0 {
                stack.remove(pos);
            }
        });
    }
}

/// Number of distinct locks the current thread holds. Test hook.
pub fn held_lock_count() -> usize {
    LOCK_STACK.with(|stack| stack.borrow().len())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::report::{set_reporter, Violation, ViolationReporter};

    #[derive(Default)]
    struct Capture {
        seen: Mutex<Vec<Violation>>,
    }

    impl ViolationReporter for Capture {
        fn report(&self, violation: &Violation) {
            self.seen.lock().unwrap().push(violation.clone());
        }
    }

    fn with_capture(f: impl FnOnce()) -> Vec<Violation> {
        let capture = Arc::new(Capture::default());
        set_reporter(capture.clone());
        f();
        let seen = capture.seen.lock().unwrap().clone();
        seen
    }

    #[test]
    fn test_ascending_order_is_clean() {
        let low = LadderToken::new("low", LockLevel::Rung(1), 0xA1);
        let high = LadderToken::new("high", LockLevel::Rung(2), 0xA2);
        let max = AtomicU32::new(0);

        let seen = with_capture(|| {
            low.acquiring();
            low.acquired(&max);
            high.acquiring();
            high.acquired(&max);
            high.released();
            low.released();
        });
        assert!(seen.is_empty(), "unexpected violations: {seen:?}");
        assert_eq!(held_lock_count(), 0);
    }

    #[test]
    fn test_equal_rungs_are_clean() {
        let a = LadderToken::new("a", LockLevel::Rung(5), 0xB1);
        let b = LadderToken::new("b", LockLevel::Rung(5), 0xB2);
        let max = AtomicU32::new(0);

        let seen = with_capture(|| {
            a.acquiring();
            a.acquired(&max);
            b.acquiring();
            b.acquired(&max);
            b.released();
            a.released();
        });
        assert!(seen.is_empty());
    }

    #[test]
    fn test_descending_order_is_flagged() {
        let high = LadderToken::new("high", LockLevel::Rung(9), 0xC1);
        let low = LadderToken::new("low", LockLevel::Rung(3), 0xC2);
        let max = AtomicU32::new(0);

        let seen = with_capture(|| {
            high.acquiring();
            high.acquired(&max);
            low.acquiring();
            low.acquired(&max);
            low.released();
            high.released();
        });
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Violation::OutOfOrder { .. }));
    }

    #[test]
    fn test_reentrant_acquire_is_exempt_from_ordering() {
        let high = LadderToken::new("high", LockLevel::Rung(9), 0xD1);
        let max = AtomicU32::new(0);

        let seen = with_capture(|| {
            high.acquiring();
            high.acquired(&max);
            // Same lock again while holding it: no ordering violation even
            // though its rung is not above itself.
            high.acquiring();
            high.acquired(&max);
            high.released();
            high.released();
        });
        assert!(seen
            .iter()
            .all(|v| !matches!(v, Violation::OutOfOrder { .. })));
        assert_eq!(held_lock_count(), 0);
    }

    #[test]
    fn test_recursion_flagged_once_per_new_maximum() {
        let lock = LadderToken::new("rec", LockLevel::Rung(1), 0xE1);
        let max = AtomicU32::new(0);

        let seen = with_capture(|| {
            lock.acquiring();
            lock.acquired(&max);
            // Depth 2 twice: only the first crossing reports.
            lock.acquired(&max);
            lock.released();
            lock.acquired(&max);
            lock.released();
            // Depth 3: a new maximum, reports again.
            lock.acquired(&max);
            lock.acquired(&max);
            lock.released();
            lock.released();
            lock.released();
        });
        let recursion_flags: Vec<_> = seen
            .iter()
            .filter(|v| matches!(v, Violation::ExcessiveRecursion { .. }))
            .collect();
        assert_eq!(recursion_flags.len(), 2);
    }

    #[test]
    fn test_unspecified_level_flagged_when_holding_leveled_lock() {
        let leveled = LadderToken::new("leveled", LockLevel::Rung(4), 0xF1);
        let unleveled = LadderToken::new("unleveled", LockLevel::Unspecified, 0xF2);
        let max = AtomicU32::new(0);

        let seen = with_capture(|| {
            leveled.acquiring();
            leveled.acquired(&max);
            unleveled.acquiring();
            unleveled.acquired(&max);
            unleveled.released();
            leveled.released();
        });
        assert!(seen
            .iter()
            .any(|v| matches!(v, Violation::MissingLevel { .. })));
    }

    #[test]
    #[should_panic(expected = "does not hold it")]
    fn test_release_of_unheld_lock_panics() {
        let lock = LadderToken::new("ghost", LockLevel::Rung(1), 0x99);
        lock.released();
    }
}
