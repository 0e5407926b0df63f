//! The leveled mutex.

use std::sync::{Mutex, MutexGuard};

#[cfg(feature = "validate")]
use std::sync::atomic::AtomicU32;

use crate::level::LockLevel;

#[cfg(feature = "validate")]
use crate::stack::LadderToken;

/// A `std::sync::Mutex` with a static [`LockLevel`].
///
/// With the `validate` feature enabled, every acquisition and release runs
/// through the per-thread checker (see the crate docs). With the feature
/// disabled, this is a plain passthrough over the inner mutex.
///
/// A poisoned inner mutex is re-entered rather than propagated: poisoning
/// signals a panic in an unrelated critical section, which the ordering
/// checker neither causes nor cares about, and the data protected here is
/// always valid-by-construction state.
pub struct OrderedMutex<T> {
    inner: Mutex<T>,
    level: LockLevel,
    name: &'static str,
    #[cfg(feature = "validate")]
    max_recursion: AtomicU32,
}

impl<T> OrderedMutex<T> {
    /// Creates a leveled mutex. `name` appears in violation reports.
    pub const fn new(name: &'static str, level: LockLevel, value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            level,
            name,
            #[cfg(feature = "validate")]
            max_recursion: AtomicU32::new(0),
        }
    }

    /// The mutex's level.
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// The mutex's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[cfg(feature = "validate")]
    fn token(&self) -> LadderToken {
        LadderToken::new(self.name, self.level, self as *const Self as usize)
    }

    /// Acquires the mutex, blocking the current thread.
    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        #[cfg(feature = "validate")]
        self.token().acquiring();

        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        #[cfg(feature = "validate")]
        self.token().acquired(&self.max_recursion);

        OrderedMutexGuard { mutex: self, guard }
    }

    /// Consumes the mutex and returns the protected value.
    pub fn into_inner(self) -> T {
        self.inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("name", &self.name)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// RAII guard for [`OrderedMutex`]; notifies the checker on drop.
pub struct OrderedMutexGuard<'a, T> {
    mutex: &'a OrderedMutex<T>,
    guard: MutexGuard<'a, T>,
}

impl<T> std::ops::Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedMutexGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(feature = "validate")]
        self.mutex.token().released();
        #[cfg(not(feature = "validate"))]
        let _ = self.mutex;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

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

    #[test]
    fn test_lock_protects_value() {
        let mutex = OrderedMutex::new("value", LockLevel::Rung(1), 41);
        *mutex.lock() += 1;
        assert_eq!(*mutex.lock(), 42);
        assert_eq!(mutex.into_inner(), 42);
    }

    #[test]
    fn test_nested_ascending_locks_are_clean() {
        let capture = Arc::new(Capture::default());
        set_reporter(capture.clone());

        let catalog = OrderedMutex::new("catalog", LockLevel::Rung(10), ());
        let registry = OrderedMutex::new("registry", LockLevel::Rung(20), ());

        {
            let _outer = catalog.lock();
            let _inner = registry.lock();
        }
        assert!(capture.seen.lock().unwrap().is_empty());
    }

    #[cfg(feature = "validate")]
    #[test]
    fn test_nested_descending_locks_are_flagged() {
        let capture = Arc::new(Capture::default());
        set_reporter(capture.clone());

        let catalog = OrderedMutex::new("catalog", LockLevel::Rung(10), ());
        let registry = OrderedMutex::new("registry", LockLevel::Rung(20), ());

        {
            let _outer = registry.lock();
            let _inner = catalog.lock();
        }
        let seen = capture.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Violation::OutOfOrder { .. }));
    }

    #[test]
    fn test_contended_lock_serializes_threads() {
        let mutex = Arc::new(OrderedMutex::new("counter", LockLevel::Rung(1), 0u32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mutex = Arc::clone(&mutex);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    *mutex.lock() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 800);
    }
}
