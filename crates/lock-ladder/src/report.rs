//! Violation reporting.
//!
//! The checker itself never panics on an *ordering* violation — it hands the
//! finding to the installed [`ViolationReporter`] on the offending thread.
//! The default reporter logs at error level through `tracing`. Tests install
//! a capturing reporter so they can assert that a violation was (or was not)
//! flagged.
//!
//! Releasing a lock the thread does not hold is the one exception: that is
//! not an ordering question but corrupted bookkeeping, and the checker
//! panics immediately.

use std::cell::RefCell;
use std::sync::Arc;

use crate::level::LockLevel;

/// A flagged lock-discipline violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A lock was acquired on a lower rung than one the thread already holds.
    OutOfOrder {
        /// Name of the lock being acquired.
        acquiring: &'static str,
        /// Level of the lock being acquired.
        acquiring_level: LockLevel,
        /// Name of the most specific lock already held.
        held: &'static str,
        /// Level of the most specific lock already held.
        held_level: LockLevel,
    },
    /// A lock with [`LockLevel::Unspecified`] was acquired while the thread
    /// held a leveled lock.
    MissingLevel {
        /// Name of the unleveled lock being acquired.
        acquiring: &'static str,
        /// Name of the leveled lock already held.
        held: &'static str,
    },
    /// A lock was re-entered deeper than any previously observed recursion.
    /// Reported once per new maximum to keep the log quiet.
    ExcessiveRecursion {
        /// Name of the re-entered lock.
        lock: &'static str,
        /// The new recursion depth.
        depth: u32,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::OutOfOrder {
                acquiring,
                acquiring_level,
                held,
                held_level,
            } => write!(
                f,
                "out-of-order acquire: {acquiring} ({acquiring_level}) while holding {held} ({held_level})"
            ),
            Violation::MissingLevel { acquiring, held } => write!(
                f,
                "lock {acquiring} has no level but was acquired while holding leveled lock {held}"
            ),
            Violation::ExcessiveRecursion { lock, depth } => {
                write!(f, "lock {lock} re-entered to depth {depth}")
            }
        }
    }
}

/// Sink for flagged violations.
pub trait ViolationReporter: Send + Sync {
    /// Called once per flagged violation, on the offending thread.
    fn report(&self, violation: &Violation);
}

struct TracingReporter;

impl ViolationReporter for TracingReporter {
    fn report(&self, violation: &Violation) {
        tracing::error!(%violation, "lock ladder violation");
    }
}

thread_local! {
    static REPORTER: RefCell<Option<Arc<dyn ViolationReporter>>> = const { RefCell::new(None) };
}

/// Installs a reporter for the calling thread, replacing the default tracing
/// reporter.
///
/// Violations are always raised on the offending thread, so a per-thread
/// reporter sees exactly the violations that thread caused — which also
/// keeps concurrently running tests from observing each other's flags.
pub fn set_reporter(reporter: Arc<dyn ViolationReporter>) {
    REPORTER.with(|slot| *slot.borrow_mut() = Some(reporter));
}

#[cfg_attr(not(feature = "validate"), allow(dead_code))]
pub(crate) fn report(violation: Violation) {
    let custom = REPORTER.with(|slot| slot.borrow().clone());
    match custom {
        Some(reporter) => reporter.report(&violation),
        None => TracingReporter.report(&violation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_display() {
        let v = Violation::OutOfOrder {
            acquiring: "low",
            acquiring_level: LockLevel::Rung(1),
            held: "high",
            held_level: LockLevel::Rung(9),
        };
        let text = v.to_string();
        assert!(text.contains("low"));
        assert!(text.contains("rung 1"));
        assert!(text.contains("high"));
    }
}
