//! # Lock Ladder
//!
//! A leveled mutex wrapper that validates lock-acquisition order at runtime.
//!
//! Deadlocks caused by inconsistent lock ordering are among the hardest bugs
//! to reproduce: they need two threads to interleave just so. This crate makes
//! the ordering discipline explicit and checkable on *every* acquisition, on
//! a single thread, long before the unlucky interleaving ever happens:
//!
//! 1. Every [`OrderedMutex`] carries a static [`LockLevel`] — its rung on the
//!    ladder.
//! 2. A thread may only climb: acquiring a lock on a *lower* rung than one it
//!    already holds is flagged as an ordering violation.
//! 3. Re-acquiring a lock the thread already holds is exempt from the
//!    ordering rule, but is flagged the first time its recursion depth
//!    exceeds any previously observed maximum.
//! 4. Releasing a lock the thread does not hold is a fatal logic error.
//!
//! # Validation is a development-time safety net
//!
//! All checking lives behind the `validate` feature (enabled by default so
//! test and dev builds get it for free). With the feature disabled,
//! [`OrderedMutex`] compiles down to a plain `std::sync::Mutex` passthrough:
//! no thread-local bookkeeping, no atomics, no behavior change.
//!
//! # Example
//!
//! ```
//! use lock_ladder::{LockLevel, OrderedMutex};
//!
//! static CATALOG_LEVEL: LockLevel = LockLevel::Rung(20);
//!
//! let catalog = OrderedMutex::new("catalog", CATALOG_LEVEL, Vec::<String>::new());
//! catalog.lock().push("app".to_string());
//! assert_eq!(catalog.lock().len(), 1);
//! ```
//!
//! # Reporting
//!
//! Violations are raised on the offending thread and handed to that thread's
//! [`ViolationReporter`]. The default reporter logs through `tracing` at
//! error level; tests install a capturing reporter via [`set_reporter`] to
//! assert on flagged violations instead of scraping logs.

mod level;
#[cfg(feature = "validate")]
mod stack;

pub mod report;

mod mutex;

pub use level::LockLevel;
pub use mutex::{OrderedMutex, OrderedMutexGuard};
pub use report::{set_reporter, Violation, ViolationReporter};

#[cfg(feature = "validate")]
pub use stack::{held_lock_count, LadderToken};
