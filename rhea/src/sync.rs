//! Select-friendly synchronization primitives.
//!
//! Unlike a condvar, these wake waiters through file descriptors so they
//! compose with [`select`](crate::select::select) alongside socket and
//! timer awaitables.

mod flag;
mod queue;

pub use flag::Flag;
pub use queue::Queue;

/// A counting semaphore is just a queue of units.
pub type Semaphore = Queue<()>;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a holder panicked. The state
/// behind these mutexes is plain data with no multi-step updates, so a
/// guard from a poisoned lock is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
