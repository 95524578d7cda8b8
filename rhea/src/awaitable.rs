//! Awaitable primitive: one suspension condition plus a reaction pipeline.
//!
//! An [`Awaitable`] describes a single primitive wait source (fd
//! readiness, a timer, or nothing) and a chain of reactions that turn the
//! raw firing into a typed value. The wait source is armed by
//! [`select`](crate::select::select), not by the combinators; reactions
//! run on the selecting thread when the condition fires.
//!
//! A reaction that fails with [`ErrorKind::TryAgain`] tells `select` the
//! firing was spurious (the guarded state was consumed by someone else)
//! and the wait is re-armed.

use std::os::fd::RawFd;
use std::time::Duration;

use minstant::Instant;

use crate::error::{Error, ErrorKind, Result};

/// The primitive suspension conditions.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WaitKind {
    /// Fire when the fd is readable (or in error/hangup state).
    Readable(RawFd),
    /// Fire when the fd is writable (or in error/hangup state).
    Writable(RawFd),
    /// Fire once, `Duration` after the enclosing select started.
    Timeout(Duration),
    /// Fire every `Duration`, re-arming after each firing.
    Polling(Duration),
    /// Never fire.
    Never,
    /// Fire immediately.
    Always,
}

type React<'a, T> = Box<dyn FnMut() -> Result<T> + Send + 'a>;

/// A single suspension condition with a typed reaction chain.
///
/// The lifetime ties the reaction to whatever state it borrows (a queue,
/// a flag, a read buffer); fd-only awaitables are `'static`.
pub struct Awaitable<'a, T> {
    wait: WaitKind,
    react: React<'a, T>,
}

impl<'a> Awaitable<'a, ()> {
    /// Fires when `fd` becomes readable.
    pub fn readable(fd: RawFd) -> Self {
        Self { wait: WaitKind::Readable(fd), react: Box::new(|| Ok(())) }
    }

    /// Fires when `fd` becomes writable.
    pub fn writable(fd: RawFd) -> Self {
        Self { wait: WaitKind::Writable(fd), react: Box::new(|| Ok(())) }
    }
}

impl<'a, T: 'a> Awaitable<'a, T> {
    pub(crate) fn wait_kind(&self) -> WaitKind {
        self.wait
    }

    /// Runs the reaction chain; called by `select` when the condition fires.
    pub(crate) fn fire(&mut self) -> Result<T> {
        (self.react)()
    }

    /// Pipes `f` after the current reaction.
    pub fn then<U: 'a, F>(self, mut f: F) -> Awaitable<'a, U>
    where
        F: FnMut(T) -> Result<U> + Send + 'a,
    {
        let mut inner = self.react;
        Awaitable { wait: self.wait, react: Box::new(move || f(inner()?)) }
    }

    /// Typed catch: failures of `kind` are routed through `handler`,
    /// everything else passes through unchanged.
    pub fn except<F>(self, kind: ErrorKind, mut handler: F) -> Awaitable<'a, T>
    where
        F: FnMut(Error) -> Result<T> + Send + 'a,
    {
        let mut inner = self.react;
        Awaitable {
            wait: self.wait,
            react: Box::new(move || match inner() {
                Err(e) if e.kind() == kind => handler(e),
                other => other,
            }),
        }
    }

    /// Wraps the whole reaction so `wrap` observes both success and
    /// failure of the inner chain. `try_again` is select re-arm control
    /// flow and short-circuits past the wrapper.
    pub fn decorate<U: 'a, F>(self, mut wrap: F) -> Awaitable<'a, U>
    where
        F: FnMut(Result<T>) -> Result<U> + Send + 'a,
    {
        let mut inner = self.react;
        Awaitable {
            wait: self.wait,
            react: Box::new(move || match inner() {
                Err(e) if e.kind() == ErrorKind::TryAgain => Err(e),
                other => wrap(other),
            }),
        }
    }
}

/// Never fires.
pub fn never() -> Awaitable<'static, ()> {
    Awaitable { wait: WaitKind::Never, react: Box::new(|| Ok(())) }
}

/// Fires immediately.
pub fn always() -> Awaitable<'static, ()> {
    Awaitable { wait: WaitKind::Always, react: Box::new(|| Ok(())) }
}

/// Fires once, `duration` after the enclosing select starts waiting.
pub fn timeout(duration: Duration) -> Awaitable<'static, ()> {
    Awaitable { wait: WaitKind::Timeout(duration), react: Box::new(|| Ok(())) }
}

/// Fires every `interval` while the enclosing select keeps waiting.
pub fn polling(interval: Duration) -> Awaitable<'static, ()> {
    Awaitable { wait: WaitKind::Polling(interval), react: Box::new(|| Ok(())) }
}

/// Fires at the absolute time `when`; immediately if already past.
pub fn deadline(when: Instant) -> Awaitable<'static, ()> {
    let now = Instant::now();
    let left = if when > now { when - now } else { Duration::ZERO };
    timeout(left)
}
