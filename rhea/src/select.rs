//! Multi-way wait over heterogeneous awaitables, implemented on poll(2).
//!
//! [`select`] blocks until exactly one of the supplied awaitables fires,
//! runs that one's reaction, and returns a tuple of options with exactly
//! one entry populated. When several conditions are ready simultaneously,
//! the earliest argument wins. A reaction failing with `try_again`
//! forfeits the win (the firing was spurious) and the wait is re-armed.
//!
//! Every select also watches the calling thread's current
//! [`Context`](crate::context::Context): cancellation surfaces as a
//! `cancelled` failure and an expired context deadline as
//! `deadline_exceeded`, regardless of which awaitables are pending. Both
//! are checked ahead of the user awaitables.

use std::os::fd::BorrowedFd;
use std::time::Duration;

use minstant::Instant;
use rustix::event::{PollFd, PollFlags};

use crate::awaitable::{Awaitable, WaitKind};
use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};

/// One erased select participant: its wait condition plus a closure that
/// runs the reaction into its result slot. Returns whether the firing was
/// claimed (`false` means `try_again`: keep waiting).
struct Entry<'s> {
    wait: WaitKind,
    fire: Box<dyn FnMut() -> Result<bool> + 's>,
}

/// Per-entry timer state across poll iterations.
enum Timer {
    None,
    /// One-shot: fires at the instant, then stays consumed.
    Once { at: Instant, consumed: bool },
    /// Polling: re-arms a full interval after each firing.
    Interval { at: Instant, every: Duration },
}

fn poll_timeout_ms(from: Instant, until: Instant) -> i32 {
    if until <= from {
        return 0;
    }
    let left = until - from;
    // Round up so we never wake before the target and busy-spin.
    let mut ms = left.as_millis();
    if Duration::from_millis(ms as u64) < left {
        ms += 1;
    }
    ms.min(i32::MAX as u128) as i32
}

fn drive(mut entries: Vec<Entry<'_>>) -> Result<()> {
    let current = Context::current();
    let cancel_fd = current.cancel_wait_fd();
    let ctx_deadline = current.deadline();
    let start = Instant::now();

    let mut timers: Vec<Timer> = entries
        .iter()
        .map(|e| match e.wait {
            WaitKind::Timeout(d) => Timer::Once { at: start + d, consumed: false },
            WaitKind::Polling(d) => Timer::Interval { at: start + d, every: d },
            _ => Timer::None,
        })
        .collect();

    loop {
        if current.cancel_flag_set() {
            return Err(Error::cancelled("context is cancelled"));
        }
        let now = Instant::now();
        if ctx_deadline.is_some_and(|dl| now >= dl) {
            return Err(Error::deadline_exceeded("context deadline exceeded"));
        }

        // Earliest wake-up among armed timers and the context deadline.
        let mut wake = ctx_deadline;
        let mut immediate = false;
        for (entry, timer) in entries.iter().zip(timers.iter()) {
            let at = match timer {
                Timer::Once { at, consumed: false } => Some(*at),
                Timer::Interval { at, .. } => Some(*at),
                _ => None,
            };
            if let Some(at) = at {
                wake = Some(wake.map_or(at, |w| w.min(at)));
            }
            if matches!(entry.wait, WaitKind::Always) {
                immediate = true;
            }
        }

        // Slot 0 is the cancellation doorbell of the current context; user
        // fds follow in argument order.
        //
        // Safety: every fd here is either owned by the current context
        // node (kept alive by `current`) or borrowed by an awaitable whose
        // lifetime covers this call.
        let mut fds: Vec<PollFd<'_>> = Vec::with_capacity(entries.len() + 1);
        fds.push(PollFd::from_borrowed_fd(
            unsafe { BorrowedFd::borrow_raw(cancel_fd) },
            PollFlags::IN,
        ));
        let mut fd_slot: Vec<Option<usize>> = vec![None; entries.len()];
        for (i, entry) in entries.iter().enumerate() {
            let (fd, flags) = match entry.wait {
                WaitKind::Readable(fd) => (fd, PollFlags::IN),
                WaitKind::Writable(fd) => (fd, PollFlags::OUT),
                _ => continue,
            };
            fd_slot[i] = Some(fds.len());
            fds.push(PollFd::from_borrowed_fd(unsafe { BorrowedFd::borrow_raw(fd) }, flags));
        }

        let timeout = if immediate {
            0
        } else {
            match wake {
                Some(at) => poll_timeout_ms(now, at),
                None => -1,
            }
        };

        match rustix::event::poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(e) if e == rustix::io::Errno::INTR => continue,
            Err(e) => return Err(Error::io(format!("poll failed: {e}"))),
        }

        let now = Instant::now();
        // Cancellation and the context deadline outrank user awaitables.
        if current.cancel_flag_set() {
            return Err(Error::cancelled("context is cancelled"));
        }
        if ctx_deadline.is_some_and(|dl| now >= dl) {
            return Err(Error::deadline_exceeded("context deadline exceeded"));
        }

        for i in 0..entries.len() {
            let ready = match entries[i].wait {
                WaitKind::Readable(_) | WaitKind::Writable(_) => fd_slot[i]
                    .map(|slot| !fds[slot].revents().is_empty())
                    .unwrap_or(false),
                WaitKind::Timeout(_) => {
                    matches!(timers[i], Timer::Once { at, consumed: false } if now >= at)
                }
                WaitKind::Polling(_) => {
                    matches!(timers[i], Timer::Interval { at, .. } if now >= at)
                }
                WaitKind::Never => false,
                WaitKind::Always => true,
            };
            if !ready {
                continue;
            }
            match &mut timers[i] {
                Timer::Once { consumed, .. } => *consumed = true,
                Timer::Interval { at, every } => *at = now + *every,
                Timer::None => {}
            }
            if (entries[i].fire)()? {
                return Ok(());
            }
        }
    }
}

/// A tuple of awaitables acceptable to [`select`].
pub trait SelectSet<'a> {
    /// Tuple of options, exactly one populated on success.
    type Output;

    fn select_all(self) -> Result<Self::Output>;
}

/// Blocks until one of the awaitables fires and returns which.
///
/// See the module docs for the full semantics. Fails with `cancelled` or
/// `deadline_exceeded` when the current context does, with `io_error`
/// when the underlying poll does, and with whatever hard error the
/// winning reaction produced.
pub fn select<'a, S: SelectSet<'a>>(set: S) -> Result<S::Output> {
    set.select_all()
}

macro_rules! impl_select_set {
    ($(($T:ident, $a:ident, $slot:ident)),+) => {
        impl<'a, $($T: 'a),+> SelectSet<'a> for ($(Awaitable<'a, $T>,)+) {
            type Output = ($(Option<$T>,)+);

            fn select_all(self) -> Result<Self::Output> {
                let ($(mut $a,)+) = self;
                $(let mut $slot: Option<$T> = None;)+
                {
                    let entries: Vec<Entry<'_>> = vec![
                        $(Entry {
                            wait: $a.wait_kind(),
                            fire: Box::new(|| match $a.fire() {
                                Ok(v) => {
                                    $slot = Some(v);
                                    Ok(true)
                                }
                                Err(e) if e.kind() == ErrorKind::TryAgain => Ok(false),
                                Err(e) => Err(e),
                            }),
                        },)+
                    ];
                    drive(entries)?;
                }
                Ok(($($slot,)+))
            }
        }
    };
}

impl_select_set!((T1, a1, s1));
impl_select_set!((T1, a1, s1), (T2, a2, s2));
impl_select_set!((T1, a1, s1), (T2, a2, s2), (T3, a3, s3));
impl_select_set!((T1, a1, s1), (T2, a2, s2), (T3, a3, s3), (T4, a4, s4));
impl_select_set!((T1, a1, s1), (T2, a2, s2), (T3, a3, s3), (T4, a4, s4), (T5, a5, s5));
impl_select_set!(
    (T1, a1, s1),
    (T2, a2, s2),
    (T3, a3, s3),
    (T4, a4, s4),
    (T5, a5, s5),
    (T6, a6, s6)
);
impl_select_set!(
    (T1, a1, s1),
    (T2, a2, s2),
    (T3, a3, s3),
    (T4, a4, s4),
    (T5, a5, s5),
    (T6, a6, s6),
    (T7, a7, s7)
);
impl_select_set!(
    (T1, a1, s1),
    (T2, a2, s2),
    (T3, a3, s3),
    (T4, a4, s4),
    (T5, a5, s5),
    (T6, a6, s6),
    (T7, a7, s7),
    (T8, a8, s8)
);

/// Waits a single awaitable to completion.
pub(crate) fn wait_one<'a, T: 'a>(awaitable: Awaitable<'a, T>) -> Result<T> {
    let (result,) = select((awaitable,))?;
    result.ok_or_else(|| Error::internal("select returned without a populated slot"))
}
