//! Select-friendly set/reset latch.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use rustix::pipe::PipeFlags;

use crate::awaitable::Awaitable;
use crate::error::{Error, Result};
use crate::select::wait_one;
use crate::sync::lock;

/// A latch whose waiters block in `select` rather than on a condvar.
///
/// Backed by a self-pipe: while the flag is set, one byte sits in the
/// pipe and the read end stays readable, so any number of selectors can
/// watch it concurrently. `async_wait` re-checks the flag after the fd
/// fires and re-arms with `try_again` when another thread already reset
/// it.
pub struct Flag {
    state: Mutex<bool>,
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl Flag {
    pub fn new() -> Result<Self> {
        let (read_end, write_end) = rustix::pipe::pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK)
            .map_err(|e| Error::io(format!("failed to create flag pipe: {e}")))?;
        Ok(Self { state: Mutex::new(false), read_end, write_end })
    }

    /// Raises the flag. Idempotent.
    pub fn set(&self) {
        let mut set = lock(&self.state);
        if !*set {
            // One byte per set/reset cycle; the pipe can never fill.
            let _ = rustix::io::write(&self.write_end, b"*");
            *set = true;
        }
    }

    /// Lowers the flag. Idempotent.
    pub fn reset(&self) {
        let mut set = lock(&self.state);
        if *set {
            let mut byte = [0u8; 1];
            let _ = rustix::io::read(&self.read_end, &mut byte);
            *set = false;
        }
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.state)
    }

    /// Blocks until the flag is set.
    pub fn wait(&self) -> Result<()> {
        wait_one(self.async_wait())
    }

    /// Fires whenever the flag is observed set.
    pub fn async_wait(&self) -> Awaitable<'_, ()> {
        Awaitable::readable(self.read_end.as_raw_fd()).then(move |()| {
            if self.is_set() {
                Ok(())
            } else {
                Err(Error::try_again("flag not set"))
            }
        })
    }

    pub(crate) fn wait_fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }
}
