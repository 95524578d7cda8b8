//! One-shot typed result channel.
//!
//! [`promise`] hands back the two ends: the [`Promise`] resolves exactly
//! once (the consuming `set_*` signatures make double resolution
//! unrepresentable), the [`Future`] blocks cooperatively in
//! [`get`](Future::get). The wait is built on `select`, so a blocked
//! thread still observes cancellation and deadlines of its current
//! context.

use std::sync::{Arc, Mutex};

use crate::awaitable::Awaitable;
use crate::error::{Error, ErrorKind, Result};
use crate::select::wait_one;
use crate::sync::{lock, Flag};

enum Slot<T> {
    Empty,
    Resolved(Result<T>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Arc<Flag>,
}

impl<T> Shared<T> {
    fn resolve(&self, result: Result<T>) {
        let mut slot = lock(&self.slot);
        match *slot {
            Slot::Empty => {
                *slot = Slot::Resolved(result);
                self.ready.set();
            }
            // A promise can only be consumed once; reaching this means a
            // broken invariant, not a runtime condition.
            Slot::Resolved(_) | Slot::Taken => panic!("promise resolved twice"),
        }
    }
}

/// Write end: resolves the future exactly once.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
    resolved: bool,
}

impl<T: Send + 'static> Promise<T> {
    pub fn set_value(mut self, value: T) {
        self.resolved = true;
        self.shared.resolve(Ok(value));
    }

    pub fn set_error(mut self, error: Error) {
        self.resolved = true;
        self.shared.resolve(Err(error));
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.resolved {
            self.shared
                .resolve(Err(Error::internal("promise dropped without a result")));
        }
    }
}

type PollFn<T> = Box<dyn FnMut() -> Result<T> + Send>;

/// Read end: a value that will arrive, with combinators mirroring
/// [`Awaitable`]'s.
pub struct Future<T> {
    ready: Arc<Flag>,
    poll_fn: PollFn<T>,
}

/// Creates a connected promise/future pair.
pub fn promise<T: Send + 'static>() -> Result<(Promise<T>, Future<T>)> {
    let ready = Arc::new(Flag::new()?);
    let shared = Arc::new(Shared::<T> { slot: Mutex::new(Slot::Empty), ready: Arc::clone(&ready) });
    let promise = Promise { shared: Arc::clone(&shared), resolved: false };
    let poll_fn: PollFn<T> = Box::new(move || {
        let mut slot = lock(&shared.slot);
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Resolved(result) => result,
            Slot::Empty => {
                *slot = Slot::Empty;
                Err(Error::try_again("future not ready"))
            }
            Slot::Taken => Err(Error::internal("future already consumed")),
        }
    });
    Ok((promise, Future { ready, poll_fn }))
}

impl<T: Send + 'static> Future<T> {
    /// Non-blocking probe: `try_again` while unresolved.
    pub fn maybe_get(&mut self) -> Result<T> {
        (self.poll_fn)()
    }

    /// Fires once the result is available.
    pub fn can_get(&self) -> Awaitable<'_, ()> {
        self.ready.async_wait()
    }

    /// Fires with the result once it is available.
    pub fn async_get(&mut self) -> Awaitable<'_, T> {
        let fd = self.ready.wait_fd();
        let poll_fn = &mut self.poll_fn;
        Awaitable::readable(fd).then(move |()| poll_fn())
    }

    /// Blocks cooperatively until resolved, then yields the value or the
    /// recorded failure.
    pub fn get(mut self) -> Result<T> {
        wait_one(self.async_get())
    }

    /// Pipes `f` after resolution; failures pass through.
    pub fn then<U: Send + 'static, F>(self, mut f: F) -> Future<U>
    where
        F: FnMut(T) -> Result<U> + Send + 'static,
    {
        let mut inner = self.poll_fn;
        Future { ready: self.ready, poll_fn: Box::new(move || f(inner()?)) }
    }

    /// Typed catch on the resolution path.
    pub fn except<F>(self, kind: ErrorKind, mut handler: F) -> Future<T>
    where
        F: FnMut(Error) -> Result<T> + Send + 'static,
    {
        let mut inner = self.poll_fn;
        Future {
            ready: self.ready,
            poll_fn: Box::new(move || match inner() {
                Err(e) if e.kind() == kind => handler(e),
                other => other,
            }),
        }
    }

    /// Wraps resolution so `wrap` observes success and failure alike
    /// (`try_again` re-arm control flow excepted).
    pub fn decorate<U: Send + 'static, F>(self, mut wrap: F) -> Future<U>
    where
        F: FnMut(Result<T>) -> Result<U> + Send + 'static,
    {
        let mut inner = self.poll_fn;
        Future {
            ready: self.ready,
            poll_fn: Box::new(move || match inner() {
                Err(e) if e.kind() == ErrorKind::TryAgain => Err(e),
                other => wrap(other),
            }),
        }
    }
}
