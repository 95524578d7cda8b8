//! Bounded queue with select-friendly readiness.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::awaitable::Awaitable;
use crate::error::{Error, Result};
use crate::select::wait_one;
use crate::sync::{lock, Flag};

/// A fixed-capacity FIFO whose emptiness/fullness is mirrored into two
/// [`Flag`]s, making `get` and `put` selectable: `can_get` is raised
/// while the queue holds items, `can_put` while it has room. The flags
/// are maintained under the queue lock after every operation.
pub struct Queue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    can_get: Flag,
    can_put: Flag,
}

impl<T: Send + 'static> Queue<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        let queue = Self {
            capacity,
            items: Mutex::new(VecDeque::new()),
            can_get: Flag::new()?,
            can_put: Flag::new()?,
        };
        if capacity > 0 {
            queue.can_put.set();
        }
        Ok(queue)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    pub fn is_full(&self) -> bool {
        lock(&self.items).len() == self.capacity
    }

    fn update_flags(&self, len: usize) {
        if len == 0 {
            self.can_get.reset();
        } else {
            self.can_get.set();
        }
        if len == self.capacity {
            self.can_put.reset();
        } else {
            self.can_put.set();
        }
    }

    /// Non-blocking put; fails with `try_again` when the queue is full
    /// (the value is dropped, mirroring `maybe_get` on an empty queue).
    pub fn maybe_put(&self, value: T) -> Result<()> {
        let mut items = lock(&self.items);
        if items.len() == self.capacity {
            return Err(Error::try_again("queue is full"));
        }
        items.push_back(value);
        self.update_flags(items.len());
        Ok(())
    }

    /// Non-blocking get; fails with `try_again` when empty.
    pub fn maybe_get(&self) -> Result<T> {
        let mut items = lock(&self.items);
        let value = items.pop_front().ok_or_else(|| Error::try_again("queue is empty"))?;
        self.update_flags(items.len());
        Ok(value)
    }

    /// Blocks while the queue is full.
    pub fn put(&self, value: T) -> Result<()> {
        wait_one(self.async_put(value))
    }

    /// Blocks while the queue is empty.
    pub fn get(&self) -> Result<T> {
        wait_one(self.async_get())
    }

    /// Fires once the value has been enqueued.
    pub fn async_put(&self, value: T) -> Awaitable<'_, ()> {
        let mut value = Some(value);
        self.can_put.async_wait().then(move |()| {
            // Confirm room before consuming the value, so losing the race
            // for the free slot re-arms with the value intact.
            let mut items = lock(&self.items);
            if items.len() == self.capacity {
                return Err(Error::try_again("queue is full"));
            }
            let v = value
                .take()
                .ok_or_else(|| Error::internal("queue put re-fired after success"))?;
            items.push_back(v);
            self.update_flags(items.len());
            Ok(())
        })
    }

    /// Fires with the head item once one is available.
    pub fn async_get(&self) -> Awaitable<'_, T>
    where
        T: 'static,
    {
        self.can_get.async_wait().then(move |()| self.maybe_get())
    }

    /// Fires while the queue has room.
    pub fn can_put(&self) -> Awaitable<'_, ()> {
        self.can_put.async_wait()
    }

    /// Fires while the queue holds items.
    pub fn can_get(&self) -> Awaitable<'_, ()> {
        self.can_get.async_wait()
    }
}
