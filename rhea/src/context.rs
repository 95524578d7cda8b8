//! Execution context: deadline and cancellation propagation plus keyed
//! values that travel with a call across process boundaries.
//!
//! Contexts form a tree. Each thread keeps a thread-local "current"
//! pointer managed RAII-style: constructing a context with `set_current`
//! pushes it, dropping it restores the previous one. Cancelling a node
//! cancels all of its descendants; a node's effective deadline is the
//! earliest of its own and its ancestors'. A `shield`ed context severs
//! both forms of ancestor propagation for its subtree.
//!
//! Values are keyed by portable type name. Equality-by-name is the ABI
//! contract across processes: a peer that has the type registered decodes
//! it, one that does not passes it through opaquely.

use std::any::Any;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use minstant::Instant;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::awaitable::{self, Awaitable};
use crate::container::FlatMap;
use crate::error::{Error, Result};
use crate::sync::{lock, Flag};

/// A value that can ride in a context across the wire.
///
/// The portable name identifies the type to peers; the default instance
/// is what [`ContextHandle::get`] hands out when the value is absent.
pub trait Portable: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    const PORTABLE_NAME: &'static str;
}

/// Object-safe face of a context value: its portable name, its encoded
/// payload, and a downcast hook.
pub trait ContextValue: Send + Sync + 'static {
    fn portable_name(&self) -> &str;
    fn encode_value(&self) -> Result<Vec<u8>>;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Portable> ContextValue for T {
    fn portable_name(&self) -> &str {
        T::PORTABLE_NAME
    }

    fn encode_value(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| Error::internal(format!("failed to encode context value: {e}")))
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// An inbound value whose type is not registered on this process: kept
/// opaque and re-encoded verbatim when forwarded.
struct RawValue {
    name: String,
    bytes: Vec<u8>,
}

impl ContextValue for RawValue {
    fn portable_name(&self) -> &str {
        &self.name
    }

    fn encode_value(&self) -> Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

type DecodeFn = fn(&[u8]) -> Result<Arc<dyn ContextValue>>;

fn registry() -> &'static Mutex<FlatMap<String, DecodeFn>> {
    static REGISTRY: OnceLock<Mutex<FlatMap<String, DecodeFn>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(FlatMap::new()))
}

/// Registers `T` so inbound context values carrying its portable name
/// decode into the typed form instead of staying opaque.
pub fn register_portable<T: Portable>() {
    fn decode<T: Portable>(bytes: &[u8]) -> Result<Arc<dyn ContextValue>> {
        let value: T = postcard::from_bytes(bytes)
            .map_err(|e| Error::data_mismatch(format!("failed to decode context value: {e}")))?;
        Ok(Arc::new(value))
    }
    lock(registry()).insert(T::PORTABLE_NAME.to_string(), decode::<T>);
}

fn decode_value(name: &str, bytes: &[u8]) -> Result<Arc<dyn ContextValue>> {
    let decoder = lock(registry()).get(name).copied();
    match decoder {
        Some(decode) => decode(bytes),
        None => Ok(Arc::new(RawValue { name: name.to_string(), bytes: bytes.to_vec() })),
    }
}

/// The wire form of a context: remaining deadline, values, cancellation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextRecord {
    pub deadline_left: Option<Duration>,
    pub values: Vec<(String, Vec<u8>)>,
    pub cancelled: bool,
}

struct NodeState {
    deadline: Option<Instant>,
    data: FlatMap<String, Arc<dyn ContextValue>>,
}

struct Node {
    parent: Option<Arc<Node>>,
    shield: bool,
    cancelled: Flag,
    state: Mutex<NodeState>,
    children: Mutex<FlatMap<usize, Weak<Node>>>,
    child_detached: Condvar,
}

impl Node {
    fn new(parent: Option<Arc<Node>>, shield: bool) -> Result<Arc<Node>> {
        let data = match &parent {
            Some(p) => lock(&p.state).data.clone(),
            None => FlatMap::new(),
        };
        Ok(Arc::new(Node {
            parent,
            shield,
            cancelled: Flag::new()?,
            state: Mutex::new(NodeState { deadline: None, data }),
            children: Mutex::new(FlatMap::new()),
            child_detached: Condvar::new(),
        }))
    }

    fn add_child(parent: &Arc<Node>, child: &Arc<Node>) {
        let mut children = lock(&parent.children);
        children.insert(Arc::as_ptr(child) as usize, Arc::downgrade(child));
        if parent.cancelled.is_set() {
            Node::cancel(child);
        }
    }

    fn remove_child(parent: &Arc<Node>, child: &Arc<Node>) {
        {
            let mut children = lock(&parent.children);
            children.remove(&(Arc::as_ptr(child) as usize));
        }
        parent.child_detached.notify_all();
    }

    fn cancel(node: &Arc<Node>) {
        let children = lock(&node.children);
        for (_, child) in children.iter() {
            if let Some(child) = child.upgrade() {
                Node::cancel(&child);
            }
        }
        node.cancelled.set();
    }

    fn effective_deadline(&self) -> Option<Instant> {
        let own = lock(&self.state).deadline;
        if self.shield {
            return own;
        }
        let inherited = self.parent.as_ref().and_then(|p| p.effective_deadline());
        match (own, inherited) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn is_cancelled(&self) -> bool {
        if self.cancelled.is_set() {
            return true;
        }
        if self.effective_deadline().is_some_and(|dl| Instant::now() >= dl) {
            return true;
        }
        if !self.shield {
            if let Some(parent) = &self.parent {
                return parent.is_cancelled();
            }
        }
        false
    }

    fn wait_children_empty(&self) {
        let mut children = lock(&self.children);
        while !children.is_empty() {
            children = self
                .child_detached
                .wait(children)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

fn root() -> &'static Arc<Node> {
    static ROOT: OnceLock<Arc<Node>> = OnceLock::new();
    ROOT.get_or_init(|| Node::new(None, false).expect("failed to create the process root context"))
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Node>>> = const { RefCell::new(None) };
}

/// A shared reference to a context node. All operations are available on
/// the handle; [`Context`] adds the RAII current-pointer and lifetime
/// management on top.
#[derive(Clone)]
pub struct ContextHandle {
    node: Arc<Node>,
}

impl ContextHandle {
    /// Idempotently cancels this context and all of its descendants.
    pub fn cancel(&self) {
        Node::cancel(&self.node);
    }

    /// True when this context, a non-shielded ancestor, or the effective
    /// deadline says the work should stop.
    pub fn is_cancelled(&self) -> bool {
        self.node.is_cancelled()
    }

    /// Effective deadline: the earliest of this node's and its ancestors'
    /// (ancestors ignored for shielded subtrees).
    pub fn deadline(&self) -> Option<Instant> {
        self.node.effective_deadline()
    }

    /// Time remaining until the effective deadline, floored at zero.
    pub fn deadline_left(&self) -> Option<Duration> {
        self.deadline().map(|dl| {
            let now = Instant::now();
            if dl > now {
                dl - now
            } else {
                Duration::ZERO
            }
        })
    }

    /// Records an absolute deadline. Setting never extends an already
    /// recorded one.
    pub fn set_deadline(&self, when: Instant) {
        let mut state = lock(&self.node.state);
        if state.deadline.map_or(true, |dl| when < dl) {
            state.deadline = Some(when);
        }
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.set_deadline(Instant::now() + timeout);
    }

    /// Stores a value under its portable name, replacing any previous
    /// value with that name.
    pub fn set<V: ContextValue>(&self, value: V) {
        let name = value.portable_name().to_string();
        lock(&self.node.state).data.insert(name, Arc::new(value));
    }

    /// Removes the value of type `T`, if any.
    pub fn reset<T: Portable>(&self) {
        lock(&self.node.state).data.remove(T::PORTABLE_NAME);
    }

    pub fn reset_all(&self) {
        lock(&self.node.state).data.clear();
    }

    /// Returns the stored value of type `T`, or a default instance when
    /// absent (or stored opaquely under the same name).
    pub fn get<T: Portable>(&self) -> Arc<T> {
        let stored = lock(&self.node.state).data.get(T::PORTABLE_NAME).cloned();
        stored
            .and_then(|v| v.as_any_arc().downcast::<T>().ok())
            .unwrap_or_else(|| Arc::new(T::default()))
    }

    /// Fires (with a `cancelled` failure) once this context is cancelled.
    pub fn wait_cancelled(&self) -> Awaitable<'static, ()> {
        let node = Arc::clone(&self.node);
        let fd = node.cancelled.wait_fd();
        Awaitable::readable(fd).then(move |()| {
            if node.cancelled.is_set() {
                Err(Error::cancelled("context is cancelled"))
            } else {
                Err(Error::try_again("context not cancelled"))
            }
        })
    }

    /// Fires (with a `deadline_exceeded` failure) once the effective
    /// deadline passes; never fires when no deadline is set.
    pub fn wait_deadline(&self) -> Awaitable<'static, ()> {
        match self.deadline() {
            Some(dl) => awaitable::deadline(dl)
                .then(|()| Err(Error::deadline_exceeded("context deadline exceeded"))),
            None => awaitable::never(),
        }
    }

    /// Marshals the context for the wire.
    pub fn snapshot(&self) -> Result<ContextRecord> {
        let values = {
            let state = lock(&self.node.state);
            let mut values = Vec::with_capacity(state.data.len());
            for (name, value) in state.data.iter() {
                values.push((name.clone(), value.encode_value()?));
            }
            values
        };
        Ok(ContextRecord {
            deadline_left: self.deadline_left(),
            values,
            cancelled: self.is_cancelled(),
        })
    }

    /// Reconstructs state from a wire record: a matching timeout, the
    /// carried values, and the cancellation flag.
    pub fn apply(&self, record: &ContextRecord) -> Result<()> {
        if let Some(left) = record.deadline_left {
            self.set_timeout(left);
        }
        for (name, bytes) in &record.values {
            let value = decode_value(name, bytes)?;
            lock(&self.node.state).data.insert(name.clone(), value);
        }
        if record.cancelled {
            self.cancel();
        }
        Ok(())
    }

    /// Read end of the cancellation doorbell, for select integration.
    pub(crate) fn cancel_wait_fd(&self) -> RawFd {
        self.node.cancelled.wait_fd()
    }

    /// Raw flag check (no ancestor walk): cancellation recurses into
    /// descendants when it happens, so a node's own flag is authoritative.
    pub(crate) fn cancel_flag_set(&self) -> bool {
        self.node.cancelled.is_set()
    }
}

/// An owned context node with RAII stack discipline.
///
/// Dropping a context cancels it, detaches it from its parent, restores
/// the thread-local current pointer it displaced, and blocks until every
/// child context has detached. A context created with `set_current` must
/// be dropped on the thread that created it.
pub struct Context {
    handle: ContextHandle,
    set_current: bool,
    previous: Option<Arc<Node>>,
}

impl Context {
    /// A child of the calling thread's current context, pushed as the new
    /// current.
    pub fn new() -> Result<Self> {
        Self::with_options(&Self::current(), true, false)
    }

    /// A shielded child: ancestor cancellation and deadlines do not reach
    /// it or its descendants.
    pub fn shielded() -> Result<Self> {
        Self::with_options(&Self::current(), true, true)
    }

    /// Full-control constructor: explicit parent, whether to become the
    /// thread's current context, and whether to shield.
    pub fn with_options(parent: &ContextHandle, set_current: bool, shield: bool) -> Result<Self> {
        let node = Node::new(Some(Arc::clone(&parent.node)), shield)?;
        if !shield {
            Node::add_child(&parent.node, &node);
        }
        let previous = if set_current {
            CURRENT.with(|c| c.borrow_mut().replace(Arc::clone(&node)))
        } else {
            None
        };
        Ok(Self { handle: ContextHandle { node }, set_current, previous })
    }

    /// The calling thread's current context (the process root when the
    /// thread has not pushed one).
    pub fn current() -> ContextHandle {
        let node = CURRENT
            .with(|c| c.borrow().clone())
            .unwrap_or_else(|| Arc::clone(root()));
        ContextHandle { node }
    }

    /// The process-wide root context.
    pub fn top() -> ContextHandle {
        ContextHandle { node: Arc::clone(root()) }
    }

    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }
}

impl std::ops::Deref for Context {
    type Target = ContextHandle;

    fn deref(&self) -> &ContextHandle {
        &self.handle
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.handle.cancel();
        if let Some(parent) = &self.handle.node.parent {
            if !self.handle.node.shield {
                Node::remove_child(parent, &self.handle.node);
            }
        }
        if self.set_current {
            CURRENT.with(|c| {
                let mut current = c.borrow_mut();
                let on_top = current
                    .as_ref()
                    .is_some_and(|n| Arc::ptr_eq(n, &self.handle.node));
                debug_assert!(on_top, "context dropped out of stack order");
                if on_top {
                    *current = self.previous.take();
                }
            });
        }
        self.handle.node.wait_children_empty();
    }
}
