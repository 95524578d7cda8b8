//! rhea: a thread-based RPC runtime.
//!
//! Clients invoke typed methods on remote objects identified by name;
//! arguments and results travel over a length-prefixed, checksummed
//! stream protocol, and every in-flight call participates in a
//! propagated cancellation/deadline context.
//!
//! The crate splits into three layers:
//!
//! - **Cooperative I/O core**: [`Awaitable`] suspension descriptors with
//!   `then`/`except`/`decorate` combinators, a poll(2)-backed
//!   [`select`], and the [`Context`] tree carrying deadlines,
//!   cancellation, and keyed values across threads and processes.
//! - **Packet protocol**: non-blocking [`Channel`]s, CRC-protected
//!   framing, and a reconnecting [`PacketConnection`].
//! - **Client engine**: the [`Client`] request multiplexer with
//!   promise-based response dispatch, deadline garbage collection, and
//!   out-of-band cancellation.

pub mod awaitable;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod container;
pub mod context;
pub mod error;
pub mod future;
pub mod method;
pub mod packet;
pub mod select;
pub mod sync;
mod trace;
pub mod thread;
pub mod wire;

pub use awaitable::{always, deadline, never, polling, timeout, Awaitable};
pub use channel::Channel;
pub use client::{Client, Interface, RemoteObject};
pub use config::{ClientConfig, ClientOptions};
pub use connection::{Connector, PacketConnection, ReconnectableConnection, SocketConnection, TcpConnector};
pub use container::{FlatMap, FlatSet};
pub use context::{register_portable, Context, ContextHandle, ContextRecord, Portable};
pub use error::{Error, ErrorKind, Result};
pub use future::{promise, Future, Promise};
pub use method::Method;
pub use select::select;
pub use sync::{Flag, Queue, Semaphore};
pub use thread::DaemonThread;
pub use trace::init_tracing;
pub use wire::{MessageKind, RequestId};
