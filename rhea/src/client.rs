//! The client-side RPC engine.
//!
//! One [`Client`] owns one reconnectable packet connection and serves as
//! a request multiplexer:
//!
//! - Callers encode a request frame, register a pending entry keyed by a
//!   strictly increasing request id, and push the frame under the
//!   sending lock (connecting on demand).
//! - A dedicated receiver thread reads frames once the connection is
//!   ready and fulfills the matching pending promise; unknown ids are
//!   discarded (the call may have timed out or been cancelled locally).
//! - A timeout/cancellation thread sleeps until the earliest pending
//!   deadline, a "new deadline" doorbell, or a cancelled request id,
//!   garbage-collecting expired entries and emitting out-of-band
//!   `CancelRequest` frames.
//!
//! Any receiver-side failure disconnects the link and fails every
//! in-flight call; the next request transparently reconnects.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use minstant::Instant;

use crate::awaitable;
use crate::config::{ClientConfig, ClientOptions};
use crate::connection::{Connector, PacketConnection, TcpConnector};
use crate::container::FlatMap;
use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::future::{promise, Future, Promise};
use crate::method::Method;
use crate::select::{select, wait_one};
use crate::sync::{lock, Flag, Queue};
use crate::thread::DaemonThread;
use crate::trace::{debug, trace};
use crate::wire::{self, MessageKind, RequestId, WireResult};

/// A client-side view of a remote interface; implemented by proxy types
/// so [`Client::proxy`] can hand them out.
pub trait Interface: Sized {
    fn from_remote(remote: RemoteObject) -> Self;
}

struct PendingRequest {
    deadline: Option<Instant>,
    result: Promise<Vec<u8>>,
}

struct PendingTable {
    /// Next request id; allocation is strictly increasing under this
    /// table's lock.
    sequence: u32,
    entries: FlatMap<u32, PendingRequest>,
}

struct ClientInner {
    connection: PacketConnection,
    pending: Mutex<PendingTable>,
    /// Raised while the connection is open and usable; the receiver
    /// sleeps on it between connection lifetimes.
    ready: Flag,
    /// Serializes outbound writes and connect attempts.
    sending: Mutex<()>,
    /// Nudges the timeout handler to re-read the earliest deadline.
    new_deadline: Queue<()>,
    /// Request ids awaiting an out-of-band cancel frame.
    cancelled_requests: Queue<RequestId>,
}

/// The RPC engine. Dropping it cancels both worker threads, disconnects,
/// and fails the calls still in flight with a connection-closed error.
pub struct Client {
    inner: Arc<ClientInner>,
    config: ClientConfig,
    receiver: Option<DaemonThread>,
    timer: Option<DaemonThread>,
}

impl Client {
    /// Builds an engine over `connector` and starts its worker threads.
    /// No connection is attempted until the first call.
    pub fn new(connector: impl Connector, config: ClientConfig) -> Result<Self> {
        let inner = Arc::new(ClientInner {
            connection: PacketConnection::new(connector),
            pending: Mutex::new(PendingTable { sequence: 0, entries: FlatMap::new() }),
            ready: Flag::new()?,
            sending: Mutex::new(()),
            new_deadline: Queue::new(config.max_queued_events)?,
            cancelled_requests: Queue::new(config.max_queued_events)?,
        });
        let receiver = {
            let inner = Arc::clone(&inner);
            DaemonThread::spawn("rhea-recv", move || inner.receive_loop())?
        };
        let timer = {
            let inner = Arc::clone(&inner);
            DaemonThread::spawn("rhea-timer", move || inner.timeout_and_cancellation_loop())?
        };
        Ok(Self { inner, config, receiver: Some(receiver), timer: Some(timer) })
    }

    /// Engine over a TCP connection to `addr`.
    pub fn connect_tcp(addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        Self::new(TcpConnector::new(addr), config)
    }

    /// Handle to the remote object `name` with engine-default options.
    pub fn remote(&self, name: impl Into<String>) -> RemoteObject {
        self.remote_with_options(name, ClientOptions::default())
    }

    /// Handle to the remote object `name`; per-proxy options override the
    /// engine defaults.
    pub fn remote_with_options(
        &self,
        name: impl Into<String>,
        options: ClientOptions,
    ) -> RemoteObject {
        RemoteObject {
            inner: Arc::clone(&self.inner),
            name: name.into(),
            request_timeout: options.request_timeout.or(self.config.request_timeout),
        }
    }

    /// Typed proxy for interface `I` bound to the remote object `name`.
    pub fn proxy<I: Interface>(&self, name: impl Into<String>) -> I {
        I::from_remote(self.remote(name))
    }

    pub fn proxy_with_options<I: Interface>(
        &self,
        name: impl Into<String>,
        options: ClientOptions,
    ) -> I {
        I::from_remote(self.remote_with_options(name, options))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Receiver first: cancel its context, then disconnect to unblock
        // a pending read, then join. The timer follows.
        if let Some(mut receiver) = self.receiver.take() {
            receiver.context().cancel();
            self.inner.connection.disconnect();
            receiver.join();
        }
        if let Some(mut timer) = self.timer.take() {
            timer.context().cancel();
            timer.join();
        }
    }
}

/// A remote object handle: engine + object name + resolved options.
/// Proxies embed one and route their synthesized methods through
/// [`call`](RemoteObject::call) / [`async_call`](RemoteObject::async_call).
/// Handles are cheap to clone and safe to share across threads.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<ClientInner>,
    name: String,
    request_timeout: Option<Duration>,
}

impl RemoteObject {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends the request for method `M` and returns the response future
    /// plus the allocated request id.
    ///
    /// The request rides under a child context carrying the per-proxy
    /// timeout; the serialized context and the pending entry's deadline
    /// are both snapshot from it.
    pub fn async_call<M: Method>(&self, args: &M::Args) -> Result<(Future<M::Reply>, RequestId)> {
        let ctx = Context::new()?;
        if let Some(timeout) = self.request_timeout {
            ctx.set_timeout(timeout);
        }

        let args_bytes = postcard::to_allocvec(args)
            .map_err(|e| Error::internal(format!("failed to encode arguments: {e}")))?;
        let current = Context::current();
        let record = current.snapshot()?;
        let deadline = current.deadline();

        let id = self.inner.next_request_id();
        let frame = wire::encode_request(
            id,
            &self.name,
            M::NAME,
            M::signature_hash(),
            &record,
            &args_bytes,
        );
        trace!(id = %id, object = %self.name, method = M::NAME, "sending request");

        let response = self.inner.send_request(id, &frame, deadline)?;
        let reply = response.then(|payload: Vec<u8>| match wire::decode_result(&payload)? {
            WireResult::Ok(value) => postcard::from_bytes(&value)
                .map_err(|e| Error::data_mismatch(format!("failed to decode reply: {e}"))),
            WireResult::Err { kind_name, message } => Err(Error::from_wire(&kind_name, &message)),
        });
        Ok((reply, id))
    }

    /// Calls method `M` and blocks for the reply. A cancellation observed
    /// while waiting abandons the request and emits one out-of-band
    /// `CancelRequest` frame before propagating.
    pub fn call<M: Method>(&self, args: &M::Args) -> Result<M::Reply> {
        let (response, id) = self.async_call::<M>(args)?;
        match response.get() {
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                self.inner.cancel_request(id);
                Err(e)
            }
            other => other,
        }
    }
}

impl ClientInner {
    fn next_request_id(&self) -> RequestId {
        let mut pending = lock(&self.pending);
        let id = pending.sequence;
        pending.sequence = pending.sequence.wrapping_add(1);
        RequestId::new(id)
    }

    /// Registers the pending entry, then pushes the frame. A send
    /// failure abandons the entry with the I/O error and propagates.
    fn send_request(
        &self,
        id: RequestId,
        frame: &[u8],
        deadline: Option<Instant>,
    ) -> Result<Future<Vec<u8>>> {
        let (result, response) = promise::<Vec<u8>>()?;
        {
            let mut pending = lock(&self.pending);
            let has_deadline = deadline.is_some();
            pending.entries.insert(id.as_u32(), PendingRequest { deadline, result });
            if has_deadline {
                // Doorbell full is fine: the handler re-reads the
                // earliest deadline on every iteration anyway.
                let _ = self.new_deadline.maybe_put(());
            }
        }
        if let Err(e) = self.send(frame) {
            self.fail_request(id, e.clone());
            return Err(e);
        }
        Ok(response)
    }

    /// Writes one frame under the sending lock, connecting on demand.
    /// Failure marks the connection unhealthy and tears it down.
    fn send(&self, frame: &[u8]) -> Result<()> {
        let _sending = lock(&self.sending);
        let attempt: Result<()> = (|| {
            self.connection.connect()?;
            self.connection.send(frame)
        })();
        match attempt {
            Ok(()) => {
                self.ready.set();
                Ok(())
            }
            Err(e) => {
                self.ready.reset();
                self.connection.disconnect();
                Err(e)
            }
        }
    }

    fn set_response(&self, id: RequestId, payload: Vec<u8>) {
        let entry = lock(&self.pending).entries.remove(&id.as_u32());
        match entry {
            Some(entry) => entry.result.set_value(payload),
            None => {
                // Locally cancelled or expired; the response is stale.
                trace!(id = %id, "discarding response for unknown request id");
            }
        }
    }

    fn fail_request(&self, id: RequestId, error: Error) {
        let entry = lock(&self.pending).entries.remove(&id.as_u32());
        if let Some(entry) = entry {
            entry.result.set_error(error);
        }
    }

    /// Abandons the request locally and queues the id for an out-of-band
    /// cancel frame (best-effort: a full queue skips the frame).
    fn cancel_request(&self, id: RequestId) {
        self.fail_request(id, Error::cancelled("request cancelled"));
        if self.cancelled_requests.maybe_put(id).is_err() {
            debug!(id = %id, "cancellation queue full; skipping out-of-band cancel frame");
        }
    }

    /// Fails every pending entry with `error` and clears the table.
    fn broadcast_error(&self, error: &Error) {
        let entries = {
            let mut pending = lock(&self.pending);
            std::mem::take(&mut pending.entries)
        };
        for (_, entry) in entries {
            entry.result.set_error(error.clone());
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        lock(&self.pending).entries.values().filter_map(|e| e.deadline).min()
    }

    /// Fails and removes every entry whose deadline has passed.
    fn gc(&self) {
        let now = Instant::now();
        let expired: Vec<PendingRequest> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<u32> = pending
                .entries
                .iter()
                .filter(|(_, e)| e.deadline.is_some_and(|dl| dl <= now))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.entries.remove(id)).collect()
        };
        for entry in expired {
            entry.result.set_error(Error::deadline_exceeded("request timed out"));
        }
    }

    fn dispatch_frame(&self, frame: &[u8]) -> Result<()> {
        let (header, consumed) = wire::decode_header(frame)?;
        match header.kind {
            MessageKind::Response => {
                self.set_response(header.id, frame[consumed..].to_vec());
                Ok(())
            }
            _ => Err(Error::data_mismatch("unexpected message kind from peer")),
        }
    }

    fn receive_loop(&self) -> Result<()> {
        let result = self.run_receiver();
        // Shutdown sweep: whatever is still pending fails with a
        // connection-closed error, never silently hangs.
        let _sending = lock(&self.sending);
        self.ready.reset();
        self.connection.disconnect();
        self.broadcast_error(&Error::not_connected("connection closed"));
        result
    }

    fn run_receiver(&self) -> Result<()> {
        loop {
            wait_one(self.ready.async_wait())?;
            let error = loop {
                match self.connection.receive() {
                    Ok(frame) => {
                        if let Err(e) = self.dispatch_frame(&frame) {
                            break e;
                        }
                    }
                    Err(e) => break e,
                }
            };
            if error.kind() == ErrorKind::Cancelled {
                return Err(error);
            }
            debug!(error = %error, "receiver failed; failing in-flight requests");
            let _sending = lock(&self.sending);
            self.ready.reset();
            self.connection.disconnect();
            self.broadcast_error(&error);
        }
    }

    fn timeout_and_cancellation_loop(&self) -> Result<()> {
        loop {
            let timer = match self.earliest_deadline() {
                Some(at) => awaitable::deadline(at),
                None => awaitable::never(),
            };
            let (_doorbell, cancelled_id, expiry) = select((
                self.new_deadline.async_get(),
                self.cancelled_requests.async_get(),
                timer,
            ))?;
            if expiry.is_some() {
                self.gc();
            }
            if let Some(id) = cancelled_id {
                let frame = wire::encode_cancel_request(id);
                // The call was already abandoned locally; delivery of the
                // cancel frame is best-effort.
                if let Err(_e) = self.send(&frame) {
                    debug!(id = %id, error = %_e, "cancel frame dropped");
                }
            }
            // The doorbell branch needs no action: the next iteration
            // recomputes the earliest deadline.
        }
    }
}
