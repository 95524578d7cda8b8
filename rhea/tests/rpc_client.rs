//! End-to-end tests for the RPC client engine against in-process TCP
//! peers speaking the packet protocol.
//!
//! Each test spawns a bespoke peer thread built from the crate's own
//! channel/packet/wire layers and drives the client through one
//! scenario: plain calls, deadline expiry, user cancellation, reconnect
//! after an induced I/O error, frame corruption, and shielded deadlines.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=rhea=trace cargo test --features tracing -- --nocapture
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Once;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use type_hash::TypeHash;

use rhea::channel::Channel;
use rhea::packet;
use rhea::wire::{self, MessageKind, RequestId, WireResult};
use rhea::{Client, ClientConfig, ClientOptions, Context, ErrorKind, Interface, Method, RemoteObject};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        rhea::init_tracing();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TypeHash)]
struct AddArgs {
    a: u32,
    b: u32,
}

struct Add;

impl Method for Add {
    const NAME: &'static str = "add";
    type Args = AddArgs;
    type Reply = u32;
}

/// A typed proxy, standing in for what interface codegen would emit.
struct Calculator {
    remote: RemoteObject,
}

impl Interface for Calculator {
    fn from_remote(remote: RemoteObject) -> Self {
        Self { remote }
    }
}

impl Calculator {
    fn add(&self, a: u32, b: u32) -> rhea::Result<u32> {
        self.remote.call::<Add>(&AddArgs { a, b })
    }
}

fn listen() -> (Channel, SocketAddr) {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let listener = Channel::listen_tcp(&addr).expect("bind listener");
    let local = listener.local_addr().expect("local addr");
    (listener, local)
}

fn reply_ok<T: Serialize>(conn: &Channel, id: RequestId, value: &T) {
    let encoded = postcard::to_allocvec(value).expect("encode reply");
    let frame = wire::encode_response(id, &WireResult::Ok(encoded));
    packet::send_frame(conn, &frame).expect("send response");
}

fn reply_err(conn: &Channel, id: RequestId, kind_name: &str, message: &str) {
    let frame = wire::encode_response(
        id,
        &WireResult::Err { kind_name: kind_name.into(), message: message.into() },
    );
    packet::send_frame(conn, &frame).expect("send error response");
}

/// Serves `add` on one connection until the client goes away.
fn spawn_adder(listener: Channel) -> JoinHandle<Vec<u32>> {
    thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept");
        let mut seen_ids = Vec::new();
        while let Ok(frame) = packet::receive_frame(&conn) {
            let parts = wire::decode_request(&frame).expect("decode request");
            assert_eq!(parts.method_name, "add");
            assert_eq!(parts.signature_hash, Add::signature_hash());
            let args: AddArgs = postcard::from_bytes(&parts.args).expect("decode args");
            seen_ids.push(parts.id.as_u32());
            reply_ok(&conn, parts.id, &(args.a + args.b));
        }
        seen_ids
    })
}

#[test]
fn happy_call_resolves_to_sum() {
    init_test_tracing();
    let (listener, addr) = listen();
    let server = spawn_adder(listener);

    {
        let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
        let calculator = client.remote("calculator");
        assert_eq!(calculator.call::<Add>(&AddArgs { a: 2, b: 3 }).unwrap(), 5);
    }
    let ids = server.join().unwrap();
    assert_eq!(ids, vec![0]);
}

#[test]
fn request_ids_are_strictly_increasing() {
    init_test_tracing();
    let (listener, addr) = listen();
    let server = spawn_adder(listener);

    {
        let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
        let calculator: Calculator = client.proxy("calculator");
        for i in 0..5u32 {
            assert_eq!(calculator.add(i, 1).unwrap(), i + 1);
        }
    }
    let ids = server.join().unwrap();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
}

#[test]
fn concurrent_calls_multiplex_and_match_by_id() {
    init_test_tracing();
    let (listener, addr) = listen();

    // Collect all requests first, then answer them in reverse order so
    // the test proves dispatch is by request id, not arrival order.
    let server = thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept");
        let mut requests = Vec::new();
        for _ in 0..4 {
            let frame = packet::receive_frame(&conn).expect("receive");
            let parts = wire::decode_request(&frame).expect("decode");
            let args: AddArgs = postcard::from_bytes(&parts.args).expect("args");
            requests.push((parts.id, args));
        }
        for (id, args) in requests.into_iter().rev() {
            reply_ok(&conn, id, &(args.a + args.b));
        }
        // Hold the connection until the client disconnects.
        let _ = packet::receive_frame(&conn);
    });

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let calculator = client.remote("calculator");
    let futures: Vec<_> = (0..4u32)
        .map(|i| calculator.async_call::<Add>(&AddArgs { a: i, b: 100 }).unwrap())
        .collect();
    for (i, (future, _id)) in futures.into_iter().enumerate() {
        assert_eq!(future.get().unwrap(), i as u32 + 100);
    }
    drop(client);
    server.join().unwrap();
}

#[test]
fn concurrent_senders_never_interleave_frames() {
    init_test_tracing();
    let (listener, addr) = listen();

    // Every request must decode cleanly: a torn or interleaved frame
    // would fail the peer's strict decode immediately.
    let server = thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept");
        for _ in 0..8 {
            let frame = packet::receive_frame(&conn).expect("receive");
            let parts = wire::decode_request(&frame).expect("decode");
            let args: AddArgs = postcard::from_bytes(&parts.args).expect("args");
            reply_ok(&conn, parts.id, &(args.a + args.b));
        }
        let _ = packet::receive_frame(&conn);
    });

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let calculator = client.remote("calculator");
    let callers: Vec<_> = (0..8u32)
        .map(|i| {
            let calculator = calculator.clone();
            thread::spawn(move || calculator.call::<Add>(&AddArgs { a: i, b: 1000 }))
        })
        .collect();
    for (i, caller) in callers.into_iter().enumerate() {
        assert_eq!(caller.join().unwrap().unwrap(), i as u32 + 1000);
    }
    drop(client);
    server.join().unwrap();
}

#[test]
fn deadline_fails_call_and_discards_late_response() {
    init_test_tracing();
    let (listener, addr) = listen();

    let server = thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept");
        // First request: answer far too late.
        let frame = packet::receive_frame(&conn).expect("receive");
        let first = wire::decode_request(&frame).expect("decode");
        assert!(first.context.deadline_left.is_some(), "deadline must propagate");

        // Second request arrives while we still owe the first answer.
        let frame = packet::receive_frame(&conn).expect("receive");
        let second = wire::decode_request(&frame).expect("decode");

        // Late answer for the expired id, then the real one.
        reply_ok(&conn, first.id, &0xdead_u32);
        let args: AddArgs = postcard::from_bytes(&second.args).expect("args");
        reply_ok(&conn, second.id, &(args.a + args.b));
        let _ = packet::receive_frame(&conn);
    });

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let calculator = client.remote("calculator");

    let ctx = Context::new().unwrap();
    ctx.set_timeout(Duration::from_millis(80));
    let started = Instant::now();
    let err = calculator.call::<Add>(&AddArgs { a: 1, b: 1 }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(80), "failed early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2000), "failed late: {elapsed:?}");
    drop(ctx);

    // The late response for the expired id has no observable effect; the
    // next call works and gets its own answer.
    assert_eq!(calculator.call::<Add>(&AddArgs { a: 20, b: 2 }).unwrap(), 22);
    drop(client);
    server.join().unwrap();
}

#[test]
fn user_cancellation_fails_call_and_emits_cancel_frame() {
    init_test_tracing();
    let (listener, addr) = listen();

    let server = thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept");
        let frame = packet::receive_frame(&conn).expect("receive request");
        let parts = wire::decode_request(&frame).expect("decode");

        // Never answer; wait for the out-of-band cancel instead.
        let frame = packet::receive_frame(&conn).expect("receive cancel");
        let (header, _) = wire::decode_header(&frame).expect("decode cancel");
        assert_eq!(header.kind, MessageKind::CancelRequest);
        assert_eq!(header.id, parts.id);
    });

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let calculator = client.remote("calculator");

    let ctx = Context::new().unwrap();
    let handle = Context::current();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        handle.cancel();
    });

    let err = calculator.call::<Add>(&AddArgs { a: 1, b: 2 }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    canceller.join().unwrap();
    server.join().unwrap();
    drop(ctx);
}

#[test]
fn io_error_fails_in_flight_calls_and_reconnect_succeeds() {
    init_test_tracing();
    let (listener, addr) = listen();

    let server = thread::spawn(move || {
        // First connection: swallow two requests, then slam the door.
        let (conn, _) = listener.accept().expect("accept first");
        let _ = packet::receive_frame(&conn).expect("first request");
        let _ = packet::receive_frame(&conn).expect("second request");
        drop(conn);

        // Second connection: behave.
        let (conn, _) = listener.accept().expect("accept second");
        let frame = packet::receive_frame(&conn).expect("receive");
        let parts = wire::decode_request(&frame).expect("decode");
        let args: AddArgs = postcard::from_bytes(&parts.args).expect("args");
        reply_ok(&conn, parts.id, &(args.a + args.b));
        let _ = packet::receive_frame(&conn);
    });

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let calculator = client.remote("calculator");

    let (first, _) = calculator.async_call::<Add>(&AddArgs { a: 1, b: 1 }).unwrap();
    let (second, _) = calculator.async_call::<Add>(&AddArgs { a: 2, b: 2 }).unwrap();
    assert_eq!(first.get().unwrap_err().kind(), ErrorKind::Io);
    assert_eq!(second.get().unwrap_err().kind(), ErrorKind::Io);

    // The engine reconnects transparently on the next call. The server
    // may need a moment to reach its second accept.
    let mut answer = None;
    for _ in 0..50 {
        match calculator.call::<Add>(&AddArgs { a: 3, b: 4 }) {
            Ok(v) => {
                answer = Some(v);
                break;
            }
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
    assert_eq!(answer, Some(7));
    drop(client);
    server.join().unwrap();
}

#[test]
fn corrupted_frame_is_fatal_for_the_connection() {
    init_test_tracing();
    let (listener, addr) = listen();

    let server = thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept first");
        let frame = packet::receive_frame(&conn).expect("receive");
        let parts = wire::decode_request(&frame).expect("decode");

        // A well-formed response frame, then one bit flipped in the
        // length field before it hits the wire.
        let payload = wire::encode_response(parts.id, &WireResult::Ok(vec![1, 0, 0, 0]));
        let len_bytes = (payload.len() as u32).to_le_bytes();
        let check = crc32c::crc32c_append(crc32c::crc32c(&len_bytes), &payload);
        let mut raw = Vec::new();
        raw.extend_from_slice(&len_bytes);
        raw.extend_from_slice(&payload);
        raw.extend_from_slice(&check.to_le_bytes());
        raw[0] ^= 0x02;
        conn.write_all(&raw).expect("send corrupted frame");

        // Second connection: behave.
        let (conn, _) = listener.accept().expect("accept second");
        let frame = packet::receive_frame(&conn).expect("receive");
        let parts = wire::decode_request(&frame).expect("decode");
        let args: AddArgs = postcard::from_bytes(&parts.args).expect("args");
        reply_ok(&conn, parts.id, &(args.a + args.b));
        let _ = packet::receive_frame(&conn);
    });

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let calculator = client.remote("calculator");

    let err = calculator.call::<Add>(&AddArgs { a: 1, b: 1 }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataMismatch);

    let mut answer = None;
    for _ in 0..50 {
        match calculator.call::<Add>(&AddArgs { a: 30, b: 12 }) {
            Ok(v) => {
                answer = Some(v);
                break;
            }
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
    assert_eq!(answer, Some(42));
    drop(client);
    server.join().unwrap();
}

#[test]
fn shielded_context_ignores_parent_deadline() {
    init_test_tracing();
    let (listener, addr) = listen();

    let server = thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept");
        let frame = packet::receive_frame(&conn).expect("receive");
        let parts = wire::decode_request(&frame).expect("decode");
        // The shielded child's own generous deadline travelled, not the
        // parent's expired one.
        let left = parts.context.deadline_left.expect("deadline propagates");
        assert!(left > Duration::from_millis(500), "parent deadline leaked: {left:?}");

        thread::sleep(Duration::from_millis(150));
        let args: AddArgs = postcard::from_bytes(&parts.args).expect("args");
        reply_ok(&conn, parts.id, &(args.a + args.b));
        let _ = packet::receive_frame(&conn);
    });

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let calculator = client.remote("calculator");

    let parent = Context::new().unwrap();
    parent.set_timeout(Duration::from_millis(50));
    {
        let shielded = Context::shielded().unwrap();
        shielded.set_timeout(Duration::from_secs(2));
        let started = Instant::now();
        assert_eq!(calculator.call::<Add>(&AddArgs { a: 4, b: 4 }).unwrap(), 8);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
    drop(parent);
    drop(client);
    server.join().unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TraceTag {
    request_source: String,
}

impl rhea::Portable for TraceTag {
    const PORTABLE_NAME: &'static str = "trace_tag";
}

#[test]
fn context_values_ride_the_request() {
    init_test_tracing();
    rhea::register_portable::<TraceTag>();
    let (listener, addr) = listen();

    let server = thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept");
        let frame = packet::receive_frame(&conn).expect("receive");
        let parts = wire::decode_request(&frame).expect("decode");

        // Rebuild the caller's context from the record and read the tag.
        let ctx = Context::with_options(&Context::top(), false, false).expect("peer context");
        ctx.apply(&parts.context).expect("apply record");
        assert_eq!(ctx.get::<TraceTag>().request_source, "integration-test");

        let args: AddArgs = postcard::from_bytes(&parts.args).expect("args");
        reply_ok(&conn, parts.id, &(args.a + args.b));
        let _ = packet::receive_frame(&conn);
    });

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let calculator = client.remote("calculator");

    let ctx = Context::new().unwrap();
    ctx.set(TraceTag { request_source: "integration-test".into() });
    assert_eq!(calculator.call::<Add>(&AddArgs { a: 6, b: 7 }).unwrap(), 13);
    drop(ctx);
    drop(client);
    server.join().unwrap();
}

#[test]
fn remote_error_kinds_survive_the_wire() {
    init_test_tracing();
    let (listener, addr) = listen();

    let server = thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept");
        let frame = packet::receive_frame(&conn).expect("receive");
        let parts = wire::decode_request(&frame).expect("decode");
        reply_err(&conn, parts.id, "io_error", "disk on fire");

        let frame = packet::receive_frame(&conn).expect("receive");
        let parts = wire::decode_request(&frame).expect("decode");
        reply_err(&conn, parts.id, "quota_exhausted", "too many calls");
        let _ = packet::receive_frame(&conn);
    });

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let calculator = client.remote("calculator");

    let err = calculator.call::<Add>(&AddArgs { a: 1, b: 1 }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(err.message(), "disk on fire");

    // Unknown kinds degrade to internal_error but keep the evidence.
    let err = calculator.call::<Add>(&AddArgs { a: 1, b: 1 }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.message().contains("quota_exhausted"));
    drop(client);
    server.join().unwrap();
}

#[test]
fn per_proxy_timeout_overrides_engine_default() {
    init_test_tracing();
    let (listener, addr) = listen();

    let server = thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept");
        // Read the request and never answer.
        let _ = packet::receive_frame(&conn).expect("receive");
        let _ = packet::receive_frame(&conn);
    });

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let calculator = client.remote_with_options(
        "calculator",
        ClientOptions { request_timeout: Some(Duration::from_millis(60)) },
    );

    let started = Instant::now();
    let err = calculator.call::<Add>(&AddArgs { a: 1, b: 1 }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert!(started.elapsed() >= Duration::from_millis(60));
    drop(client);
    server.join().unwrap();
}

#[test]
fn dropping_the_client_fails_pending_calls() {
    init_test_tracing();
    let (listener, addr) = listen();

    let server = thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept");
        let _ = packet::receive_frame(&conn).expect("receive");
        // Never answer; hold until the client tears down.
        let _ = packet::receive_frame(&conn);
    });

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let calculator = client.remote("calculator");
    let (future, _) = calculator.async_call::<Add>(&AddArgs { a: 1, b: 1 }).unwrap();

    let waiter = thread::spawn(move || future.get());
    thread::sleep(Duration::from_millis(30));
    drop(client);

    let err = waiter.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    server.join().unwrap();
}
