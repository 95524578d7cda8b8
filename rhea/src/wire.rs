//! RPC message encoding.
//!
//! Every RPC message starts with a one-byte kind tag and a `u32` request
//! id. A `Request` then carries two length-prefixed blocks: the method
//! block (object name, method name, signature hash, caller context) and
//! the argument bytes. A `Response` carries a wire result: ok plus the
//! encoded value, or err plus a portable error-kind name and message.
//! `CancelRequest` is the header alone.
//!
//! All integers are little-endian; strings are u32-length-prefixed UTF-8;
//! optionals are a presence byte followed by the value.

use std::fmt;
use std::time::Duration;

use crate::context::ContextRecord;
use crate::error::{Error, Result};

/// Identifies one in-flight request on a connection. Allocation is
/// strictly increasing for the connection's lifetime; ids are never
/// reused while a pending entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u32);

impl RequestId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message kind tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
    CancelRequest = 2,
}

impl MessageKind {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::CancelRequest),
            other => Err(Error::data_mismatch(format!("unknown message tag: {other:#04x}"))),
        }
    }
}

/// Little-endian writer for wire messages.
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(u8::from(v));
    }

    /// Length-prefixed byte run.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    /// Raw bytes without a length prefix (trailing payloads).
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Little-endian reader; every take checks remaining length and fails
/// with `data_mismatch` on truncation.
pub struct WireReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> WireReader<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::data_mismatch(format!(
                "message truncated: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    pub fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u32(&mut self) -> Result<u32> {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(arr))
    }

    pub fn take_u64(&mut self) -> Result<u64> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn take_bool(&mut self) -> Result<bool> {
        match self.take_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::data_mismatch(format!("invalid bool byte: {other:#04x}"))),
        }
    }

    pub fn take_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.take_u32()? as usize;
        self.take(len)
    }

    pub fn take_str(&mut self) -> Result<&'a str> {
        std::str::from_utf8(self.take_bytes()?)
            .map_err(|_| Error::data_mismatch("string is not valid UTF-8"))
    }

    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.cursor..];
        self.cursor = self.buf.len();
        rest
    }
}

/// Header shared by all message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub id: RequestId,
}

/// Decodes the kind tag and request id, returning how many bytes the
/// header consumed.
pub fn decode_header(buf: &[u8]) -> Result<(MessageHeader, usize)> {
    let mut r = WireReader::new(buf);
    let kind = MessageKind::from_byte(r.take_u8()?)?;
    let id = RequestId::new(r.take_u32()?);
    Ok((MessageHeader { kind, id }, r.position()))
}

fn encode_context(w: &mut WireWriter, record: &ContextRecord) {
    match record.deadline_left {
        Some(left) => {
            w.put_u8(1);
            w.put_u64(left.as_millis() as u64);
        }
        None => w.put_u8(0),
    }
    w.put_u32(record.values.len() as u32);
    for (name, bytes) in &record.values {
        w.put_str(name);
        w.put_bytes(bytes);
    }
    w.put_bool(record.cancelled);
}

fn decode_context(r: &mut WireReader<'_>) -> Result<ContextRecord> {
    let deadline_left = match r.take_u8()? {
        0 => None,
        1 => Some(Duration::from_millis(r.take_u64()?)),
        other => {
            return Err(Error::data_mismatch(format!("invalid option byte: {other:#04x}")))
        }
    };
    let count = r.take_u32()? as usize;
    let mut values = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let name = r.take_str()?.to_string();
        let bytes = r.take_bytes()?.to_vec();
        values.push((name, bytes));
    }
    let cancelled = r.take_bool()?;
    Ok(ContextRecord { deadline_left, values, cancelled })
}

/// Encodes a complete `Request` message.
pub fn encode_request(
    id: RequestId,
    object_name: &str,
    method_name: &str,
    signature_hash: u64,
    context: &ContextRecord,
    args: &[u8],
) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u8(MessageKind::Request as u8);
    w.put_u32(id.as_u32());

    let mut method_block = WireWriter::new();
    method_block.put_str(object_name);
    method_block.put_str(method_name);
    method_block.put_u64(signature_hash);
    encode_context(&mut method_block, context);
    w.put_bytes(&method_block.into_bytes());

    w.put_bytes(args);
    w.into_bytes()
}

/// A decoded `Request`, for peers dispatching calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParts {
    pub id: RequestId,
    pub object_name: String,
    pub method_name: String,
    pub signature_hash: u64,
    pub context: ContextRecord,
    pub args: Vec<u8>,
}

/// Decodes a complete `Request` message.
pub fn decode_request(buf: &[u8]) -> Result<RequestParts> {
    let (header, consumed) = decode_header(buf)?;
    if header.kind != MessageKind::Request {
        return Err(Error::data_mismatch("message is not a request"));
    }
    let mut r = WireReader::new(&buf[consumed..]);
    let method_block = r.take_bytes()?;
    let args = r.take_bytes()?.to_vec();

    let mut m = WireReader::new(method_block);
    let object_name = m.take_str()?.to_string();
    let method_name = m.take_str()?.to_string();
    let signature_hash = m.take_u64()?;
    let context = decode_context(&mut m)?;

    Ok(RequestParts { id: header.id, object_name, method_name, signature_hash, context, args })
}

/// The tagged outcome carried by a `Response`.
#[derive(Debug, Clone, PartialEq)]
pub enum WireResult {
    /// Encoded return value.
    Ok(Vec<u8>),
    /// Portable error-kind name plus message.
    Err { kind_name: String, message: String },
}

const RESULT_OK: u8 = 0;
const RESULT_ERR: u8 = 1;

/// Encodes a complete `Response` message.
pub fn encode_response(id: RequestId, result: &WireResult) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u8(MessageKind::Response as u8);
    w.put_u32(id.as_u32());
    match result {
        WireResult::Ok(value) => {
            w.put_u8(RESULT_OK);
            w.put_raw(value);
        }
        WireResult::Err { kind_name, message } => {
            w.put_u8(RESULT_ERR);
            w.put_str(kind_name);
            w.put_str(message);
        }
    }
    w.into_bytes()
}

/// Decodes the result bytes of a `Response` (everything after the
/// header).
pub fn decode_result(payload: &[u8]) -> Result<WireResult> {
    let mut r = WireReader::new(payload);
    match r.take_u8()? {
        RESULT_OK => Ok(WireResult::Ok(r.take_rest().to_vec())),
        RESULT_ERR => {
            let kind_name = r.take_str()?.to_string();
            let message = r.take_str()?.to_string();
            Ok(WireResult::Err { kind_name, message })
        }
        other => Err(Error::data_mismatch(format!("invalid result tag: {other:#04x}"))),
    }
}

/// Encodes a complete `CancelRequest` message.
pub fn encode_cancel_request(id: RequestId) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u8(MessageKind::CancelRequest as u8);
    w.put_u32(id.as_u32());
    w.into_bytes()
}
