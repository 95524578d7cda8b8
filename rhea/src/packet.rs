//! Length-prefixed, integrity-checked framing over a byte stream.
//!
//! One frame on the wire:
//!
//! ```text
//! ┌────────────┬─────────────────────┬──────────────┐
//! │ length: u32│ payload: length B   │ crc32c: u32  │
//! └────────────┴─────────────────────┴──────────────┘
//! ```
//!
//! All integers little-endian. The checksum covers the length bytes and
//! the payload, so a corrupted length is caught as reliably as corrupted
//! data. Both peers must agree on the check; CRC32C is the fixed choice
//! here (width K = 4).

use crate::channel::Channel;
use crate::error::{Error, Result};

/// Frames cannot exceed `i32::MAX` payload bytes; longer (or sign-bit
/// corrupted) lengths are rejected before any allocation happens.
pub const MAX_FRAME_LEN: usize = i32::MAX as usize;

/// Width of the integrity check, in bytes.
pub const CHECK_LEN: usize = 4;

/// Writes one frame. The payload travels as a single atomic unit; the
/// caller serializes concurrent senders.
pub fn send_frame(channel: &Channel, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::data_mismatch(format!(
            "frame payload too large: {} bytes",
            payload.len()
        )));
    }
    let len_bytes = (payload.len() as u32).to_le_bytes();
    let check = crc32c::crc32c_append(crc32c::crc32c(&len_bytes), payload);

    let mut frame = Vec::with_capacity(len_bytes.len() + payload.len() + CHECK_LEN);
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&check.to_le_bytes());
    channel.write_all(&frame)
}

/// Reads one frame, verifying length bounds and the checksum. Corruption
/// is a `data_mismatch` failure, which callers treat as fatal for the
/// connection.
pub fn receive_frame(channel: &Channel) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    channel.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::data_mismatch(format!("frame length out of range: {len}")));
    }

    let mut payload = vec![0u8; len];
    channel.read_exact(&mut payload)?;

    let mut check_bytes = [0u8; CHECK_LEN];
    channel.read_exact(&mut check_bytes)?;
    let received = u32::from_le_bytes(check_bytes);
    let computed = crc32c::crc32c_append(crc32c::crc32c(&len_bytes), &payload);
    if received != computed {
        return Err(Error::data_mismatch(format!(
            "frame checksum mismatch: expected {computed:#010x}, got {received:#010x}"
        )));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn socket_pair() -> (Channel, Channel) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = Channel::listen_tcp(&addr).unwrap();
        let local = listener.local_addr().unwrap();
        let client = Channel::connect_tcp(&local).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn frame_roundtrip() {
        let (tx, rx) = socket_pair();
        for payload in [&b""[..], b"x", b"hello frame", &[0u8; 4096][..]] {
            send_frame(&tx, payload).unwrap();
            assert_eq!(receive_frame(&rx).unwrap(), payload);
        }
    }

    #[test]
    fn payload_bit_flip_is_detected() {
        let (tx, rx) = socket_pair();

        // Hand-build the frame and corrupt one payload bit.
        let payload = b"important bytes";
        let len_bytes = (payload.len() as u32).to_le_bytes();
        let check = crc32c::crc32c_append(crc32c::crc32c(&len_bytes), payload);
        let mut frame = Vec::new();
        frame.extend_from_slice(&len_bytes);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&check.to_le_bytes());
        frame[4] ^= 0x01;
        tx.write_all(&frame).unwrap();

        let err = receive_frame(&rx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataMismatch);
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let (tx, rx) = socket_pair();
        // Length field with the sign bit set, as a single bit flip in a
        // small frame's length would produce.
        let bogus = (u32::MAX).to_le_bytes();
        tx.write_all(&bogus).unwrap();
        let err = receive_frame(&rx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataMismatch);
    }

    #[test]
    fn truncated_stream_is_io_error() {
        let (tx, rx) = socket_pair();
        tx.write_all(&8u32.to_le_bytes()).unwrap();
        tx.write_all(b"shor").unwrap();
        drop(tx);
        let err = receive_frame(&rx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
