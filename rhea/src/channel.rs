//! Owned file descriptor with non-blocking I/O and socket operations.
//!
//! Every fd held by a [`Channel`] is non-blocking; the blocking entry
//! points (`read`, `write_all`, `connect`, `accept`) suspend through
//! [`select`](crate::select::select) and therefore observe the calling
//! thread's context cancellation and deadline.

use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use rustix::net::{
    AddressFamily, SocketAddrAny, SocketFlags, SocketType,
};

use crate::awaitable::Awaitable;
use crate::error::{Error, Result};
use crate::select::wait_one;

const DEFAULT_BACKLOG: i32 = 10;

/// A non-blocking stream socket (or any byte-stream fd).
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
}

fn any_to_addr(addr: SocketAddrAny) -> Option<SocketAddr> {
    match addr {
        SocketAddrAny::V4(a) => Some(SocketAddr::V4(a)),
        SocketAddrAny::V6(a) => Some(SocketAddr::V6(a)),
        _ => None,
    }
}

fn tcp_socket(addr: &SocketAddr) -> Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::INET,
        SocketAddr::V6(_) => AddressFamily::INET6,
    };
    let fd = rustix::net::socket_with(
        family,
        SocketType::STREAM,
        SocketFlags::CLOEXEC | SocketFlags::NONBLOCK,
        None,
    )?;
    Ok(fd)
}

impl Channel {
    /// Wraps an already-open stream fd, switching it to non-blocking.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let flags = rustix::fs::fcntl_getfl(&fd)?;
        rustix::fs::fcntl_setfl(&fd, flags | rustix::fs::OFlags::NONBLOCK)?;
        Ok(Self { fd })
    }

    /// Opens a TCP connection to `addr`. Blocks cooperatively until the
    /// connect completes or fails.
    pub fn connect_tcp(addr: &SocketAddr) -> Result<Self> {
        let channel = Self { fd: tcp_socket(addr)? };
        let started = match addr {
            SocketAddr::V4(a) => rustix::net::connect_v4(&channel.fd, a),
            SocketAddr::V6(a) => rustix::net::connect_v6(&channel.fd, a),
        };
        match started {
            Ok(()) => return Ok(channel),
            Err(e)
                if e == rustix::io::Errno::INPROGRESS
                    || e == rustix::io::Errno::AGAIN
                    || e == rustix::io::Errno::INTR => {}
            Err(e) => return Err(Error::io(format!("connect to {addr} failed: {e}"))),
        }
        // Non-blocking connect: completion is signalled by writability,
        // the verdict by SO_ERROR.
        wait_one(channel.can_write())?;
        match rustix::net::sockopt::get_socket_error(&channel.fd)? {
            Ok(()) => Ok(channel),
            Err(e) => Err(Error::io(format!("connect to {addr} failed: {e}"))),
        }
    }

    /// Binds a TCP listener on `addr`.
    pub fn listen_tcp(addr: &SocketAddr) -> Result<Self> {
        let fd = tcp_socket(addr)?;
        rustix::net::sockopt::set_socket_reuseaddr(&fd, true)?;
        match addr {
            SocketAddr::V4(a) => rustix::net::bind_v4(&fd, a)?,
            SocketAddr::V6(a) => rustix::net::bind_v6(&fd, a)?,
        }
        rustix::net::listen(&fd, DEFAULT_BACKLOG)?;
        Ok(Self { fd })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = rustix::net::getsockname(&self.fd)?;
        any_to_addr(addr).ok_or_else(|| Error::io("socket has a non-IP local address"))
    }

    /// Non-blocking accept; `try_again` when no connection is pending.
    pub fn maybe_accept(&self) -> Result<(Channel, SocketAddr)> {
        let (fd, addr) = rustix::net::acceptfrom_with(
            &self.fd,
            SocketFlags::CLOEXEC | SocketFlags::NONBLOCK,
        )?;
        let peer = addr
            .and_then(any_to_addr)
            .ok_or_else(|| Error::io("accepted socket has a non-IP peer address"))?;
        Ok((Channel { fd }, peer))
    }

    /// Blocks cooperatively until a connection arrives.
    pub fn accept(&self) -> Result<(Channel, SocketAddr)> {
        wait_one(self.can_read().then(move |()| self.maybe_accept()))
    }

    /// Non-blocking read. `Ok(0)` is end-of-stream; `try_again` when no
    /// data is available.
    pub fn maybe_read(&self, buf: &mut [u8]) -> Result<usize> {
        match rustix::io::read(&self.fd, buf) {
            Ok(n) => Ok(n),
            Err(e) if e == rustix::io::Errno::INTR => Err(Error::try_again("read interrupted")),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Non-blocking write; `try_again` when the send buffer is full.
    pub fn maybe_write(&self, buf: &[u8]) -> Result<usize> {
        match rustix::io::write(&self.fd, buf) {
            Ok(n) => Ok(n),
            Err(e) if e == rustix::io::Errno::INTR => Err(Error::try_again("write interrupted")),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Fires when the fd has data (or error/hangup) to report.
    pub fn can_read(&self) -> Awaitable<'static, ()> {
        Awaitable::readable(self.fd.as_raw_fd())
    }

    /// Fires when the fd can accept writes.
    pub fn can_write(&self) -> Awaitable<'static, ()> {
        Awaitable::writable(self.fd.as_raw_fd())
    }

    /// Fires with the count of bytes read into `buf`.
    pub fn async_read<'a>(&'a self, buf: &'a mut [u8]) -> Awaitable<'a, usize> {
        self.can_read().then(move |()| self.maybe_read(buf))
    }

    /// Fires with the count of bytes written from `buf`.
    pub fn async_write<'a>(&'a self, buf: &'a [u8]) -> Awaitable<'a, usize> {
        self.can_write().then(move |()| self.maybe_write(buf))
    }

    /// Blocking read of at least one byte (zero at end-of-stream).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        wait_one(self.async_read(buf))
    }

    /// Reads until `buf` is full; end-of-stream midway is an `io_error`.
    pub fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => return Err(Error::io("connection closed by peer")),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Writes all of `buf`, suspending while the socket is congested.
    pub fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            written += wait_one(self.async_write(&buf[written..]))?;
        }
        Ok(())
    }

    /// Shuts down both directions, waking any thread blocked on this fd.
    /// The descriptor itself closes on drop.
    pub fn shutdown_both(&self) {
        let _ = rustix::net::shutdown(&self.fd, rustix::net::Shutdown::ReadWrite);
    }

    pub fn set_no_delay(&self, enable: bool) -> Result<()> {
        rustix::net::sockopt::set_tcp_nodelay(&self.fd, enable)?;
        Ok(())
    }

    pub fn set_keep_alive(&self, enable: bool) -> Result<()> {
        rustix::net::sockopt::set_socket_keepalive(&self.fd, enable)?;
        Ok(())
    }

    pub fn set_reuse_addr(&self, enable: bool) -> Result<()> {
        rustix::net::sockopt::set_socket_reuseaddr(&self.fd, enable)?;
        Ok(())
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
