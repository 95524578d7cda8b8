//! Stream connections: a connected socket, a reconnecting wrapper, and
//! packet framing on top.
//!
//! The layering mirrors the protocol stack bottom-up: a
//! [`SocketConnection`] owns one live [`Channel`]; a
//! [`ReconnectableConnection`] owns a [`Connector`] that can mint a fresh
//! link whenever the previous one died; a [`PacketConnection`] frames
//! whole messages over whichever link is current, with one lock per
//! direction so senders and the receiver never block each other.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::awaitable::Awaitable;
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::packet;
use crate::sync::lock;
use crate::trace::debug;

/// Produces a fresh connection on demand.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> Result<SocketConnection>;
}

/// Connects a TCP stream to a fixed address, with Nagle disabled so
/// small request frames leave promptly.
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> Result<SocketConnection> {
        let channel = Channel::connect_tcp(&self.addr)?;
        channel.set_no_delay(true)?;
        debug!(addr = %self.addr, "connected");
        Ok(SocketConnection::new(channel))
    }
}

/// One live stream link.
pub struct SocketConnection {
    channel: Channel,
}

impl SocketConnection {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Wakes anything blocked on this link; the fd closes once the last
    /// reference drops.
    pub fn disconnect(&self) {
        self.channel.shutdown_both();
    }

    /// Fires when the link has bytes (or a hangup) to deliver.
    pub fn data_available(&self) -> Awaitable<'static, ()> {
        self.channel.can_read()
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

struct Link {
    state: LinkState,
    current: Option<Arc<SocketConnection>>,
}

/// Wraps a [`Connector`] so the connection transparently reopens on the
/// next use after a failure.
///
/// The current link is shared out as an `Arc`: I/O runs without holding
/// the slot lock, so a blocked receive never stalls `disconnect` or a
/// sender, and `disconnect` wakes the receiver through the socket
/// shutdown.
pub struct ReconnectableConnection {
    connector: Box<dyn Connector>,
    link: Mutex<Link>,
}

impl ReconnectableConnection {
    pub fn new(connector: impl Connector) -> Self {
        Self {
            connector: Box::new(connector),
            link: Mutex::new(Link { state: LinkState::Disconnected, current: None }),
        }
    }

    /// Ensures a live link, dialing the connector when there is none.
    /// On failure the state returns to disconnected and the error is
    /// reported to the caller.
    pub fn connect(&self) -> Result<()> {
        let mut link = lock(&self.link);
        if link.state == LinkState::Connected && link.current.is_some() {
            return Ok(());
        }
        link.state = LinkState::Connecting;
        match self.connector.connect() {
            Ok(conn) => {
                link.current = Some(Arc::new(conn));
                link.state = LinkState::Connected;
                Ok(())
            }
            Err(e) => {
                link.current = None;
                link.state = LinkState::Disconnected;
                Err(e)
            }
        }
    }

    /// Tears down the current link (if any) and returns to disconnected.
    pub fn disconnect(&self) {
        let mut link = lock(&self.link);
        if let Some(conn) = link.current.take() {
            conn.disconnect();
        }
        link.state = LinkState::Disconnected;
    }

    pub fn state(&self) -> LinkState {
        lock(&self.link).state
    }

    pub fn connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// The current link, to run I/O on without holding the slot lock.
    fn current(&self) -> Result<Arc<SocketConnection>> {
        lock(&self.link)
            .current
            .clone()
            .ok_or_else(|| Error::not_connected("connection is closed"))
    }
}

/// Whole-message framing over a reconnectable link.
///
/// Two directional locks serialize concurrent senders and concurrent
/// receivers independently; the directions never block each other.
pub struct PacketConnection {
    link: ReconnectableConnection,
    send_mu: Mutex<()>,
    recv_mu: Mutex<()>,
}

impl PacketConnection {
    pub fn new(connector: impl Connector) -> Self {
        Self {
            link: ReconnectableConnection::new(connector),
            send_mu: Mutex::new(()),
            recv_mu: Mutex::new(()),
        }
    }

    pub fn connect(&self) -> Result<()> {
        self.link.connect()
    }

    pub fn disconnect(&self) {
        self.link.disconnect();
    }

    pub fn connected(&self) -> bool {
        self.link.connected()
    }

    /// Sends one framed message atomically with respect to other senders.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let _sending = lock(&self.send_mu);
        let conn = self.link.current()?;
        packet::send_frame(conn.channel(), payload)
    }

    /// Receives one framed message; blocks cooperatively until a full
    /// frame arrives.
    pub fn receive(&self) -> Result<Vec<u8>> {
        let _receiving = lock(&self.recv_mu);
        let conn = self.link.current()?;
        packet::receive_frame(conn.channel())
    }
}
