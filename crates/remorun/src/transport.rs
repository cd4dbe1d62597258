//! # Transport Abstraction
//!
//! A minimal, async interface for moving packets between execution contexts.
//!
//! ## Philosophy
//!
//! - **Packet-Oriented**: The Transport knows nothing about runners, handshakes or
//!   correlation. It moves actions and their transfer lists, in order.
//! - **Duplex**: Either side may send at any time. Request-response is built on
//!   top of this by the action controller, not defined here.
//! - **Movable**: A `Port` is itself transferable, so a link can be handed to
//!   another context inside a packet.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::action::Packet;
use crate::signal::Flag;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// This side closed the transport.
    Closed,
    /// The peer is unreachable or the link was dropped.
    ConnectionLost(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Transport closed"),
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A duplex link carrying packets.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues a packet for the peer. Never waits on the peer.
    fn send(&self, packet: Packet) -> Result<()>;

    /// Waits for the next packet.
    ///
    /// # invariants
    /// - Returns `Ok(None)` once the link is closed from either side.
    /// - Must be cancel-safe: dropping the future loses no packet.
    async fn recv(&self) -> Result<Option<Packet>>;

    /// Puts a received packet back in front of the queue. The next `recv`,
    /// from this reader or whoever takes the link over, returns it first.
    fn unread(&self, packet: Packet);

    /// Closes the link. The peer observes end-of-stream.
    fn close(&self);

    /// Exposes the link as a movable `Port`, if it is one.
    fn as_port(&self) -> Option<Port> {
        None
    }
}

/// One end of an in-memory duplex link.
///
/// Clones share the same end. Messages sent on one end of a `pair()` appear on
/// the other end's `recv()` and vice versa.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

struct PortInner {
    tx: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    /// Packets handed back with `unread`, drained before `rx`.
    unread: Mutex<VecDeque<Packet>>,
    closed: Flag,
}

impl Port {
    /// Creates a pair of ports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self::from_parts(tx_a, rx_b);
        let b = Self::from_parts(tx_b, rx_a);

        (a, b)
    }

    fn from_parts(tx: mpsc::UnboundedSender<Packet>, rx: mpsc::UnboundedReceiver<Packet>) -> Self {
        Self {
            inner: Arc::new(PortInner {
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                unread: Mutex::new(VecDeque::new()),
                closed: Flag::new(),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_raised()
    }

    /// True when both handles refer to the same end.
    pub fn same_end(&self, other: &Port) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait::async_trait]
impl Transport for Port {
    fn send(&self, packet: Packet) -> Result<()> {
        let tx = self.inner.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx
                .send(packet)
                .map_err(|_| Error::ConnectionLost("Channel closed".into())),
            None => Err(Error::Closed),
        }
    }

    async fn recv(&self) -> Result<Option<Packet>> {
        if self.inner.closed.is_raised() {
            return Ok(None);
        }

        if let Some(packet) = self.inner.unread.lock().pop_front() {
            return Ok(Some(packet));
        }

        let closed = self.inner.closed.wait();
        let mut rx = self.inner.rx.lock().await;
        // Someone may have unread while we queued for the receiver.
        if let Some(packet) = self.inner.unread.lock().pop_front() {
            return Ok(Some(packet));
        }
        tokio::select! {
            _ = closed => {
                rx.close();
                Ok(None)
            }
            packet = rx.recv() => Ok(packet),
        }
    }

    fn unread(&self, packet: Packet) {
        self.inner.unread.lock().push_front(packet);
    }

    fn close(&self) {
        self.inner.tx.lock().take();
        self.inner.closed.raise();
        // A pending recv() holds the receiver and closes it when it wakes.
        if let Ok(mut rx) = self.inner.rx.try_lock() {
            rx.close();
        }
    }

    fn as_port(&self) -> Option<Port> {
        Some(self.clone())
    }
}
