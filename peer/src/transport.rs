//! Point-to-point transport bindings with unordered, best-effort delivery
//!
//! A transport carries opaque datagrams between exactly two peers. It makes
//! no ordering or delivery promises; everything above it is written to
//! tolerate loss, duplication, and reordering. Two bindings are provided:
//! a UDP binding for real play and an in-process binding for tests and
//! local loopback, with a configurable loss mode.

use log::{debug, error};
use protocol::MAX_MESSAGE_SIZE;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Lifecycle of a single binding as reported by the transport itself.
/// These events are not always timely; the health monitor covers the gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// Bound locally, remote endpoint not yet known.
    Connecting,
    /// Remote endpoint known; datagrams flow.
    Open,
    /// Transient interruption; the binding may still recover.
    Disconnected,
    /// Released by the local side. Terminal.
    Closed,
    /// Unrecoverable transport fault. Terminal.
    Failed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(#[from] std::io::Error),

    #[error("malformed endpoint descriptor")]
    Endpoint,

    #[error("send buffer full, datagram dropped")]
    BufferFull,

    #[error("transport is closed")]
    Closed,
}

/// A single point-to-point, message-oriented channel.
///
/// `send` must never block: a full buffer fails fast and the datagram is
/// dropped, consistent with the unreliable-delivery contract. `try_recv`
/// is drained from the simulation tick; the transport's own receive path
/// never mutates shared state directly.
pub trait Transport: Send {
    /// Opaque descriptor of the local end, embedded in offers/answers and
    /// carried to the other peer out-of-band.
    fn local_endpoint(&self) -> Result<Vec<u8>, TransportError>;

    /// Points this binding at the remote end described by `endpoint`.
    fn connect(&mut self, endpoint: &[u8]) -> Result<(), TransportError>;

    fn status(&self) -> TransportStatus;

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    fn try_recv(&mut self) -> Option<Vec<u8>>;

    fn close(&mut self);
}

/// Produces a fresh [`Transport`] per call. Reconnection never reuses a
/// binding: each attempt fully closes the old one and dials a new one.
pub trait Dialer: Send {
    fn dial(&mut self) -> Result<Box<dyn Transport>, TransportError>;
}

fn encode_addr(addr: &SocketAddr) -> Result<Vec<u8>, TransportError> {
    bincode::serialize(addr).map_err(|_| TransportError::Endpoint)
}

fn decode_addr(bytes: &[u8]) -> Result<SocketAddr, TransportError> {
    bincode::deserialize(bytes).map_err(|_| TransportError::Endpoint)
}

/// UDP binding. A spawned task reads datagrams off the socket and hands
/// them to an unbounded channel; the tick thread drains that channel via
/// `try_recv`. Must be constructed inside a tokio runtime.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    peer: Option<SocketAddr>,
    rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
    recv_task: JoinHandle<()>,
    status: TransportStatus,
}

impl UdpTransport {
    /// Binds a local socket and starts the receive task.
    pub fn bind(addr: &str) -> Result<Self, TransportError> {
        let std_socket = std::net::UdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local_addr = socket.local_addr()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let recv_task = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                let mut buffer = [0u8; MAX_MESSAGE_SIZE];
                loop {
                    match socket.recv_from(&mut buffer).await {
                        Ok((len, addr)) => {
                            if tx.send((addr, buffer[..len].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!("udp receive error: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            })
        };

        debug!("udp transport bound to {}", local_addr);

        Ok(UdpTransport {
            socket,
            local_addr,
            peer: None,
            rx,
            recv_task,
            status: TransportStatus::Connecting,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for UdpTransport {
    fn local_endpoint(&self) -> Result<Vec<u8>, TransportError> {
        encode_addr(&self.local_addr)
    }

    fn connect(&mut self, endpoint: &[u8]) -> Result<(), TransportError> {
        if self.status == TransportStatus::Closed {
            return Err(TransportError::Closed);
        }
        let addr = decode_addr(endpoint)?;
        self.peer = Some(addr);
        self.status = TransportStatus::Open;
        debug!("udp transport connected to {}", addr);
        Ok(())
    }

    fn status(&self) -> TransportStatus {
        self.status
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.status == TransportStatus::Closed {
            return Err(TransportError::Closed);
        }
        let peer = self.peer.ok_or(TransportError::Closed)?;
        match self.socket.try_send_to(data, peer) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(TransportError::BufferFull)
            }
            Err(e) => Err(TransportError::Setup(e)),
        }
    }

    fn try_recv(&mut self) -> Option<Vec<u8>> {
        if self.status == TransportStatus::Closed {
            return None;
        }
        loop {
            let (addr, data) = self.rx.try_recv().ok()?;
            let Some(peer) = self.peer else {
                debug!("dropping datagram from {}: no peer yet", addr);
                continue;
            };
            // Match on IP only: a reconnecting peer comes back from a new
            // ephemeral port. Latch onto the port it is actually using.
            if addr.ip() != peer.ip() {
                debug!("dropping datagram from unexpected source {}", addr);
                continue;
            }
            if addr != peer {
                self.peer = Some(addr);
            }
            return Some(data);
        }
    }

    fn close(&mut self) {
        if self.status != TransportStatus::Closed {
            self.recv_task.abort();
            self.status = TransportStatus::Closed;
            debug!("udp transport on {} closed", self.local_addr);
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Dials fresh UDP bindings against a fixed local bind address. Binding to
/// port 0 gives every attempt its own ephemeral port.
pub struct UdpDialer {
    bind_addr: String,
}

impl UdpDialer {
    pub fn new(bind_addr: &str) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
        }
    }
}

impl Dialer for UdpDialer {
    fn dial(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(UdpTransport::bind(&self.bind_addr)?))
    }
}

/// Shared view of a [`MemoryTransport`]'s status. Cloneable, so a test can
/// keep injecting transport-reported transitions after the transport has
/// been boxed and handed to a session.
#[derive(Clone)]
pub struct StatusHandle(Arc<AtomicU8>);

impl StatusHandle {
    fn new(status: TransportStatus) -> Self {
        Self(Arc::new(AtomicU8::new(status as u8)))
    }

    pub fn set(&self, status: TransportStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    fn get(&self) -> TransportStatus {
        match self.0.load(Ordering::SeqCst) {
            0 => TransportStatus::Connecting,
            1 => TransportStatus::Open,
            2 => TransportStatus::Disconnected,
            3 => TransportStatus::Closed,
            _ => TransportStatus::Failed,
        }
    }
}

/// In-process binding over a pair of channels. Pre-wired: both ends start
/// `Open` and endpoint descriptors are empty. Supports simulated loss and
/// injected status transitions.
pub struct MemoryTransport {
    tx: std_mpsc::Sender<Vec<u8>>,
    rx: std_mpsc::Receiver<Vec<u8>>,
    status: StatusHandle,
    /// When set, every Nth outbound datagram is silently dropped.
    drop_every: Option<u32>,
    send_count: u32,
}

/// Creates a connected pair of in-process transports.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (tx_a, rx_b) = std_mpsc::channel();
    let (tx_b, rx_a) = std_mpsc::channel();

    let a = MemoryTransport {
        tx: tx_a,
        rx: rx_a,
        status: StatusHandle::new(TransportStatus::Open),
        drop_every: None,
        send_count: 0,
    };
    let b = MemoryTransport {
        tx: tx_b,
        rx: rx_b,
        status: StatusHandle::new(TransportStatus::Open),
        drop_every: None,
        send_count: 0,
    };
    (a, b)
}

impl MemoryTransport {
    /// Silently drops every `n`th outbound datagram.
    pub fn set_drop_every(&mut self, n: u32) {
        self.drop_every = Some(n.max(1));
    }

    /// Handle for injecting transport-reported interruptions, valid even
    /// after the transport itself has been handed off.
    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }
}

impl Transport for MemoryTransport {
    fn local_endpoint(&self) -> Result<Vec<u8>, TransportError> {
        Ok(Vec::new())
    }

    fn connect(&mut self, _endpoint: &[u8]) -> Result<(), TransportError> {
        if self.status.get() == TransportStatus::Closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn status(&self) -> TransportStatus {
        self.status.get()
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.status.get() == TransportStatus::Closed {
            return Err(TransportError::Closed);
        }
        self.send_count += 1;
        if let Some(n) = self.drop_every {
            if self.send_count % n == 0 {
                return Ok(());
            }
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    fn try_recv(&mut self) -> Option<Vec<u8>> {
        if self.status.get() == TransportStatus::Closed {
            return None;
        }
        self.rx.try_recv().ok()
    }

    fn close(&mut self) {
        self.status.set(TransportStatus::Closed);
    }
}

/// Dials from a pre-built queue of transports. Each dial consumes one;
/// an empty queue fails the attempt.
pub struct MemoryDialer {
    pending: Vec<MemoryTransport>,
}

impl MemoryDialer {
    /// Transports are consumed in the order given.
    pub fn new(transports: Vec<MemoryTransport>) -> Self {
        let mut pending = transports;
        pending.reverse();
        Self { pending }
    }
}

impl Dialer for MemoryDialer {
    fn dial(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        match self.pending.pop() {
            Some(t) => Ok(Box::new(t)),
            None => Err(TransportError::Closed),
        }
    }
}
