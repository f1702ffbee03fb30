//! # Peer-to-Peer Co-op Synchronization Core
//!
//! This library keeps two independently-simulated game worlds converged
//! over a direct peer-to-peer channel with no ordering or delivery
//! guarantees. It is consumed by the game loop; it has no binaries, no
//! persistence, and exactly two participants per session.
//!
//! ## Architecture
//!
//! Four layers, leaves first:
//!
//! - **Transport** (`transport`): a single point-to-point, message-oriented
//!   binding (UDP for real play, an in-process pair for tests). Unordered,
//!   best-effort; `send` never blocks and a full buffer drops the datagram.
//! - **Session** (`session`): owns the one active binding, drives the
//!   connection state machine, and pumps inbound messages to handlers from
//!   the game loop's single simulation thread. The side that creates the
//!   session is the host; roles never change.
//! - **Replication** (`replication`): host-authoritative state model. The
//!   host broadcasts enemy snapshots; each player broadcasts its own state;
//!   projectiles are announced once at spawn and simulated independently
//!   from identical initial conditions. Snapshots carry monotonic sequence
//!   numbers so a late-arriving older snapshot never overwrites a newer one.
//! - **Health** (`health`): initiator-driven ping/pong with a single
//!   most-recent RTT sample, silence detection (a silently-dead peer is
//!   noticed even when the transport never reports closure), and the
//!   bounded, backed-off reconnection policy.
//!
//! ## Signaling boundary
//!
//! Establishing a session requires exchanging two opaque blobs out-of-band
//! (clipboard, QR code, a lobby server): the host's offer and the client's
//! answer. How those blobs travel is outside this core.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use peer::{Session, SessionConfig, UdpDialer};
//! use std::time::Instant;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Host side: share `offer` with the other player, feed their answer back.
//! let (mut session, offer) = Session::create_as_host(
//!     SessionConfig::default(),
//!     Box::new(UdpDialer::new("0.0.0.0:0")),
//! )?;
//! # let answer_from_peer = offer.clone();
//! session.complete_handshake(&answer_from_peer)?;
//!
//! // Per game tick:
//! let now = Instant::now();
//! session.tick(now);
//! for _event in session.drain_game_events() {
//!     // apply to the world, idempotently
//! }
//! let _remote = session.remote_players();
//! let _rtt = session.latency_ms();
//! # Ok(())
//! # }
//! ```

pub mod health;
pub mod replication;
pub mod session;
pub mod transport;

pub use replication::{RemoteEnemy, RemotePlayer};
pub use session::{
    ConnectionState, Role, Session, SessionConfig, SessionError, SessionEvent,
};
pub use transport::{
    memory_pair, Dialer, MemoryDialer, MemoryTransport, StatusHandle, Transport,
    TransportError, TransportStatus, UdpDialer, UdpTransport,
};
