//! Session lifecycle, connection roles, and the message pump
//!
//! A session owns exactly one transport binding at a time and drives the
//! connection state machine:
//!
//! ```text
//! Idle -> Handshaking -> Establishing -> Connected <-> Degraded -> Closed
//! ```
//!
//! `Closed` is terminal. Renegotiating a half-dead channel in place is not
//! reliable across peers, so a lost connection is handled by discarding the
//! binding and dialing a fresh one, up to a bounded number of attempts with
//! exponential backoff.
//!
//! The session is owned by the game loop's network-update step and pumped
//! from a single logical thread via [`Session::tick`]; the transport's
//! receive task only ever hands bytes to a queue, never touches state.

use log::{debug, info, warn};
use protocol::{
    EnemySnapshot, GameEvent, Message, PlayerId, PlayerSnapshot, Projectile,
    HEARTBEAT_INTERVAL_MS, MAX_RECONNECT_ATTEMPTS, MISSED_HEARTBEAT_LIMIT,
    RECONNECT_BACKOFF_BASE_MS, STATE_PUBLISH_INTERVAL_MS,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::health::HealthMonitor;
use crate::replication::{RemoteEnemy, RemotePlayer, Replicator};
use crate::transport::{Dialer, Transport, TransportError, TransportStatus};

/// Which side of the session this peer is. Fixed at creation: the side
/// that creates the session (and the offer) is the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Handshaking,
    Establishing,
    Connected,
    Degraded,
    Closed,
}

/// Notifications surfaced to the game loop, drained once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Degraded,
    ReconnectScheduled { attempt: u32 },
    /// Terminal: retries exhausted or no reconnect possible.
    Disconnected,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed session offer")]
    OfferDecode,

    #[error("malformed session answer")]
    AnswerDecode,

    #[error("answer is for room {got}, expected {expected}")]
    RoomCodeMismatch { expected: String, got: String },

    #[error("operation is only valid for the {0:?} role")]
    RoleMismatch(Role),

    #[error("session is closed")]
    Closed,
}

/// Handshake payload produced by the host, carried to the other peer
/// out-of-band (clipboard, QR code, lobby) as an opaque blob.
#[derive(Debug, Serialize, Deserialize)]
struct SessionOffer {
    room_code: String,
    endpoint: Vec<u8>,
}

/// Handshake payload produced by the joining client, returned to the host
/// out-of-band.
#[derive(Debug, Serialize, Deserialize)]
struct SessionAnswer {
    room_code: String,
    endpoint: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identifier of the locally-owned player.
    pub local_player: PlayerId,
    pub publish_interval: Duration,
    pub heartbeat_interval: Duration,
    pub missed_heartbeat_limit: u32,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_base: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_player: 1,
            publish_interval: Duration::from_millis(STATE_PUBLISH_INTERVAL_MS),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            missed_heartbeat_limit: MISSED_HEARTBEAT_LIMIT,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_backoff_base: Duration::from_millis(RECONNECT_BACKOFF_BASE_MS),
        }
    }
}

// Room codes avoid ambiguous characters (0/O, 1/I/L).
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const ROOM_CODE_LEN: usize = 6;

fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

pub struct Session {
    role: Role,
    state: ConnectionState,
    config: SessionConfig,
    transport: Option<Box<dyn Transport>>,
    dialer: Box<dyn Dialer>,
    room_code: String,
    remote_endpoint: Option<Vec<u8>>,
    replication: Replicator,
    health: HealthMonitor,
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
    events: Vec<SessionEvent>,
}

impl Session {
    fn new(
        role: Role,
        config: SessionConfig,
        dialer: Box<dyn Dialer>,
        transport: Box<dyn Transport>,
        room_code: String,
    ) -> Self {
        let replication = Replicator::new(config.publish_interval);
        let health = HealthMonitor::new(
            config.heartbeat_interval,
            config.missed_heartbeat_limit,
        );
        Self {
            role,
            state: ConnectionState::Idle,
            config,
            transport: Some(transport),
            dialer,
            room_code,
            remote_endpoint: None,
            replication,
            health,
            reconnect_attempts: 0,
            reconnect_at: None,
            events: Vec::new(),
        }
    }

    /// Starts hosting: dials a local binding, generates a shareable room
    /// code, and returns the offer blob to hand to the joining player.
    /// Fails only on local transport initialization; that failure is fatal
    /// and no session is created.
    pub fn create_as_host(
        config: SessionConfig,
        mut dialer: Box<dyn Dialer>,
    ) -> Result<(Self, Vec<u8>), SessionError> {
        let transport = dialer.dial()?;
        let endpoint = transport.local_endpoint()?;
        let room_code = generate_room_code();

        let offer = SessionOffer {
            room_code: room_code.clone(),
            endpoint,
        };
        let blob = bincode::serialize(&offer).map_err(|_| SessionError::OfferDecode)?;

        let mut session = Session::new(Role::Host, config, dialer, transport, room_code);
        session.state = ConnectionState::Handshaking;
        info!("hosting session {}", session.room_code);
        Ok((session, blob))
    }

    /// Joins a hosted session from its offer blob. Returns the answer blob
    /// to hand back to the host. A malformed offer is fatal and no session
    /// is created.
    pub fn join_as_client(
        config: SessionConfig,
        mut dialer: Box<dyn Dialer>,
        offer_blob: &[u8],
    ) -> Result<(Self, Vec<u8>), SessionError> {
        let offer: SessionOffer =
            bincode::deserialize(offer_blob).map_err(|_| SessionError::OfferDecode)?;

        let mut transport = dialer.dial()?;
        transport.connect(&offer.endpoint)?;

        let answer = SessionAnswer {
            room_code: offer.room_code.clone(),
            endpoint: transport.local_endpoint()?,
        };
        let blob = bincode::serialize(&answer).map_err(|_| SessionError::AnswerDecode)?;

        let mut session =
            Session::new(Role::Client, config, dialer, transport, offer.room_code);
        session.remote_endpoint = Some(offer.endpoint);
        session.state = ConnectionState::Handshaking;
        info!("joining session {}", session.room_code);
        Ok((session, blob))
    }

    /// Finalizes the handshake with the client's answer blob. Host only.
    pub fn complete_handshake(&mut self, answer_blob: &[u8]) -> Result<(), SessionError> {
        if self.role != Role::Host {
            return Err(SessionError::RoleMismatch(Role::Host));
        }
        if self.state == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }
        let answer: SessionAnswer =
            bincode::deserialize(answer_blob).map_err(|_| SessionError::AnswerDecode)?;
        if answer.room_code != self.room_code {
            return Err(SessionError::RoomCodeMismatch {
                expected: self.room_code.clone(),
                got: answer.room_code,
            });
        }

        if let Some(transport) = self.transport.as_mut() {
            transport.connect(&answer.endpoint)?;
        }
        self.remote_endpoint = Some(answer.endpoint);
        self.state = ConnectionState::Establishing;
        Ok(())
    }

    /// Sends a message if and only if the session is connected. Anything
    /// else is a silent no-op: intermediate drops are expected on a
    /// best-effort channel, not exceptional.
    pub fn send(&mut self, message: &Message) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match protocol::encode(message) {
            Ok(bytes) => {
                if let Err(e) = transport.send(&bytes) {
                    debug!("dropped outbound message: {}", e);
                }
            }
            Err(e) => warn!("failed to encode outbound message: {}", e),
        }
    }

    /// Pumps the session once: drains and dispatches inbound messages,
    /// folds transport status into the connection state, runs the
    /// heartbeat, and advances the reconnect schedule. Called from the
    /// game loop's tick, on the single simulation thread.
    pub fn tick(&mut self, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }

        if let Some(at) = self.reconnect_at {
            if now >= at {
                self.attempt_reconnect(now);
            }
        }

        self.drain_inbound(now);
        self.sync_transport_state(now);

        if self.state == ConnectionState::Connected && self.role == Role::Host {
            if let Some(ping) = self.health.ping_due(now) {
                self.send(&ping);
            }
        }

        match self.state {
            ConnectionState::Connected | ConnectionState::Degraded => {
                if self.health.timed_out(now) {
                    warn!(
                        "no traffic for {} heartbeat intervals, treating peer as dead",
                        self.config.missed_heartbeat_limit
                    );
                    self.connection_lost(now);
                } else if self.state == ConnectionState::Connected && self.health.silent(now) {
                    debug!("connection degraded: one silent heartbeat interval");
                    self.state = ConnectionState::Degraded;
                    self.events.push(SessionEvent::Degraded);
                }
            }
            _ => {}
        }
    }

    fn drain_inbound(&mut self, now: Instant) {
        let mut inbound = Vec::new();
        if let Some(transport) = self.transport.as_mut() {
            while let Some(bytes) = transport.try_recv() {
                inbound.push(bytes);
            }
        }

        for bytes in inbound {
            let message = match protocol::decode(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    // Corrupt or unrecognized datagrams are channel noise,
                    // never a connection fault.
                    debug!("dropped undecodable datagram: {}", e);
                    continue;
                }
            };

            self.health.note_inbound(now);
            // Inbound traffic is the only proof the peer is alive; a fresh
            // binding merely coming up locally does not refill the budget.
            self.reconnect_attempts = 0;
            if self.state == ConnectionState::Degraded {
                info!("connection recovered");
                self.state = ConnectionState::Connected;
                self.events.push(SessionEvent::Connected);
            }
            self.dispatch(message);
        }
    }

    /// Routes one inbound message. Exhaustive over the message set, so a
    /// new kind is a compile-time change here, not a runtime registration.
    fn dispatch(&mut self, message: Message) {
        match message {
            Message::PlayerState { seq, player } => {
                self.replication.apply_player_state(seq, player);
            }
            Message::EnemyState { seq, enemy } => {
                self.replication.apply_enemy_state(seq, enemy, self.role);
            }
            Message::ProjectileSpawn { projectile } => {
                self.replication.apply_projectile(projectile);
            }
            Message::GameEvent { event } => self.replication.apply_event(event),
            Message::Ping { sent_at } => {
                let pong = HealthMonitor::pong_for(sent_at);
                self.send(&pong);
            }
            Message::Pong { sent_at } => self.health.on_pong(sent_at),
            Message::Chat { text } => self.replication.apply_chat(text),
            Message::ReadyState { ready } => self.replication.apply_ready(ready),
            Message::GameStart => self.replication.apply_game_start(),
        }
    }

    fn sync_transport_state(&mut self, now: Instant) {
        let Some(status) = self.transport.as_ref().map(|t| t.status()) else {
            return;
        };

        match (self.state, status) {
            (
                ConnectionState::Handshaking | ConnectionState::Establishing,
                TransportStatus::Open,
            ) => {
                info!("session {} connected as {:?}", self.room_code, self.role);
                self.state = ConnectionState::Connected;
                self.health.start(now);
                self.events.push(SessionEvent::Connected);
            }
            (ConnectionState::Connected, TransportStatus::Disconnected) => {
                debug!("transport reports transient disconnect");
                self.state = ConnectionState::Degraded;
                self.events.push(SessionEvent::Degraded);
            }
            (ConnectionState::Degraded, TransportStatus::Open) => {
                // Recovery is driven by inbound traffic in drain_inbound;
                // the transport status alone is not proof of life.
            }
            (_, TransportStatus::Closed | TransportStatus::Failed) => {
                warn!("transport reported closure");
                self.connection_lost(now);
            }
            _ => {}
        }
    }

    /// The disconnect path: fully release the current binding, then either
    /// schedule a fresh dial (bounded, backed off) or go terminal.
    fn connection_lost(&mut self, now: Instant) {
        self.health.stop();
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }

        let can_retry = self.remote_endpoint.is_some()
            && self.reconnect_attempts < self.config.max_reconnect_attempts;

        if !can_retry {
            info!("session {} closed: reconnect attempts exhausted", self.room_code);
            self.state = ConnectionState::Closed;
            self.reconnect_at = None;
            self.events.push(SessionEvent::Disconnected);
            return;
        }

        self.reconnect_attempts += 1;
        // Shift capped so an oversized retry budget cannot overflow.
        let exponent = (self.reconnect_attempts - 1).min(16);
        let backoff = self.config.reconnect_backoff_base * (1u32 << exponent);
        self.reconnect_at = Some(now + backoff);
        self.state = ConnectionState::Establishing;
        info!(
            "scheduling reconnect attempt {}/{} in {:?}",
            self.reconnect_attempts, self.config.max_reconnect_attempts, backoff
        );
        self.events.push(SessionEvent::ReconnectScheduled {
            attempt: self.reconnect_attempts,
        });
    }

    fn attempt_reconnect(&mut self, now: Instant) {
        self.reconnect_at = None;
        let Some(endpoint) = self.remote_endpoint.clone() else {
            self.connection_lost(now);
            return;
        };

        match self.dialer.dial() {
            Ok(mut transport) => match transport.connect(&endpoint) {
                Ok(()) => {
                    info!("reconnect attempt {} dialed", self.reconnect_attempts);
                    self.transport = Some(transport);
                    self.state = ConnectionState::Establishing;
                }
                Err(e) => {
                    warn!("reconnect connect failed: {}", e);
                    transport.close();
                    self.connection_lost(now);
                }
            },
            Err(e) => {
                warn!("reconnect dial failed: {}", e);
                self.connection_lost(now);
            }
        }
    }

    /// Releases the transport and stops all periodic activity. Safe to
    /// call from any state; calling it twice is a no-op the second time.
    /// Sends nothing on the possibly-dead channel.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.health.stop();
        self.reconnect_at = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.state = ConnectionState::Closed;
        info!("session {} closed", self.room_code);
    }

    // --- inbound from the game loop, once per tick ---

    /// Publishes the local player's snapshot. Rate-limited internally;
    /// calls before the publish interval has elapsed are silent no-ops.
    pub fn publish_local_player_state(&mut self, snapshot: PlayerSnapshot, now: Instant) {
        if let Some(message) = self.replication.next_player_state(snapshot, now) {
            self.send(&message);
        }
    }

    /// Broadcasts authoritative enemy state. Host only; a client calling
    /// this is a silent no-op.
    pub fn publish_enemy_states(&mut self, enemies: &[EnemySnapshot], now: Instant) {
        if self.role != Role::Host {
            return;
        }
        let messages = self.replication.next_enemy_states(enemies, now);
        for message in messages {
            self.send(&message);
        }
    }

    /// Announces a projectile spawn, once, at creation time. The seq field
    /// is stamped by the session; the caller's value is ignored.
    pub fn publish_projectile_spawn(&mut self, projectile: Projectile) {
        let message = self.replication.next_projectile(projectile);
        self.send(&message);
    }

    pub fn send_game_event(&mut self, event: GameEvent) {
        self.send(&Message::GameEvent { event });
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.send(&Message::ReadyState { ready });
    }

    /// Starts the match. Host only.
    pub fn start_game(&mut self) -> Result<(), SessionError> {
        if self.role != Role::Host {
            return Err(SessionError::RoleMismatch(Role::Host));
        }
        self.send(&Message::GameStart);
        self.replication.mark_game_started();
        Ok(())
    }

    pub fn send_chat(&mut self, text: &str) {
        self.send(&Message::Chat {
            text: text.to_string(),
        });
    }

    // --- read-only view for the game loop ---

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn local_player(&self) -> PlayerId {
        self.config.local_player
    }

    /// Most recent round-trip estimate in milliseconds. Only populated on
    /// the side that drives pings (the host).
    pub fn latency_ms(&self) -> Option<u64> {
        self.health.rtt_ms()
    }

    pub fn remote_players(&self) -> &HashMap<PlayerId, RemotePlayer> {
        self.replication.remote_players()
    }

    pub fn enemies(&self) -> &HashMap<protocol::EnemyId, RemoteEnemy> {
        self.replication.enemies()
    }

    pub fn drain_projectile_spawns(&mut self) -> Vec<Projectile> {
        self.replication.drain_projectiles()
    }

    pub fn drain_game_events(&mut self) -> Vec<GameEvent> {
        self.replication.drain_events()
    }

    pub fn drain_chat(&mut self) -> Vec<String> {
        self.replication.drain_chat()
    }

    pub fn drain_session_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn remote_ready(&self) -> bool {
        self.replication.remote_ready()
    }

    pub fn game_started(&self) -> bool {
        self.replication.game_started()
    }
}
