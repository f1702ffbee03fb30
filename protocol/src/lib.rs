use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Interval between periodic snapshot publishes (local player, enemies).
pub const STATE_PUBLISH_INTERVAL_MS: u64 = 80;
/// Interval between heartbeat pings once a session is connected.
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;
/// Silence for this many heartbeat intervals counts as a dead peer.
pub const MISSED_HEARTBEAT_LIMIT: u32 = 3;
/// Upper bound on session re-creation attempts after a lost connection.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Base delay before the first reconnect attempt; doubles per attempt.
pub const RECONNECT_BACKOFF_BASE_MS: u64 = 500;
/// Largest datagram the receive path will buffer.
pub const MAX_MESSAGE_SIZE: usize = 2048;

pub type PlayerId = u32;
pub type EnemyId = u32;
pub type Seq = u32;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Left,
    Right,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LifeState {
    Alive,
    Dead,
}

/// One player's replicated state. Each player is authoritative for its own
/// snapshot regardless of session role.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub id: PlayerId,
    pub x: f32,
    pub y: f32,
    pub health: i32,
    pub facing: Facing,
    pub life: LifeState,
}

impl PlayerSnapshot {
    pub fn new(id: PlayerId, x: f32, y: f32, health: i32) -> Self {
        Self {
            id,
            x,
            y,
            health,
            facing: Facing::Right,
            life: LifeState::Alive,
        }
    }
}

/// One enemy's replicated state. Only the host originates these; enemy ids
/// are stable for the lifetime of an encounter.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EnemySnapshot {
    pub id: EnemyId,
    pub x: f32,
    pub y: f32,
    pub health: i32,
    pub facing: Facing,
}

/// Initial conditions of a projectile, sent once at spawn time. Both sides
/// simulate its motion independently from these values.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Projectile {
    /// Per-owner spawn counter, used to discard duplicate deliveries.
    pub seq: Seq,
    pub owner: PlayerId,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub kind: u8,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum GameEventKind {
    Kill,
    Pickup,
    PlayerDeath,
    Revive,
}

/// One-shot gameplay notification. The receiving game loop applies these
/// idempotently (a pickup for an already-removed pickup is a no-op).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GameEvent {
    pub kind: GameEventKind,
    /// Id of the affected entity (enemy, pickup, or player depending on kind).
    pub target: u32,
}

/// The closed set of messages exchanged between the two peers. Carried over
/// an unordered, best-effort channel: no delivery or ordering guarantee.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Message {
    PlayerState { seq: Seq, player: PlayerSnapshot },
    EnemyState { seq: Seq, enemy: EnemySnapshot },
    ProjectileSpawn { projectile: Projectile },
    GameEvent { event: GameEvent },
    Ping { sent_at: u64 },
    Pong { sent_at: u64 },
    Chat { text: String },
    ReadyState { ready: bool },
    GameStart,
}

/// Failed to serialize an outbound message.
#[derive(Debug, Error)]
#[error("failed to encode message: {0}")]
pub struct EncodeError(#[from] bincode::Error);

/// Inbound bytes did not parse as a known message. Expected background noise
/// on an unreliable channel; receivers drop these, they are never a
/// connection fault.
#[derive(Debug, Error)]
#[error("failed to decode message: {0}")]
pub struct DecodeError(#[from] bincode::Error);

/// Serializes a message into a self-describing datagram payload.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    Ok(bincode::serialize(message)?)
}

/// Parses a datagram payload back into a message.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_player_snapshot_creation() {
        let snap = PlayerSnapshot::new(1, 100.0, 200.0, 80);
        assert_eq!(snap.id, 1);
        assert_eq!(snap.x, 100.0);
        assert_eq!(snap.y, 200.0);
        assert_eq!(snap.health, 80);
        assert_eq!(snap.facing, Facing::Right);
        assert_eq!(snap.life, LifeState::Alive);
    }

    #[test]
    fn test_player_state_roundtrip() {
        let message = Message::PlayerState {
            seq: 42,
            player: PlayerSnapshot::new(7, 12.5, -3.0, 100),
        };

        let bytes = encode(&message).unwrap();
        let decoded = decode(&bytes).unwrap();

        match decoded {
            Message::PlayerState { seq, player } => {
                assert_eq!(seq, 42);
                assert_eq!(player.id, 7);
                assert_approx_eq!(player.x, 12.5, 1e-6);
                assert_approx_eq!(player.y, -3.0, 1e-6);
                assert_eq!(player.health, 100);
            }
            _ => panic!("Wrong message kind after decode"),
        }
    }

    #[test]
    fn test_enemy_state_roundtrip() {
        let message = Message::EnemyState {
            seq: 9,
            enemy: EnemySnapshot {
                id: 0,
                x: 400.0,
                y: 300.0,
                health: 80,
                facing: Facing::Left,
            },
        };

        let bytes = encode(&message).unwrap();
        match decode(&bytes).unwrap() {
            Message::EnemyState { seq, enemy } => {
                assert_eq!(seq, 9);
                assert_eq!(enemy.id, 0);
                assert_eq!(enemy.health, 80);
                assert_eq!(enemy.facing, Facing::Left);
            }
            _ => panic!("Wrong message kind after decode"),
        }
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let ping = Message::Ping { sent_at: 123456789 };
        let bytes = encode(&ping).unwrap();

        match decode(&bytes).unwrap() {
            Message::Ping { sent_at } => assert_eq!(sent_at, 123456789),
            _ => panic!("Wrong message kind after decode"),
        }
    }

    #[test]
    fn test_game_event_roundtrip() {
        let message = Message::GameEvent {
            event: GameEvent {
                kind: GameEventKind::Pickup,
                target: 5,
            },
        };

        let bytes = encode(&message).unwrap();
        match decode(&bytes).unwrap() {
            Message::GameEvent { event } => {
                assert_eq!(event.kind, GameEventKind::Pickup);
                assert_eq!(event.target, 5);
            }
            _ => panic!("Wrong message kind after decode"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // Truncated / corrupt datagrams must surface as DecodeError, not panic.
        assert!(decode(&[]).is_err());
        assert!(decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());

        let valid = encode(&Message::GameStart).unwrap();
        assert!(decode(&valid[..valid.len() / 2]).is_err());
    }

    #[test]
    fn test_messages_fit_in_datagram_budget() {
        let messages = vec![
            Message::PlayerState {
                seq: u32::MAX,
                player: PlayerSnapshot::new(u32::MAX, 1e9, -1e9, i32::MIN),
            },
            Message::ProjectileSpawn {
                projectile: Projectile {
                    seq: u32::MAX,
                    owner: 1,
                    x: 0.0,
                    y: 0.0,
                    vel_x: 900.0,
                    vel_y: -450.0,
                    kind: 255,
                },
            },
            Message::Chat {
                text: "x".repeat(256),
            },
        ];

        for message in messages {
            let bytes = encode(&message).unwrap();
            assert!(bytes.len() < MAX_MESSAGE_SIZE);
        }
    }
}
