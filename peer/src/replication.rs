//! Host-authoritative state replication
//!
//! Two independent simulations stay converged by exchanging full snapshots:
//! each player broadcasts its own state, the host additionally broadcasts
//! enemy state, and projectiles are sent once at spawn and then simulated
//! identically on both sides. Every handler is safe under loss, duplication,
//! and reordering: snapshots overwrite unconditionally but carry a monotonic
//! sequence number, and anything older than the snapshot already applied for
//! that id is discarded.
//!
//! Full-state broadcast over delta encoding is deliberate: the session is
//! exactly two peers and the snapshots are small, so gap detection and diff
//! reconciliation would cost more than they save.

use log::debug;
use protocol::{
    EnemyId, EnemySnapshot, GameEvent, Message, PlayerId, PlayerSnapshot, Projectile, Seq,
};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::session::Role;

/// Last known state of one remote player. Created on the first snapshot
/// referencing an unseen id and kept until the session closes; a missed
/// update never removes it.
#[derive(Debug, Clone)]
pub struct RemotePlayer {
    pub snapshot: PlayerSnapshot,
    seq: Seq,
}

/// Last known state of one host-authoritative enemy, as seen by a client.
#[derive(Debug, Clone)]
pub struct RemoteEnemy {
    pub snapshot: EnemySnapshot,
    seq: Seq,
}

/// Spawns delayed more than this many seqs behind the newest one seen are
/// treated as already applied.
const PROJECTILE_DEDUPE_WINDOW: Seq = 64;

/// Per-owner record of applied projectile spawns: a high-water mark plus a
/// short trailing set, pruned as the mark advances, so the tracking stays
/// bounded for the life of the session.
struct SpawnWindow {
    high: Seq,
    recent: HashSet<Seq>,
}

impl SpawnWindow {
    fn new() -> Self {
        Self {
            high: 0,
            recent: HashSet::new(),
        }
    }

    /// True exactly once per seq inside the window.
    fn accept(&mut self, seq: Seq) -> bool {
        if seq <= self.high.saturating_sub(PROJECTILE_DEDUPE_WINDOW) {
            return false;
        }
        if !self.recent.insert(seq) {
            return false;
        }
        if seq > self.high {
            self.high = seq;
            let floor = self.high.saturating_sub(PROJECTILE_DEDUPE_WINDOW);
            self.recent.retain(|s| *s > floor);
        }
        true
    }
}

pub struct Replicator {
    publish_interval: Duration,
    last_player_publish: Option<Instant>,
    last_enemy_publish: Option<Instant>,
    player_seq: Seq,
    enemy_seq: Seq,
    projectile_seq: Seq,

    remote_players: HashMap<PlayerId, RemotePlayer>,
    enemies: HashMap<EnemyId, RemoteEnemy>,
    seen_projectiles: HashMap<PlayerId, SpawnWindow>,
    pending_projectiles: Vec<Projectile>,
    pending_events: Vec<GameEvent>,
    pending_chat: Vec<String>,
    remote_ready: bool,
    game_started: bool,
}

impl Replicator {
    pub fn new(publish_interval: Duration) -> Self {
        Self {
            publish_interval,
            last_player_publish: None,
            last_enemy_publish: None,
            player_seq: 0,
            enemy_seq: 0,
            projectile_seq: 0,
            remote_players: HashMap::new(),
            enemies: HashMap::new(),
            seen_projectiles: HashMap::new(),
            pending_projectiles: Vec::new(),
            pending_events: Vec::new(),
            pending_chat: Vec::new(),
            remote_ready: false,
            game_started: false,
        }
    }

    /// Stamps and returns the next local-player snapshot message, or `None`
    /// if the publish interval has not elapsed. Callers may invoke this
    /// every frame; the rate limit bounds bandwidth regardless.
    pub fn next_player_state(
        &mut self,
        snapshot: PlayerSnapshot,
        now: Instant,
    ) -> Option<Message> {
        if !self.publish_due(self.last_player_publish, now) {
            return None;
        }
        self.last_player_publish = Some(now);
        self.player_seq += 1;
        Some(Message::PlayerState {
            seq: self.player_seq,
            player: snapshot,
        })
    }

    /// Stamps one message per enemy at the publish cadence. Returns an
    /// empty vec when the interval has not elapsed.
    pub fn next_enemy_states(
        &mut self,
        enemies: &[EnemySnapshot],
        now: Instant,
    ) -> Vec<Message> {
        if enemies.is_empty() || !self.publish_due(self.last_enemy_publish, now) {
            return Vec::new();
        }
        self.last_enemy_publish = Some(now);
        enemies
            .iter()
            .map(|enemy| {
                self.enemy_seq += 1;
                Message::EnemyState {
                    seq: self.enemy_seq,
                    enemy: enemy.clone(),
                }
            })
            .collect()
    }

    /// Stamps a spawn message. Sent once per projectile, never per frame;
    /// motion after spawn is simulated from the same initial conditions on
    /// both sides.
    pub fn next_projectile(&mut self, mut projectile: Projectile) -> Message {
        self.projectile_seq += 1;
        projectile.seq = self.projectile_seq;
        Message::ProjectileSpawn { projectile }
    }

    fn publish_due(&self, last: Option<Instant>, now: Instant) -> bool {
        last.map_or(true, |t| now.duration_since(t) >= self.publish_interval)
    }

    /// Applies a remote player snapshot, last-writer-wins by sequence.
    pub fn apply_player_state(&mut self, seq: Seq, player: PlayerSnapshot) {
        let id = player.id;
        match self.remote_players.get_mut(&id) {
            Some(existing) => {
                if seq > existing.seq {
                    existing.snapshot = player;
                    existing.seq = seq;
                } else {
                    debug!("discarding stale player snapshot for {} (seq {})", id, seq);
                }
            }
            None => {
                self.remote_players
                    .insert(id, RemotePlayer { snapshot: player, seq });
            }
        }
    }

    /// Applies a host-authoritative enemy snapshot. A host never accepts
    /// enemy truth from its client; such messages are dropped whole.
    pub fn apply_enemy_state(&mut self, seq: Seq, enemy: EnemySnapshot, local_role: Role) {
        if local_role == Role::Host {
            debug!("host ignoring enemy state from client (enemy {})", enemy.id);
            return;
        }
        let id = enemy.id;
        match self.enemies.get_mut(&id) {
            Some(existing) => {
                if seq > existing.seq {
                    existing.snapshot = enemy;
                    existing.seq = seq;
                } else {
                    debug!("discarding stale enemy snapshot for {} (seq {})", id, seq);
                }
            }
            None => {
                self.enemies.insert(id, RemoteEnemy { snapshot: enemy, seq });
            }
        }
    }

    /// Queues a remote projectile spawn. The transport may duplicate or
    /// badly delay datagrams; spawns already applied, or older than the
    /// dedupe window, are dropped by (owner, seq).
    pub fn apply_projectile(&mut self, projectile: Projectile) {
        let window = self
            .seen_projectiles
            .entry(projectile.owner)
            .or_insert_with(SpawnWindow::new);
        if !window.accept(projectile.seq) {
            debug!(
                "discarding duplicate projectile spawn ({}, {})",
                projectile.owner, projectile.seq
            );
            return;
        }
        self.pending_projectiles.push(projectile);
    }

    pub fn apply_event(&mut self, event: GameEvent) {
        self.pending_events.push(event);
    }

    pub fn apply_chat(&mut self, text: String) {
        self.pending_chat.push(text);
    }

    pub fn apply_ready(&mut self, ready: bool) {
        self.remote_ready = ready;
    }

    pub fn apply_game_start(&mut self) {
        self.game_started = true;
    }

    pub fn mark_game_started(&mut self) {
        self.game_started = true;
    }

    /// Current map of remote player snapshots, read per tick by the game loop.
    pub fn remote_players(&self) -> &HashMap<PlayerId, RemotePlayer> {
        &self.remote_players
    }

    /// Client-side view of the host's enemies. Empty on the host.
    pub fn enemies(&self) -> &HashMap<EnemyId, RemoteEnemy> {
        &self.enemies
    }

    /// Takes the projectile spawns applied since the last drain.
    pub fn drain_projectiles(&mut self) -> Vec<Projectile> {
        std::mem::take(&mut self.pending_projectiles)
    }

    /// Takes the game events applied since the last drain.
    pub fn drain_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn drain_chat(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_chat)
    }

    pub fn remote_ready(&self) -> bool {
        self.remote_ready
    }

    pub fn game_started(&self) -> bool {
        self.game_started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Facing, GameEventKind};

    fn replicator() -> Replicator {
        Replicator::new(Duration::from_millis(80))
    }

    fn enemy(id: EnemyId, health: i32) -> EnemySnapshot {
        EnemySnapshot {
            id,
            x: 100.0,
            y: 50.0,
            health,
            facing: Facing::Left,
        }
    }

    #[test]
    fn test_player_publish_rate_limited() {
        let mut rep = replicator();
        let t0 = Instant::now();
        let snap = PlayerSnapshot::new(1, 0.0, 0.0, 100);

        assert!(rep.next_player_state(snap.clone(), t0).is_some());
        // Same frame and the next few frames are silently suppressed.
        assert!(rep.next_player_state(snap.clone(), t0).is_none());
        assert!(rep
            .next_player_state(snap.clone(), t0 + Duration::from_millis(40))
            .is_none());
        assert!(rep
            .next_player_state(snap, t0 + Duration::from_millis(80))
            .is_some());
    }

    #[test]
    fn test_player_seq_increases_per_publish() {
        let mut rep = replicator();
        let t0 = Instant::now();
        let snap = PlayerSnapshot::new(1, 0.0, 0.0, 100);

        let first = rep.next_player_state(snap.clone(), t0).unwrap();
        let second = rep
            .next_player_state(snap, t0 + Duration::from_millis(100))
            .unwrap();

        match (first, second) {
            (Message::PlayerState { seq: a, .. }, Message::PlayerState { seq: b, .. }) => {
                assert!(b > a);
            }
            _ => panic!("Wrong message kinds"),
        }
    }

    #[test]
    fn test_reordered_snapshots_converge_to_newest() {
        // Applying in any order must match applying in sent order: only the
        // highest sequence survives.
        let mut in_order = replicator();
        let mut shuffled = replicator();

        let snaps: Vec<(Seq, PlayerSnapshot)> = (1..=5)
            .map(|seq| (seq, PlayerSnapshot::new(2, seq as f32 * 10.0, 0.0, 100)))
            .collect();

        for (seq, snap) in &snaps {
            in_order.apply_player_state(*seq, snap.clone());
        }
        for idx in [2usize, 0, 4, 1, 3] {
            let (seq, snap) = &snaps[idx];
            shuffled.apply_player_state(*seq, snap.clone());
        }

        let a = &in_order.remote_players()[&2].snapshot;
        let b = &shuffled.remote_players()[&2].snapshot;
        assert_eq!(a, b);
        assert_eq!(b.x, 50.0);
    }

    #[test]
    fn test_duplicate_snapshot_is_ignored() {
        let mut rep = replicator();
        rep.apply_player_state(3, PlayerSnapshot::new(1, 30.0, 0.0, 90));
        rep.apply_player_state(3, PlayerSnapshot::new(1, 99.0, 0.0, 10));

        assert_eq!(rep.remote_players()[&1].snapshot.x, 30.0);
        assert_eq!(rep.remote_players()[&1].snapshot.health, 90);
    }

    #[test]
    fn test_missed_update_keeps_player_entry() {
        let mut rep = replicator();
        rep.apply_player_state(1, PlayerSnapshot::new(1, 5.0, 0.0, 100));

        // Silence is not removal; the entry survives until session close.
        assert!(rep.remote_players().contains_key(&1));
    }

    #[test]
    fn test_host_ignores_enemy_state() {
        let mut rep = replicator();
        rep.apply_enemy_state(1, enemy(0, 80), Role::Host);
        assert!(rep.enemies().is_empty());

        rep.apply_enemy_state(1, enemy(0, 80), Role::Client);
        assert_eq!(rep.enemies()[&0].snapshot.health, 80);
    }

    #[test]
    fn test_stale_enemy_snapshot_discarded() {
        let mut rep = replicator();
        rep.apply_enemy_state(5, enemy(0, 40), Role::Client);
        rep.apply_enemy_state(2, enemy(0, 100), Role::Client);

        assert_eq!(rep.enemies()[&0].snapshot.health, 40);
    }

    #[test]
    fn test_enemy_batch_respects_cadence() {
        let mut rep = replicator();
        let t0 = Instant::now();
        let batch = vec![enemy(0, 100), enemy(1, 100)];

        assert_eq!(rep.next_enemy_states(&batch, t0).len(), 2);
        assert!(rep.next_enemy_states(&batch, t0).is_empty());
        assert_eq!(
            rep.next_enemy_states(&batch, t0 + Duration::from_millis(80)).len(),
            2
        );
    }

    #[test]
    fn test_projectile_duplicate_delivery_dropped() {
        let mut sender = replicator();
        let mut receiver = replicator();

        let spawn = Projectile {
            seq: 0,
            owner: 1,
            x: 0.0,
            y: 0.0,
            vel_x: 500.0,
            vel_y: 0.0,
            kind: 2,
        };
        let message = sender.next_projectile(spawn);

        let projectile = match message {
            Message::ProjectileSpawn { projectile } => projectile,
            _ => panic!("Wrong message kind"),
        };

        receiver.apply_projectile(projectile.clone());
        receiver.apply_projectile(projectile);

        assert_eq!(receiver.drain_projectiles().len(), 1);
        assert!(receiver.drain_projectiles().is_empty());
    }

    #[test]
    fn test_projectile_dedupe_window_is_bounded() {
        let mut rep = replicator();
        let spawn = |seq: Seq| Projectile {
            seq,
            owner: 1,
            x: 0.0,
            y: 0.0,
            vel_x: 100.0,
            vel_y: 0.0,
            kind: 0,
        };

        for seq in (1..=500).filter(|s| *s != 450) {
            rep.apply_projectile(spawn(seq));
        }
        assert_eq!(rep.drain_projectiles().len(), 499);

        // Tracking stays bounded no matter how many spawns went through.
        assert!(rep.seen_projectiles[&1].recent.len() <= 65);

        // A reordered delivery inside the window is still accepted, once.
        rep.apply_projectile(spawn(450));
        assert_eq!(rep.drain_projectiles().len(), 1);
        rep.apply_projectile(spawn(450));
        assert!(rep.drain_projectiles().is_empty());

        // Anything at or below the window floor counts as already seen.
        rep.apply_projectile(spawn(10));
        assert!(rep.drain_projectiles().is_empty());
    }

    #[test]
    fn test_event_queue_drains_once() {
        let mut rep = replicator();
        rep.apply_event(GameEvent {
            kind: GameEventKind::Kill,
            target: 3,
        });
        rep.apply_event(GameEvent {
            kind: GameEventKind::Pickup,
            target: 7,
        });

        let events = rep.drain_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, GameEventKind::Kill);
        assert!(rep.drain_events().is_empty());
    }

    #[test]
    fn test_ready_and_start_latches() {
        let mut rep = replicator();
        assert!(!rep.remote_ready());
        assert!(!rep.game_started());

        rep.apply_ready(true);
        rep.apply_game_start();
        assert!(rep.remote_ready());
        assert!(rep.game_started());

        rep.apply_ready(false);
        assert!(!rep.remote_ready());
        assert!(rep.game_started());
    }
}
