//! Liveness probing, latency estimation, and silence detection
//!
//! The transport's own closed/failed events are not always timely, so the
//! session also watches for silence: if nothing at all arrives for a few
//! heartbeat intervals the peer is treated as dead. The RTT estimate is a
//! single most-recent sample; it is advisory (UI) only and never used for
//! simulation timing.

use protocol::Message;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, the timestamp format carried in pings.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

pub struct HealthMonitor {
    heartbeat_interval: Duration,
    missed_limit: u32,
    active: bool,
    last_inbound: Option<Instant>,
    last_ping: Option<Instant>,
    rtt_ms: Option<u64>,
}

impl HealthMonitor {
    pub fn new(heartbeat_interval: Duration, missed_limit: u32) -> Self {
        Self {
            heartbeat_interval,
            missed_limit,
            active: false,
            last_inbound: None,
            last_ping: None,
            rtt_ms: None,
        }
    }

    /// Arms the heartbeat. Called when the session reaches `Connected`.
    pub fn start(&mut self, now: Instant) {
        self.active = true;
        self.last_inbound = Some(now);
        self.last_ping = None;
    }

    /// Disarms the heartbeat. No pings are emitted and no timeout fires
    /// until the next `start`.
    pub fn stop(&mut self) {
        self.active = false;
        self.last_ping = None;
    }

    /// Any inbound message counts as proof of life, not just pongs.
    pub fn note_inbound(&mut self, now: Instant) {
        self.last_inbound = Some(now);
    }

    /// Returns the next ping to emit, if one is due. Only the session
    /// initiator calls this; the other side just echoes.
    pub fn ping_due(&mut self, now: Instant) -> Option<Message> {
        if !self.active {
            return None;
        }
        let due = self
            .last_ping
            .map_or(true, |t| now.duration_since(t) >= self.heartbeat_interval);
        if !due {
            return None;
        }
        self.last_ping = Some(now);
        Some(Message::Ping {
            sent_at: unix_millis(),
        })
    }

    /// Echo reply for an inbound ping: the original timestamp, untouched.
    pub fn pong_for(sent_at: u64) -> Message {
        Message::Pong { sent_at }
    }

    pub fn on_pong(&mut self, sent_at: u64) {
        self.rtt_ms = Some(unix_millis().saturating_sub(sent_at));
    }

    /// Most recent round-trip estimate, if any pong has arrived.
    pub fn rtt_ms(&self) -> Option<u64> {
        self.rtt_ms
    }

    /// One full heartbeat interval of silence: connection is suspect.
    pub fn silent(&self, now: Instant) -> bool {
        self.silence_exceeds(now, self.heartbeat_interval)
    }

    /// `missed_limit` intervals of silence: the peer is treated as dead
    /// even though the transport has not reported closure.
    pub fn timed_out(&self, now: Instant) -> bool {
        self.silence_exceeds(now, self.heartbeat_interval * self.missed_limit)
    }

    fn silence_exceeds(&self, now: Instant, window: Duration) -> bool {
        if !self.active {
            return false;
        }
        match self.last_inbound {
            Some(t) => now.duration_since(t) > window,
            None => false,
        }
    }
}
