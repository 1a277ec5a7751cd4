//! Keepalive bookkeeping for a live subscription.
//!
//! Pings go out every `ping_interval` while syncing. Each ping carries a
//! random nonce the server echoes back in a pong; a ping whose pong has not
//! arrived within `pong_timeout` marks the connection as dead.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::error::SyncError;

/// Round trip record of one ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceStats {
    pub sequence: u64,
    pub nonce: String,
    pub ping_at: Instant,
    pub received_at: Option<Instant>,
}

impl NonceStats {
    pub fn round_trip(&self) -> Option<Duration> {
        self.received_at.map(|at| at.duration_since(self.ping_at))
    }
}

/// What the keepalive wants done when its deadline fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Send a ping with this nonce.
    Ping(String),
    /// Nothing due yet.
    Idle,
}

/// Ping schedule and nonce stats. Inert until [`Keepalive::start`].
#[derive(Debug)]
pub struct Keepalive {
    interval: Duration,
    pong_timeout: Duration,
    next_ping: Option<Instant>,
    awaiting: Option<(String, Instant)>,
    sequence: u64,
    nonces: BTreeMap<String, NonceStats>,
}

impl Keepalive {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            interval: config.ping_interval,
            pong_timeout: config.pong_timeout,
            next_ping: None,
            awaiting: None,
            sequence: 0,
            nonces: BTreeMap::new(),
        }
    }

    /// Arm the schedule; the first ping is due one interval from now.
    pub fn start(&mut self) {
        self.next_ping = Some(Instant::now() + self.interval);
    }

    pub fn is_running(&self) -> bool {
        self.next_ping.is_some()
    }

    /// Earliest instant something is due, if running.
    pub fn deadline(&self) -> Option<Instant> {
        let pong = self.awaiting.as_ref().map(|(_, at)| *at);
        match (self.next_ping, pong) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Called when [`Keepalive::deadline`] passes.
    pub fn on_deadline(&mut self, now: Instant) -> Result<KeepaliveAction, SyncError> {
        if let Some((nonce, due)) = &self.awaiting {
            if now >= *due {
                return Err(SyncError::MissedPong {
                    nonce: nonce.clone(),
                });
            }
        }
        match self.next_ping {
            Some(at) if now >= at => {
                let nonce = format!("{:016x}", rand::random::<u64>());
                let sequence = self.sequence;
                self.sequence += 1;
                self.nonces.insert(
                    nonce.clone(),
                    NonceStats {
                        sequence,
                        nonce: nonce.clone(),
                        ping_at: now,
                        received_at: None,
                    },
                );
                if self.awaiting.is_none() {
                    self.awaiting = Some((nonce.clone(), now + self.pong_timeout));
                }
                self.next_ping = Some(now + self.interval);
                Ok(KeepaliveAction::Ping(nonce))
            }
            _ => Ok(KeepaliveAction::Idle),
        }
    }

    /// Record a pong. Returns false for nonces this keepalive never sent.
    pub fn on_pong(&mut self, nonce: &str, now: Instant) -> bool {
        let Some(stats) = self.nonces.get_mut(nonce) else {
            tracing::warn!(nonce, "pong nonce not found");
            return false;
        };
        stats.received_at = Some(now);
        if self.awaiting.as_ref().map(|(n, _)| n == nonce).unwrap_or(false) {
            self.awaiting = None;
        }
        true
    }

    /// Disarm and log the round trips seen since `start`.
    pub fn stop(&mut self) -> Vec<NonceStats> {
        self.next_ping = None;
        self.awaiting = None;
        self.sequence = 0;
        let mut stats: Vec<NonceStats> = std::mem::take(&mut self.nonces).into_values().collect();
        stats.sort_by_key(|s| s.sequence);
        for s in &stats {
            tracing::debug!(
                sequence = s.sequence,
                nonce = %s.nonce,
                round_trip_ms = s.round_trip().map(|d| d.as_millis() as u64),
                "keepalive ping"
            );
        }
        stats
    }
}
