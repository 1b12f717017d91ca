use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::ShutdownConfig;
use crate::world::PlayerId;

/// What the dispatcher should do next while shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    /// No drain requested.
    Idle,
    Wait,
    Disconnect(PlayerId),
    /// Every session is gone; tear the world state down.
    Teardown,
    Done,
}

#[derive(Debug)]
enum DrainPhase {
    Idle,
    AwaitingFlush {
        pending: BTreeSet<PlayerId>,
        order: VecDeque<PlayerId>,
        deadline: Instant,
    },
    Disconnecting {
        remaining: VecDeque<PlayerId>,
        next_at: Instant,
    },
    Finished,
}

/// Cooperative shutdown: wait for persistence acknowledgements (bounded by the flush timeout),
/// then release sessions one per stagger interval.
#[derive(Debug)]
pub struct DrainState {
    phase: DrainPhase,
    flush_timeout: Duration,
    stagger: Duration,
}

impl DrainState {
    pub fn new(config: &ShutdownConfig) -> Self {
        Self {
            phase: DrainPhase::Idle,
            flush_timeout: Duration::from_millis(config.flush_timeout_ms),
            stagger: Duration::from_millis(config.disconnect_stagger_ms),
        }
    }

    pub fn is_draining(&self) -> bool {
        !matches!(self.phase, DrainPhase::Idle)
    }

    /// Starts waiting for `players` to be flushed. Returns `false` if a drain is already running.
    pub fn begin(&mut self, players: Vec<PlayerId>, now: Instant) -> bool {
        if self.is_draining() {
            return false;
        }
        info!(
            players = players.len(),
            flush_timeout_ms = self.flush_timeout.as_millis() as u64,
            "drain_started"
        );
        self.phase = DrainPhase::AwaitingFlush {
            pending: players.iter().copied().collect(),
            order: players.into(),
            deadline: now + self.flush_timeout,
        };
        true
    }

    /// Records a persistence acknowledgement. Returns whether the player was still pending.
    pub fn acknowledge(&mut self, player_id: PlayerId) -> bool {
        match &mut self.phase {
            DrainPhase::AwaitingFlush { pending, .. } => pending.remove(&player_id),
            _ => false,
        }
    }

    pub fn poll(&mut self, now: Instant) -> DrainStep {
        if let DrainPhase::AwaitingFlush {
            pending,
            order,
            deadline,
        } = &mut self.phase
        {
            if !pending.is_empty() && now < *deadline {
                return DrainStep::Wait;
            }
            if !pending.is_empty() {
                warn!(unflushed = pending.len(), "drain_flush_timeout");
            }
            self.phase = DrainPhase::Disconnecting {
                remaining: std::mem::take(order),
                next_at: now,
            };
        }

        match &mut self.phase {
            DrainPhase::Idle => DrainStep::Idle,
            DrainPhase::AwaitingFlush { .. } => DrainStep::Wait,
            DrainPhase::Disconnecting { remaining, next_at } => {
                if now < *next_at {
                    return DrainStep::Wait;
                }
                match remaining.pop_front() {
                    Some(player_id) => {
                        *next_at = now + self.stagger;
                        DrainStep::Disconnect(player_id)
                    }
                    None => {
                        self.phase = DrainPhase::Finished;
                        DrainStep::Teardown
                    }
                }
            }
            DrainPhase::Finished => DrainStep::Done,
        }
    }
}
