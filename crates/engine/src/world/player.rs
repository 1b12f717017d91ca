use crate::math::Vec3;
use crate::tick::{TimerId, TimerQueue};
use crate::visibility::VisibilityLedger;

use super::entity::{EntityId, PlayerId, SceneId, WorldId};

/// What the session layer hands over on login and gets back for persistence on logout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerSnapshot {
    pub player_id: PlayerId,
    pub scene_id: SceneId,
    pub position: Vec3,
    pub rotation: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldChoice {
    /// The player's own world, created on demand.
    Own,
    /// Another online player's world.
    Join(PlayerId),
    /// The shared AI world.
    AiWorld,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    RefreshVisibility,
    Handler { tag: u32, data: Vec<u8> },
}

#[derive(Debug)]
pub struct Player {
    pub(crate) id: PlayerId,
    pub(crate) world_id: WorldId,
    pub(crate) scene_id: SceneId,
    pub(crate) position: Vec3,
    pub(crate) rotation: Vec3,
    pub(crate) avatar: Option<EntityId>,
    pub(crate) ledger: VisibilityLedger,
    pub(crate) last_visibility_check_ms: Option<u64>,
    pub(crate) visibility_dirty: bool,
    /// Exact position last inserted into the AI-world peer index.
    pub(crate) peer_position: Option<Vec3>,
    pub(crate) timers: TimerQueue<TimerAction>,
    pub(crate) next_tick_ms: u64,
}

impl Player {
    pub(crate) fn new(snapshot: &PlayerSnapshot, world_id: WorldId, scene_id: SceneId) -> Self {
        Self {
            id: snapshot.player_id,
            world_id,
            scene_id,
            position: snapshot.position,
            rotation: snapshot.rotation,
            avatar: None,
            ledger: VisibilityLedger::default(),
            last_visibility_check_ms: None,
            visibility_dirty: false,
            peer_position: None,
            timers: TimerQueue::default(),
            next_tick_ms: 0,
        }
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    pub fn world_id(&self) -> WorldId {
        self.world_id
    }

    pub fn scene_id(&self) -> SceneId {
        self.scene_id
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn avatar(&self) -> Option<EntityId> {
        self.avatar
    }

    pub fn ledger(&self) -> &VisibilityLedger {
        &self.ledger
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn schedule(&mut self, now_ms: u64, delay_ms: u64, action: TimerAction) -> TimerId {
        self.timers.schedule(now_ms, delay_ms, action)
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            player_id: self.id,
            scene_id: self.scene_id,
            position: self.position,
            rotation: self.rotation,
        }
    }
}
