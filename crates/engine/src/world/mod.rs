mod combat;
mod entity;
mod instance;
mod manager;
mod player;
mod scene;

use thiserror::Error;

use crate::aoi::{AoiError, VisionLevel};

pub use entity::{
    Entity, EntityDescriptor, EntityId, EntityIdAllocator, EntityKind, EntityType, FightProp,
    LifeState, MotionState, PlayerId, SceneId, WorldId, DEFAULT_MAX_HP,
};
pub use instance::{World, AI_WORLD_ID, AI_WORLD_OWNER};
pub use manager::{EntityMove, ForwardTarget, ManagerStatus, ProjectileLaunch, WorldManager};
pub use player::{Player, PlayerSnapshot, TimerAction, WorldChoice};
pub use scene::{CellChange, Scene};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorldError {
    #[error("player {0:?} is not online")]
    UnknownPlayer(PlayerId),
    #[error("player {0:?} is already online")]
    PlayerAlreadyOnline(PlayerId),
    #[error("player id {0:?} is reserved")]
    ReservedPlayer(PlayerId),
    #[error("world {0:?} does not exist")]
    UnknownWorld(WorldId),
    #[error("scene {0:?} is not configured")]
    UnknownScene(SceneId),
    #[error("entity {0:?} does not exist")]
    UnknownEntity(EntityId),
    #[error("entity {0:?} is already tracked")]
    DuplicateEntity(EntityId),
    #[error("entity {entity:?} is not controlled by player {player:?}")]
    NotOwner { player: PlayerId, entity: EntityId },
    #[error("player {0:?} has no active avatar")]
    NoAvatar(PlayerId),
    #[error("player {0:?} is not in the ai world")]
    NotInAiWorld(PlayerId),
    #[error("the ai world only hosts scene {0:?}")]
    AiSceneOnly(SceneId),
    #[error("no world id is free for player {0:?}")]
    NoFreeWorldId(PlayerId),
    #[error("no index is configured for vision level {0:?}")]
    MissingVisionLevel(VisionLevel),
    #[error("value {0} is not finite")]
    NonFinite(f32),
    #[error(transparent)]
    Aoi(#[from] AoiError),
}

impl WorldError {
    /// Lookups that can legitimately miss when a message races a logout or despawn.
    pub fn is_stale_reference(&self) -> bool {
        matches!(
            self,
            Self::UnknownPlayer(_)
                | Self::UnknownWorld(_)
                | Self::UnknownEntity(_)
                | Self::Aoi(AoiError::NotFound { .. })
        )
    }
}
