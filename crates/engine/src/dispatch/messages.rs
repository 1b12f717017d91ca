use crossbeam_channel::Sender;
use serde::Serialize;

use crate::math::Vec3;
use crate::visibility::Notification;
use crate::world::{
    EntityId, EntityMove, ForwardTarget, PlayerId, PlayerSnapshot, ProjectileLaunch, SceneId,
    TimerAction, WorldChoice, WorldError,
};

/// A decoded client message attributed to the session that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub player_id: PlayerId,
    pub command: InboundCommand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    EntityMove(EntityMove),
    CombatForward {
        target: ForwardTarget,
        entity_id: EntityId,
        payload: Vec<u8>,
    },
    ProjectileFire(ProjectileLaunch),
    EntityDestroy {
        entity_id: EntityId,
    },
    /// Anything the core does not interpret, handed to the external handler.
    Passthrough {
        command_id: u32,
        payload: Vec<u8>,
    },
}

impl InboundCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::EntityMove(_) => "entity_move",
            Self::CombatForward { .. } => "combat_forward",
            Self::ProjectileFire(_) => "projectile_fire",
            Self::EntityDestroy { .. } => "entity_destroy",
            Self::Passthrough { .. } => "passthrough",
        }
    }
}

/// In-process events from the session and persistence layers.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    PlayerJoined {
        snapshot: PlayerSnapshot,
        choice: WorldChoice,
    },
    PlayerLeft {
        player_id: PlayerId,
    },
    PersistenceFlushed {
        player_id: PlayerId,
    },
    ScheduleTimer {
        player_id: PlayerId,
        delay_ms: u64,
        action: TimerAction,
    },
    /// Begin the graceful shutdown sequence.
    Drain,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    Teleport {
        player_id: PlayerId,
        scene_id: SceneId,
        position: Vec3,
    },
    KillEntity {
        entity_id: EntityId,
    },
    CreateMonster {
        player_id: PlayerId,
        monster_id: u32,
        position: Option<Vec3>,
        count: u32,
    },
    CreateGadget {
        player_id: PlayerId,
        gadget_id: u32,
        position: Option<Vec3>,
        count: u32,
    },
    Status,
}

impl AdminCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Teleport { .. } => "teleport",
            Self::KillEntity { .. } => "kill_entity",
            Self::CreateMonster { .. } => "create_monster",
            Self::CreateGadget { .. } => "create_gadget",
            Self::Status => "status",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdminRequest {
    pub command: AdminCommand,
    pub reply: Option<Sender<Envelope<String>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetCode {
    Succ,
    InvalidArgument,
    NotFound,
    Failed,
}

impl From<&WorldError> for RetCode {
    fn from(error: &WorldError) -> Self {
        match error {
            WorldError::UnknownPlayer(_)
            | WorldError::UnknownWorld(_)
            | WorldError::UnknownScene(_)
            | WorldError::UnknownEntity(_) => Self::NotFound,
            WorldError::Aoi(_)
            | WorldError::NonFinite(_)
            | WorldError::ReservedPlayer(_)
            | WorldError::AiSceneOnly(_)
            | WorldError::NotOwner { .. } => Self::InvalidArgument,
            WorldError::PlayerAlreadyOnline(_)
            | WorldError::DuplicateEntity(_)
            | WorldError::NoAvatar(_)
            | WorldError::NotInAiWorld(_)
            | WorldError::NoFreeWorldId(_)
            | WorldError::MissingVisionLevel(_) => Self::Failed,
        }
    }
}

/// Uniform result wrapper for admin replies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope<T> {
    pub code: RetCode,
    pub payload: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(payload: T) -> Self {
        Self {
            code: RetCode::Succ,
            payload: Some(payload),
        }
    }

    pub fn failure(code: RetCode) -> Self {
        Self {
            code,
            payload: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == RetCode::Succ
    }
}

impl<T> From<Result<T, WorldError>> for Envelope<T> {
    fn from(result: Result<T, WorldError>) -> Self {
        match result {
            Ok(payload) => Self::ok(payload),
            Err(error) => Self::failure(RetCode::from(&error)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    Fault,
    Shutdown,
}

/// Everything the core asks of the session and persistence layers.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Notify {
        player_id: PlayerId,
        notification: Notification,
    },
    Persist {
        snapshot: PlayerSnapshot,
    },
    Disconnect {
        player_id: PlayerId,
        reason: DisconnectReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aoi::AoiError;

    #[test]
    fn envelopes_map_world_errors_to_codes() {
        let found: Envelope<u32> = Ok(3).into();
        assert!(found.is_ok());
        assert_eq!(found.payload, Some(3));

        let missing: Envelope<u32> = Err(WorldError::UnknownEntity(EntityId(9))).into();
        assert_eq!(missing, Envelope::failure(RetCode::NotFound));

        let outside: Envelope<u32> = Err(WorldError::Aoi(AoiError::OutOfBounds {
            x: 1.0e6,
            y: 0.0,
            z: 0.0,
        }))
        .into();
        assert_eq!(outside.code, RetCode::InvalidArgument);
    }

    #[test]
    fn envelopes_serialize_with_their_code() {
        let json = serde_json::to_string(&Envelope::ok("done")).expect("json");
        assert_eq!(json, r#"{"code":"Succ","payload":"done"}"#);
    }
}
