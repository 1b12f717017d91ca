use std::collections::BTreeMap;

use serde::Serialize;

use crate::aoi::VisionLevel;
use crate::math::Vec3;

pub const DEFAULT_MAX_HP: f32 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PlayerId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorldId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SceneId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityId(pub u64);

impl EntityId {
    pub fn object_id(self) -> i64 {
        self.0 as i64
    }
}

#[derive(Debug, Default)]
pub struct EntityIdAllocator {
    next: u64,
}

impl EntityIdAllocator {
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    pub fn allocate(&mut self) -> EntityId {
        let id = EntityId(self.next);
        self.next = self.next.saturating_add(1);
        id
    }

    /// Moves the cursor past an id chosen elsewhere (client-assigned projectiles).
    pub fn reserve(&mut self, id: EntityId) {
        if id.0 >= self.next {
            self.next = id.0.saturating_add(1);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityType {
    Avatar,
    Monster,
    Npc,
    Gadget,
    Projectile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Avatar { owner: PlayerId },
    Monster { monster_id: u32 },
    Npc { npc_id: u32 },
    Gadget { gadget_id: u32 },
    Projectile { gadget_id: u32, shooter: EntityId },
}

impl EntityKind {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Avatar { .. } => EntityType::Avatar,
            Self::Monster { .. } => EntityType::Monster,
            Self::Npc { .. } => EntityType::Npc,
            Self::Gadget { .. } => EntityType::Gadget,
            Self::Projectile { .. } => EntityType::Projectile,
        }
    }

    pub fn is_avatar(&self) -> bool {
        matches!(self, Self::Avatar { .. })
    }

    pub fn avatar_owner(&self) -> Option<PlayerId> {
        match self {
            Self::Avatar { owner } => Some(*owner),
            _ => None,
        }
    }

    pub fn config_id(&self) -> u32 {
        match self {
            Self::Avatar { owner } => owner.0,
            Self::Monster { monster_id } => *monster_id,
            Self::Npc { npc_id } => *npc_id,
            Self::Gadget { gadget_id } | Self::Projectile { gadget_id, .. } => *gadget_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum FightProp {
    BaseHp,
    CurHp,
    MaxHp,
    BaseAttack,
    BaseDefense,
    CurStamina,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum MotionState {
    #[default]
    Standby,
    Walk,
    Run,
    Dash,
    Climb,
    Fly,
    Fall,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum LifeState {
    #[default]
    Alive,
    Dead,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub position: Vec3,
    pub rotation: Vec3,
    pub vision_level: VisionLevel,
    pub fight_props: BTreeMap<FightProp, f32>,
    pub motion_state: MotionState,
    pub life_state: LifeState,
    pub last_move_scene_time: u32,
    pub last_move_reliable_seq: u32,
    pub group_id: Option<u32>,
}

impl Entity {
    pub fn new(id: EntityId, kind: EntityKind, position: Vec3, vision_level: VisionLevel) -> Self {
        let mut fight_props = BTreeMap::new();
        match kind {
            EntityKind::Avatar { .. } | EntityKind::Monster { .. } => {
                fight_props.insert(FightProp::BaseHp, DEFAULT_MAX_HP);
                fight_props.insert(FightProp::MaxHp, DEFAULT_MAX_HP);
                fight_props.insert(FightProp::CurHp, DEFAULT_MAX_HP);
            }
            EntityKind::Npc { .. } | EntityKind::Gadget { .. } | EntityKind::Projectile { .. } => {}
        }
        Self {
            id,
            kind,
            position,
            rotation: Vec3::ZERO,
            vision_level,
            fight_props,
            motion_state: MotionState::Standby,
            life_state: LifeState::Alive,
            last_move_scene_time: 0,
            last_move_reliable_seq: 0,
            group_id: None,
        }
    }

    pub fn fight_prop(&self, prop: FightProp) -> f32 {
        self.fight_props.get(&prop).copied().unwrap_or(0.0)
    }

    pub fn set_fight_prop(&mut self, prop: FightProp, value: f32) {
        self.fight_props.insert(prop, value);
    }

    pub fn is_alive(&self) -> bool {
        self.life_state == LifeState::Alive
    }

    pub fn descriptor(&self) -> EntityDescriptor {
        EntityDescriptor {
            entity_id: self.id,
            entity_type: self.kind.entity_type(),
            config_id: self.kind.config_id(),
            position: self.position,
            rotation: self.rotation,
            life_state: self.life_state,
            fight_props: self
                .fight_props
                .iter()
                .map(|(prop, value)| (*prop, *value))
                .collect(),
        }
    }
}

/// Client-facing snapshot carried by appear notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDescriptor {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub config_id: u32,
    pub position: Vec3,
    pub rotation: Vec3,
    pub life_state: LifeState,
    pub fight_props: Vec<(FightProp, f32)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_skips_reserved_ids() {
        let mut allocator = EntityIdAllocator::starting_at(10);
        assert_eq!(allocator.allocate(), EntityId(10));
        allocator.reserve(EntityId(40));
        assert_eq!(allocator.allocate(), EntityId(41));
        allocator.reserve(EntityId(5));
        assert_eq!(allocator.allocate(), EntityId(42));
    }

    #[test]
    fn combat_entities_start_with_full_hp() {
        let monster = Entity::new(
            EntityId(1),
            EntityKind::Monster { monster_id: 7 },
            Vec3::ZERO,
            VisionLevel::Normal,
        );
        assert_eq!(monster.fight_prop(FightProp::CurHp), DEFAULT_MAX_HP);
        let gadget = Entity::new(
            EntityId(2),
            EntityKind::Gadget { gadget_id: 7 },
            Vec3::ZERO,
            VisionLevel::Normal,
        );
        assert_eq!(gadget.fight_prop(FightProp::CurHp), 0.0);
        assert_eq!(gadget.descriptor().entity_type, EntityType::Gadget);
    }
}
