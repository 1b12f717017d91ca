use std::collections::{BTreeMap, BTreeSet};

use crate::aoi::SpatialIndex;
use crate::physics::PhysicsEngine;

use super::entity::{PlayerId, SceneId, WorldId};
use super::scene::Scene;

pub const AI_WORLD_ID: WorldId = WorldId(0);
pub const AI_WORLD_OWNER: PlayerId = PlayerId(0);

/// A host-owned container of scenes. The shared AI world additionally carries the symmetric
/// player index and the projectile physics engine.
#[derive(Debug)]
pub struct World {
    pub(crate) id: WorldId,
    pub(crate) owner: PlayerId,
    pub(crate) members: BTreeSet<PlayerId>,
    pub(crate) scenes: BTreeMap<SceneId, Scene>,
    pub(crate) peer_index: Option<SpatialIndex<PlayerId>>,
    pub(crate) physics: Option<PhysicsEngine>,
}

impl World {
    pub(crate) fn owned_by(id: WorldId, owner: PlayerId) -> Self {
        Self {
            id,
            owner,
            members: BTreeSet::new(),
            scenes: BTreeMap::new(),
            peer_index: None,
            physics: None,
        }
    }

    pub(crate) fn ai(peer_index: SpatialIndex<PlayerId>, physics: PhysicsEngine) -> Self {
        Self {
            id: AI_WORLD_ID,
            owner: AI_WORLD_OWNER,
            members: BTreeSet::new(),
            scenes: BTreeMap::new(),
            peer_index: Some(peer_index),
            physics: Some(physics),
        }
    }

    pub fn id(&self) -> WorldId {
        self.id
    }

    pub fn owner(&self) -> PlayerId {
        self.owner
    }

    pub fn is_ai_world(&self) -> bool {
        self.peer_index.is_some()
    }

    /// Multiplayer worlds keep groups loaded while any member is still near them.
    pub fn is_multiplayer(&self) -> bool {
        self.is_ai_world() || self.members.len() > 1
    }

    pub fn members(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.members.iter().copied()
    }

    pub fn scene(&self, scene_id: SceneId) -> Option<&Scene> {
        self.scenes.get(&scene_id)
    }

    pub fn scenes(&self) -> impl Iterator<Item = &Scene> {
        self.scenes.values()
    }

    pub fn peer_index(&self) -> Option<&SpatialIndex<PlayerId>> {
        self.peer_index.as_ref()
    }

    pub fn physics(&self) -> Option<&PhysicsEngine> {
        self.physics.as_ref()
    }
}
