use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::aoi::{AoiError, GridId, InsertOutcome, SpatialIndex, VisionLevel, VisionTable};
use crate::config::{GroupConfig, SceneConfig};
use crate::math::Vec3;

use super::entity::{Entity, EntityId, PlayerId, SceneId};
use super::WorldError;

/// Grid cells an entity occupied before and after a move, in its own vision-level index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellChange {
    pub from: GridId,
    pub to: GridId,
}

impl CellChange {
    pub fn crossed(&self) -> bool {
        self.from != self.to
    }
}

/// One scene instance inside a world: its entities, their per-vision-level indexes, and the
/// config-group index used for load/unload.
#[derive(Debug)]
pub struct Scene {
    id: SceneId,
    config: Arc<SceneConfig>,
    entities: BTreeMap<EntityId, Entity>,
    entity_indexes: BTreeMap<VisionLevel, SpatialIndex<EntityId>>,
    group_index: SpatialIndex<u32>,
    group_radius: HashMap<u32, f32>,
    loaded_groups: BTreeMap<u32, Vec<EntityId>>,
    players: BTreeSet<PlayerId>,
    scene_time_ms: u64,
}

impl Scene {
    pub fn new(
        config: Arc<SceneConfig>,
        vision: &VisionTable,
        group_load_distance: f32,
    ) -> Result<Self, AoiError> {
        let mut entity_indexes = BTreeMap::new();
        for entry in vision.iter() {
            entity_indexes.insert(
                entry.level,
                SpatialIndex::new(entry.grid_width, config.bounds, config.shape)?,
            );
        }

        let mut group_radius = HashMap::new();
        for group in &config.groups {
            let radius = group
                .trigger_radius
                .filter(|radius| radius.is_finite() && *radius > 0.0)
                .unwrap_or(group_load_distance);
            group_radius.insert(group.id, radius);
        }
        // A cell at least as wide as every trigger radius keeps each in-range group inside the
        // neighbor block of the query position.
        let group_width = group_radius
            .values()
            .copied()
            .fold(group_load_distance, f32::max);
        let mut group_index = SpatialIndex::new(group_width, config.bounds, config.shape)?;
        for group in &config.groups {
            group_index.insert(i64::from(group.id), group.id, group.anchor)?;
        }

        Ok(Self {
            id: SceneId(config.id),
            config,
            entities: BTreeMap::new(),
            entity_indexes,
            group_index,
            group_radius,
            loaded_groups: BTreeMap::new(),
            players: BTreeSet::new(),
            scene_time_ms: 0,
        })
    }

    pub fn id(&self) -> SceneId {
        self.id
    }

    pub fn scene_time_ms(&self) -> u64 {
        self.scene_time_ms
    }

    pub fn advance_time(&mut self, elapsed_ms: u64) {
        self.scene_time_ms = self.scene_time_ms.saturating_add(elapsed_ms);
    }

    pub fn contains_position(&self, position: Vec3) -> bool {
        position.is_finite() && self.config.bounds.contains(position, self.config.shape)
    }

    /// Like `contains_position`, but height counts in planar scenes too.
    pub fn contains_volume(&self, position: Vec3) -> bool {
        position.is_finite() && self.config.bounds.contains_volume(position)
    }

    pub fn validate_position(&self, position: Vec3) -> Result<(), AoiError> {
        if self.contains_position(position) {
            Ok(())
        } else {
            Err(AoiError::OutOfBounds {
                x: position.x,
                y: position.y,
                z: position.z,
            })
        }
    }

    pub fn entity(&self, entity_id: EntityId) -> Option<&Entity> {
        self.entities.get(&entity_id)
    }

    pub fn entity_mut(&mut self, entity_id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&entity_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entity_index(&self, level: VisionLevel) -> Option<&SpatialIndex<EntityId>> {
        self.entity_indexes.get(&level)
    }

    pub fn add_entity(&mut self, entity: Entity) -> Result<EntityId, WorldError> {
        let id = entity.id;
        if self.entities.contains_key(&id) {
            return Err(WorldError::DuplicateEntity(id));
        }
        let index = self.index_mut(entity.vision_level)?;
        match index.insert(id.object_id(), id, entity.position)? {
            InsertOutcome::Inserted(_) => {}
            InsertOutcome::AlreadyPresent(_) => return Err(WorldError::DuplicateEntity(id)),
        }
        self.entities.insert(id, entity);
        Ok(id)
    }

    pub fn remove_entity(&mut self, entity_id: EntityId) -> Result<Entity, WorldError> {
        let (level, position) = match self.entities.get(&entity_id) {
            Some(entity) => (entity.vision_level, entity.position),
            None => return Err(WorldError::UnknownEntity(entity_id)),
        };
        self.index_mut(level)?
            .remove(entity_id.object_id(), position)?;
        self.entities
            .remove(&entity_id)
            .ok_or(WorldError::UnknownEntity(entity_id))
    }

    /// Relocates an entity. The target is validated before anything changes, so a rejected move
    /// leaves the entity and its index entry where they were.
    pub fn move_entity(
        &mut self,
        entity_id: EntityId,
        position: Vec3,
        rotation: Vec3,
    ) -> Result<CellChange, WorldError> {
        let (level, old_position) = match self.entities.get(&entity_id) {
            Some(entity) => (entity.vision_level, entity.position),
            None => return Err(WorldError::UnknownEntity(entity_id)),
        };
        let index = self.index_mut(level)?;
        let to = index.grid_id_for_position(position)?;
        let from = index.grid_id_for_position(old_position)?;
        if from != to {
            index.remove(entity_id.object_id(), old_position)?;
            index.insert(entity_id.object_id(), entity_id, position)?;
        }
        if let Some(entity) = self.entities.get_mut(&entity_id) {
            entity.position = position;
            entity.rotation = rotation;
        }
        Ok(CellChange { from, to })
    }

    /// Whether an observer standing at `observer` sees `entity_id` under the entity's own
    /// vision level.
    pub fn can_observe(&self, observer: Vec3, entity_id: EntityId) -> bool {
        let Some(entity) = self.entities.get(&entity_id) else {
            return false;
        };
        let Some(index) = self.entity_indexes.get(&entity.vision_level) else {
            return false;
        };
        match (index.grid_id_for_position(observer), index.cell_of(entity_id.object_id())) {
            (Ok(center), Some(cell)) => index.is_neighbor(center, cell),
            _ => false,
        }
    }

    /// Every entity visible from `observer` across all vision levels.
    pub fn visible_from(&self, observer: Vec3) -> Result<BTreeSet<EntityId>, AoiError> {
        let mut visible = BTreeSet::new();
        for index in self.entity_indexes.values() {
            visible.extend(index.objects_near_position(observer)?.into_values());
        }
        Ok(visible)
    }

    /// Entities in any cell overlapped by the box, across all vision levels.
    pub fn entities_in_box(&self, min: Vec3, max: Vec3) -> BTreeSet<EntityId> {
        self.entity_indexes
            .values()
            .flat_map(|index| index.objects_in_box(min, max).into_values())
            .collect()
    }

    pub fn group_config(&self, group_id: u32) -> Option<&GroupConfig> {
        self.config.groups.iter().find(|group| group.id == group_id)
    }

    pub fn group_in_range(&self, group_id: u32, position: Vec3) -> bool {
        match (self.group_config(group_id), self.group_radius.get(&group_id)) {
            (Some(group), Some(radius)) => group.anchor.planar_chebyshev(position) <= *radius,
            _ => false,
        }
    }

    /// Config groups whose anchor lies within their trigger radius of `position`.
    pub fn groups_in_range(&self, position: Vec3) -> Result<BTreeSet<u32>, AoiError> {
        Ok(self
            .group_index
            .objects_near_position(position)?
            .into_values()
            .filter(|group_id| self.group_in_range(*group_id, position))
            .collect())
    }

    pub fn is_group_loaded(&self, group_id: u32) -> bool {
        self.loaded_groups.contains_key(&group_id)
    }

    pub fn loaded_group_ids(&self) -> Vec<u32> {
        self.loaded_groups.keys().copied().collect()
    }

    pub fn mark_group_loaded(&mut self, group_id: u32, members: Vec<EntityId>) {
        self.loaded_groups.insert(group_id, members);
    }

    pub fn take_group(&mut self, group_id: u32) -> Option<Vec<EntityId>> {
        self.loaded_groups.remove(&group_id)
    }

    pub fn players(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.players.iter().copied()
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.players.iter().copied().collect()
    }

    pub fn has_players(&self) -> bool {
        !self.players.is_empty()
    }

    pub fn add_player(&mut self, player_id: PlayerId) {
        self.players.insert(player_id);
    }

    pub fn remove_player(&mut self, player_id: PlayerId) {
        self.players.remove(&player_id);
    }

    /// Drops every entity, index entry and loaded group. Returns the ids that were live.
    pub fn teardown(&mut self) -> Vec<EntityId> {
        let removed: Vec<EntityId> = self.entities.keys().copied().collect();
        self.entities.clear();
        for index in self.entity_indexes.values_mut() {
            index.clear();
        }
        self.loaded_groups.clear();
        self.players.clear();
        removed
    }

    fn index_mut(&mut self, level: VisionLevel) -> Result<&mut SpatialIndex<EntityId>, WorldError> {
        self.entity_indexes
            .get_mut(&level)
            .ok_or(WorldError::MissingVisionLevel(level))
    }
}
