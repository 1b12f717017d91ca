use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::aoi::{AoiError, SpatialIndex, VisionLevel, VisionTable};
use crate::config::{ConfigError, SceneConfig, ServerConfig};
use crate::math::Vec3;
use crate::physics::PhysicsEngine;
use crate::tick::TimerId;
use crate::visibility::{
    send_disappear, AppearReason, DisappearReason, Notification, NotificationSink,
};

use super::entity::{
    Entity, EntityId, EntityIdAllocator, EntityKind, FightProp, LifeState, MotionState, PlayerId,
    SceneId, WorldId,
};
use super::instance::{World, AI_WORLD_ID, AI_WORLD_OWNER};
use super::player::{Player, PlayerSnapshot, TimerAction, WorldChoice};
use super::scene::Scene;
use super::WorldError;

const FIRST_ENTITY_ID: u64 = 1;
/// Own worlds normally reuse the owner's id; ids from here up are handed out when that id is
/// still taken by a world the player handed over.
const FIRST_SPARE_WORLD_ID: u32 = 1 << 31;

/// A client position report for one entity it controls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityMove {
    pub entity_id: EntityId,
    pub position: Vec3,
    pub rotation: Vec3,
    pub motion_state: MotionState,
    pub scene_time: u32,
    pub reliable_seq: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectileLaunch {
    /// Id the client assigned; the server allocates one when absent.
    pub client_entity_id: Option<EntityId>,
    pub gadget_id: u32,
    pub position: Vec3,
    pub velocity: Vec3,
    pub drag: f32,
    pub mass: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardTarget {
    ToAll,
    ToAllExceptSelf,
    ToHost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub worlds: usize,
    pub players: usize,
    pub entities: usize,
    pub projectiles: usize,
}

/// Owns every world, scene and online player. All simulation state is reached through this
/// context object, which the dispatcher holds exclusively.
#[derive(Debug)]
pub struct WorldManager {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) vision: Arc<VisionTable>,
    pub(crate) scene_configs: BTreeMap<SceneId, Arc<SceneConfig>>,
    pub(crate) worlds: BTreeMap<WorldId, World>,
    pub(crate) players: BTreeMap<PlayerId, Player>,
    pub(crate) entity_ids: EntityIdAllocator,
}

impl WorldManager {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, ConfigError> {
        config.validate()?;
        let vision = Arc::new(config.vision_table()?);
        let scene_configs = config
            .scenes
            .iter()
            .map(|scene| (SceneId(scene.id), Arc::new(scene.clone())))
            .collect::<BTreeMap<_, _>>();

        let ai_scene = config
            .scene(config.ai_world.scene_id)
            .ok_or(ConfigError::MissingAiScene(config.ai_world.scene_id))?;
        let peer_width = vision.get(config.ai_world.vision_level).grid_width;
        let peer_index = SpatialIndex::new(peer_width, ai_scene.bounds, ai_scene.shape)
            .map_err(|_| ConfigError::SceneBounds {
                scene_id: ai_scene.id,
            })?;

        let mut worlds = BTreeMap::new();
        worlds.insert(
            AI_WORLD_ID,
            World::ai(peer_index, PhysicsEngine::new(&config.physics)),
        );

        Ok(Self {
            config,
            vision,
            scene_configs,
            worlds,
            players: BTreeMap::new(),
            entity_ids: EntityIdAllocator::starting_at(FIRST_ENTITY_ID),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn vision(&self) -> &VisionTable {
        &self.vision
    }

    pub fn player(&self, player_id: PlayerId) -> Option<&Player> {
        self.players.get(&player_id)
    }

    pub fn online_players(&self) -> Vec<PlayerId> {
        self.players.keys().copied().collect()
    }

    pub fn world(&self, world_id: WorldId) -> Option<&World> {
        self.worlds.get(&world_id)
    }

    pub fn ai_world(&self) -> Option<&World> {
        self.worlds.get(&AI_WORLD_ID)
    }

    pub fn scene(&self, world_id: WorldId, scene_id: SceneId) -> Option<&Scene> {
        self.worlds.get(&world_id)?.scenes.get(&scene_id)
    }

    pub fn entity(&self, entity_id: EntityId) -> Option<&Entity> {
        let (world_id, scene_id) = self.locate_entity(entity_id)?;
        self.scene(world_id, scene_id)?.entity(entity_id)
    }

    pub fn locate_entity(&self, entity_id: EntityId) -> Option<(WorldId, SceneId)> {
        self.worlds.values().find_map(|world| {
            world
                .scenes
                .values()
                .find(|scene| scene.entity(entity_id).is_some())
                .map(|scene| (world.id, scene.id()))
        })
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            worlds: self.worlds.len(),
            players: self.players.len(),
            entities: self
                .worlds
                .values()
                .flat_map(|world| world.scenes.values())
                .map(Scene::entity_count)
                .sum(),
            projectiles: self
                .worlds
                .values()
                .filter_map(|world| world.physics.as_ref())
                .map(PhysicsEngine::len)
                .sum(),
        }
    }

    /// Brings a player online: resolves the world, spawns the avatar and runs the first
    /// visibility pass.
    pub fn player_join(
        &mut self,
        snapshot: PlayerSnapshot,
        choice: WorldChoice,
        now_ms: u64,
        sink: &mut dyn NotificationSink,
    ) -> Result<WorldId, WorldError> {
        let player_id = snapshot.player_id;
        if player_id == AI_WORLD_OWNER {
            return Err(WorldError::ReservedPlayer(player_id));
        }
        if self.players.contains_key(&player_id) {
            return Err(WorldError::PlayerAlreadyOnline(player_id));
        }
        let (world_id, scene_id) = match choice {
            WorldChoice::Own => (self.own_world_id(player_id)?, snapshot.scene_id),
            WorldChoice::Join(host) => {
                let world_id = self
                    .players
                    .get(&host)
                    .map(|host| host.world_id)
                    .unwrap_or(WorldId(host.0));
                if world_id == AI_WORLD_ID || !self.worlds.contains_key(&world_id) {
                    return Err(WorldError::UnknownWorld(world_id));
                }
                (world_id, snapshot.scene_id)
            }
            WorldChoice::AiWorld => (AI_WORLD_ID, SceneId(self.config.ai_world.scene_id)),
        };
        self.check_spawn_point(scene_id, snapshot.position)?;
        if choice == WorldChoice::Own {
            self.worlds
                .entry(world_id)
                .or_insert_with(|| World::owned_by(world_id, player_id));
        }
        self.ensure_scene(world_id, scene_id)?;

        let mut player = Player::new(&snapshot, world_id, scene_id);
        player.next_tick_ms = now_ms.saturating_add(self.config.tick.player_tick_ms);
        self.players.insert(player_id, player);
        if let Some(world) = self.worlds.get_mut(&world_id) {
            world.members.insert(player_id);
        }
        self.enter_scene(player_id, now_ms, AppearReason::Meet, AppearReason::Born, sink)?;
        info!(
            player_id = player_id.0,
            world_id = world_id.0,
            scene_id = scene_id.0,
            "player_joined"
        );
        Ok(world_id)
    }

    /// Takes a player offline, notifying everyone who could see its avatar. Returns the state to
    /// persist.
    pub fn player_leave(
        &mut self,
        player_id: PlayerId,
        sink: &mut dyn NotificationSink,
    ) -> Result<PlayerSnapshot, WorldError> {
        let (world_id, scene_id) = self.player_location(player_id)?;
        self.exit_scene(player_id, DisappearReason::Miss, sink)?;
        let player = self
            .players
            .remove(&player_id)
            .ok_or(WorldError::UnknownPlayer(player_id))?;

        let mut drop_world = false;
        if let Some(world) = self.worlds.get_mut(&world_id) {
            world.members.remove(&player_id);
            drop_world = world.members.is_empty() && !world.is_ai_world();
            if world.owner == player_id {
                if let Some(next_host) = world.members.iter().next().copied() {
                    world.owner = next_host;
                    info!(
                        world_id = world_id.0,
                        host = next_host.0,
                        "world_host_reassigned"
                    );
                }
            }
            if let Some(scene) = world.scenes.get_mut(&scene_id) {
                if !scene.has_players() {
                    let removed = scene.teardown();
                    debug!(
                        world_id = world_id.0,
                        scene_id = scene_id.0,
                        entities = removed.len(),
                        "scene_emptied"
                    );
                }
            }
        }
        if drop_world {
            self.worlds.remove(&world_id);
            debug!(world_id = world_id.0, "world_released");
        }
        info!(player_id = player_id.0, world_id = world_id.0, "player_left");
        Ok(player.snapshot())
    }

    /// Moves a player to a position in a scene of its current world. Everything visible is
    /// transported out, then the target view is transported in.
    pub fn teleport(
        &mut self,
        player_id: PlayerId,
        scene_id: SceneId,
        position: Vec3,
        now_ms: u64,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let (world_id, _) = self.player_location(player_id)?;
        if world_id == AI_WORLD_ID && scene_id.0 != self.config.ai_world.scene_id {
            return Err(WorldError::AiSceneOnly(SceneId(self.config.ai_world.scene_id)));
        }
        self.check_spawn_point(scene_id, position)?;
        self.ensure_scene(world_id, scene_id)?;

        self.exit_scene(player_id, DisappearReason::Transport, sink)?;
        if let Some(player) = self.players.get_mut(&player_id) {
            player.scene_id = scene_id;
            player.position = position;
            player.last_visibility_check_ms = None;
        }
        self.enter_scene(
            player_id,
            now_ms,
            AppearReason::Transport,
            AppearReason::Transport,
            sink,
        )?;
        info!(
            player_id = player_id.0,
            scene_id = scene_id.0,
            x = position.x,
            y = position.y,
            z = position.z,
            "player_teleported"
        );
        Ok(())
    }

    pub fn create_monster(
        &mut self,
        player_id: PlayerId,
        monster_id: u32,
        position: Option<Vec3>,
        count: u32,
        sink: &mut dyn NotificationSink,
    ) -> Result<Vec<EntityId>, WorldError> {
        self.spawn_near_player(
            player_id,
            EntityKind::Monster { monster_id },
            position,
            count,
            sink,
        )
    }

    pub fn create_gadget(
        &mut self,
        player_id: PlayerId,
        gadget_id: u32,
        position: Option<Vec3>,
        count: u32,
        sink: &mut dyn NotificationSink,
    ) -> Result<Vec<EntityId>, WorldError> {
        self.spawn_near_player(
            player_id,
            EntityKind::Gadget { gadget_id },
            position,
            count,
            sink,
        )
    }

    /// Kills an entity. Avatars stay in the scene as dead; everything else is removed and
    /// observers are told it died.
    pub fn kill_entity(
        &mut self,
        entity_id: EntityId,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let (world_id, scene_id) = self
            .locate_entity(entity_id)
            .ok_or(WorldError::UnknownEntity(entity_id))?;
        let is_avatar = self
            .scene(world_id, scene_id)
            .and_then(|scene| scene.entity(entity_id))
            .map(|entity| entity.kind.is_avatar())
            .ok_or(WorldError::UnknownEntity(entity_id))?;

        self.set_fight_prop(entity_id, FightProp::CurHp, 0.0, sink)?;
        if is_avatar {
            if let Some(entity) = self.scene_entity_mut(world_id, scene_id, entity_id) {
                entity.life_state = LifeState::Dead;
            }
        } else {
            self.despawn(world_id, scene_id, entity_id, DisappearReason::Die, sink)?;
        }
        info!(entity_id = entity_id.0, avatar = is_avatar, "entity_killed");
        Ok(())
    }

    /// Writes a fight property and tells every player who can see the entity.
    pub fn set_fight_prop(
        &mut self,
        entity_id: EntityId,
        prop: FightProp,
        value: f32,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        if !value.is_finite() {
            return Err(WorldError::NonFinite(value));
        }
        let (world_id, scene_id) = self
            .locate_entity(entity_id)
            .ok_or(WorldError::UnknownEntity(entity_id))?;
        let entity = self
            .scene_entity_mut(world_id, scene_id, entity_id)
            .ok_or(WorldError::UnknownEntity(entity_id))?;
        entity.set_fight_prop(prop, value);
        if prop == FightProp::CurHp && value <= 0.0 {
            entity.life_state = LifeState::Dead;
        }
        self.broadcast_to_observers(
            world_id,
            scene_id,
            entity_id,
            Notification::FightPropUpdate {
                entity_id,
                prop,
                value,
            },
            None,
            sink,
        );
        Ok(())
    }

    pub fn schedule_timer(
        &mut self,
        player_id: PlayerId,
        now_ms: u64,
        delay_ms: u64,
        action: TimerAction,
    ) -> Result<TimerId, WorldError> {
        let player = self
            .players
            .get_mut(&player_id)
            .ok_or(WorldError::UnknownPlayer(player_id))?;
        Ok(player.schedule(now_ms, delay_ms, action))
    }

    /// Removes and returns every timer whose due time has been reached, ordered per player.
    pub fn take_due_timers(&mut self, now_ms: u64) -> Vec<(PlayerId, TimerAction)> {
        let mut due = Vec::new();
        for (player_id, player) in &mut self.players {
            for (_, action) in player.timers.drain_due(now_ms) {
                due.push((*player_id, action));
            }
        }
        due
    }

    /// Players whose per-player tick is due; each is rescheduled one interval later.
    pub fn due_player_ticks(&mut self, now_ms: u64) -> Vec<PlayerId> {
        let interval = self.config.tick.player_tick_ms.max(1);
        let mut due = Vec::new();
        for (player_id, player) in &mut self.players {
            if now_ms >= player.next_tick_ms {
                player.next_tick_ms = now_ms.saturating_add(interval);
                due.push(*player_id);
            }
        }
        due
    }

    pub fn advance_scene_time(&mut self, elapsed_ms: u64) {
        for world in self.worlds.values_mut() {
            for scene in world.scenes.values_mut() {
                scene.advance_time(elapsed_ms);
            }
        }
    }

    /// Drops every player, world and entity. Used by the drain sequence once sessions are gone.
    pub fn teardown(&mut self) {
        self.players.clear();
        for world in self.worlds.values_mut() {
            for scene in world.scenes.values_mut() {
                scene.teardown();
            }
            world.scenes.clear();
            world.members.clear();
            if let Some(index) = world.peer_index.as_mut() {
                index.clear();
            }
            if let Some(physics) = world.physics.as_mut() {
                physics.clear();
            }
        }
        self.worlds.retain(|world_id, _| *world_id == AI_WORLD_ID);
        info!("world_state_torn_down");
    }

    pub(crate) fn player_location(
        &self,
        player_id: PlayerId,
    ) -> Result<(WorldId, SceneId), WorldError> {
        self.players
            .get(&player_id)
            .map(|player| (player.world_id, player.scene_id))
            .ok_or(WorldError::UnknownPlayer(player_id))
    }

    pub(crate) fn scene_entity_mut(
        &mut self,
        world_id: WorldId,
        scene_id: SceneId,
        entity_id: EntityId,
    ) -> Option<&mut Entity> {
        self.worlds
            .get_mut(&world_id)?
            .scenes
            .get_mut(&scene_id)?
            .entity_mut(entity_id)
    }

    /// Sends `notification` to every player in the scene that can see `entity_id`, and to the
    /// entity's owner.
    pub(crate) fn broadcast_to_observers(
        &self,
        world_id: WorldId,
        scene_id: SceneId,
        entity_id: EntityId,
        notification: Notification,
        except: Option<PlayerId>,
        sink: &mut dyn NotificationSink,
    ) {
        let Some(scene) = self.scene(world_id, scene_id) else {
            return;
        };
        for player_id in scene.players() {
            if Some(player_id) == except {
                continue;
            }
            let Some(player) = self.players.get(&player_id) else {
                continue;
            };
            if player.avatar == Some(entity_id) || player.ledger.contains(entity_id) {
                sink.deliver(player_id, notification.clone());
            }
        }
    }

    /// Removes an entity from its scene and any physics body, then updates observers.
    pub(crate) fn despawn(
        &mut self,
        world_id: WorldId,
        scene_id: SceneId,
        entity_id: EntityId,
        reason: DisappearReason,
        sink: &mut dyn NotificationSink,
    ) -> Result<Entity, WorldError> {
        let world = self
            .worlds
            .get_mut(&world_id)
            .ok_or(WorldError::UnknownWorld(world_id))?;
        if let Some(physics) = world.physics.as_mut() {
            physics.despawn(entity_id);
        }
        let scene = world
            .scenes
            .get_mut(&scene_id)
            .ok_or(WorldError::UnknownScene(scene_id))?;
        let entity = scene.remove_entity(entity_id)?;
        if let Some(group_id) = entity.group_id {
            if let Some(mut members) = scene.take_group(group_id) {
                members.retain(|member| *member != entity_id);
                scene.mark_group_loaded(group_id, members);
            }
        }
        self.sync_observers(
            world_id,
            scene_id,
            &[entity_id],
            AppearReason::Meet,
            reason,
            sink,
        )?;
        Ok(entity)
    }

    pub(crate) fn ensure_scene(
        &mut self,
        world_id: WorldId,
        scene_id: SceneId,
    ) -> Result<(), WorldError> {
        let config = self
            .scene_configs
            .get(&scene_id)
            .cloned()
            .ok_or(WorldError::UnknownScene(scene_id))?;
        let world = self
            .worlds
            .get_mut(&world_id)
            .ok_or(WorldError::UnknownWorld(world_id))?;
        if !world.scenes.contains_key(&scene_id) {
            let scene = Scene::new(
                config,
                &self.vision,
                self.config.visibility.group_load_distance,
            )?;
            world.scenes.insert(scene_id, scene);
            debug!(world_id = world_id.0, scene_id = scene_id.0, "scene_created");
        }
        Ok(())
    }

    fn check_spawn_point(&self, scene_id: SceneId, position: Vec3) -> Result<(), WorldError> {
        let config = self
            .scene_configs
            .get(&scene_id)
            .ok_or(WorldError::UnknownScene(scene_id))?;
        if position.is_finite() && config.bounds.contains(position, config.shape) {
            Ok(())
        } else {
            Err(WorldError::Aoi(AoiError::OutOfBounds {
                x: position.x,
                y: position.y,
                z: position.z,
            }))
        }
    }

    /// Spawns the player's avatar in its current scene and runs the regime-specific first pass.
    fn enter_scene(
        &mut self,
        player_id: PlayerId,
        now_ms: u64,
        self_reason: AppearReason,
        others_reason: AppearReason,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let (world_id, scene_id) = self.player_location(player_id)?;
        let (position, rotation) = self
            .players
            .get(&player_id)
            .map(|player| (player.position, player.rotation))
            .ok_or(WorldError::UnknownPlayer(player_id))?;

        let avatar_id = self.entity_ids.allocate();
        let mut avatar = Entity::new(
            avatar_id,
            EntityKind::Avatar { owner: player_id },
            position,
            VisionLevel::Normal,
        );
        avatar.rotation = rotation;
        let world = self
            .worlds
            .get_mut(&world_id)
            .ok_or(WorldError::UnknownWorld(world_id))?;
        let ai_world = world.is_ai_world();
        let scene = world
            .scenes
            .get_mut(&scene_id)
            .ok_or(WorldError::UnknownScene(scene_id))?;
        scene.add_entity(avatar)?;
        scene.add_player(player_id);
        if let Some(player) = self.players.get_mut(&player_id) {
            player.avatar = Some(avatar_id);
        }

        if ai_world {
            self.move_peer(player_id, Some(position), self_reason, DisappearReason::Miss, sink)?;
        } else {
            self.sync_observers(
                world_id,
                scene_id,
                &[avatar_id],
                others_reason,
                DisappearReason::Miss,
                sink,
            )?;
        }
        self.evaluate_view(player_id, now_ms, true, self_reason, DisappearReason::Miss, sink)?;
        Ok(())
    }

    /// Removes the player's avatar from its scene and clears everything the client was shown.
    fn exit_scene(
        &mut self,
        player_id: PlayerId,
        reason: DisappearReason,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let (world_id, scene_id) = self.player_location(player_id)?;
        let ai_world = self
            .worlds
            .get(&world_id)
            .map(World::is_ai_world)
            .ok_or(WorldError::UnknownWorld(world_id))?;
        if ai_world {
            self.move_peer(player_id, None, AppearReason::Meet, reason, sink)?;
        }

        let avatar = self.players.get_mut(&player_id).and_then(|p| p.avatar.take());
        if let Some(world) = self.worlds.get_mut(&world_id) {
            if let Some(scene) = world.scenes.get_mut(&scene_id) {
                scene.remove_player(player_id);
                if let Some(avatar_id) = avatar {
                    scene.remove_entity(avatar_id)?;
                }
            }
        }
        if let Some(avatar_id) = avatar {
            self.sync_observers(
                world_id,
                scene_id,
                &[avatar_id],
                AppearReason::Meet,
                reason,
                sink,
            )?;
        }

        let max_batch = self.config.visibility.max_batch;
        if let Some(player) = self.players.get_mut(&player_id) {
            let shown = player.ledger.clear();
            send_disappear(sink, player_id, reason, shown, max_batch);
        }
        self.unload_unwatched_groups(world_id, scene_id, sink)?;
        Ok(())
    }

    fn own_world_id(&self, player_id: PlayerId) -> Result<WorldId, WorldError> {
        let preferred = WorldId(player_id.0);
        match self.worlds.get(&preferred) {
            Some(world) if world.owner != player_id => (FIRST_SPARE_WORLD_ID..=u32::MAX)
                .map(WorldId)
                .find(|id| !self.worlds.contains_key(id))
                .ok_or(WorldError::NoFreeWorldId(player_id)),
            _ => Ok(preferred),
        }
    }

    fn spawn_near_player(
        &mut self,
        player_id: PlayerId,
        kind: EntityKind,
        position: Option<Vec3>,
        count: u32,
        sink: &mut dyn NotificationSink,
    ) -> Result<Vec<EntityId>, WorldError> {
        let (world_id, scene_id) = self.player_location(player_id)?;
        let position = match position {
            Some(position) => position,
            None => self
                .players
                .get(&player_id)
                .map(|player| player.position)
                .ok_or(WorldError::UnknownPlayer(player_id))?,
        };
        let scene = self
            .worlds
            .get_mut(&world_id)
            .and_then(|world| world.scenes.get_mut(&scene_id))
            .ok_or(WorldError::UnknownScene(scene_id))?;
        scene.validate_position(position)?;

        let mut spawned = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let entity_id = self.entity_ids.allocate();
            scene.add_entity(Entity::new(entity_id, kind, position, VisionLevel::Normal))?;
            spawned.push(entity_id);
        }
        self.sync_observers(
            world_id,
            scene_id,
            &spawned,
            AppearReason::Born,
            DisappearReason::Miss,
            sink,
        )?;
        info!(
            player_id = player_id.0,
            entity_type = ?kind.entity_type(),
            config_id = kind.config_id(),
            count,
            "entities_created"
        );
        Ok(spawned)
    }

    #[cfg(test)]
    pub(crate) fn ledger_source(
        &self,
        player_id: PlayerId,
        entity_id: EntityId,
    ) -> Option<crate::visibility::ViewSource> {
        self.players.get(&player_id)?.ledger.source(entity_id)
    }
}
