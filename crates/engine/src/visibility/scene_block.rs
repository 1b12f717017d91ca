use std::collections::BTreeSet;

use tracing::debug;

use crate::config::GroupMemberKind;
use crate::world::{
    Entity, EntityDescriptor, EntityId, EntityKind, PlayerId, SceneId, WorldError, WorldId,
    WorldManager,
};

use super::ledger::ViewSource;
use super::notify::{send_appear, send_disappear, AppearReason, DisappearReason, NotificationSink};

impl WorldManager {
    /// Re-runs a player's scene view: group load/unload around it, then the entity diff.
    /// Unless forced, at most one pass runs per check interval; a skipped pass leaves the
    /// player marked dirty for the next flush.
    pub(crate) fn evaluate_view(
        &mut self,
        player_id: PlayerId,
        now_ms: u64,
        force: bool,
        appear: AppearReason,
        disappear: DisappearReason,
        sink: &mut dyn NotificationSink,
    ) -> Result<bool, WorldError> {
        let interval = self.config.visibility.group_check_interval_ms;
        let player = self
            .players
            .get_mut(&player_id)
            .ok_or(WorldError::UnknownPlayer(player_id))?;
        if !force {
            if let Some(last) = player.last_visibility_check_ms {
                if now_ms < last.saturating_add(interval) {
                    player.visibility_dirty = true;
                    return Ok(false);
                }
            }
        }
        player.last_visibility_check_ms = Some(now_ms);
        player.visibility_dirty = false;

        self.update_groups(player_id, sink)?;
        self.diff_scene_view(player_id, appear, disappear, sink)?;
        Ok(true)
    }

    /// Runs the pass for every player whose last pass was throttled and whose interval has
    /// since elapsed.
    pub fn flush_pending_visibility(&mut self, now_ms: u64, sink: &mut dyn NotificationSink) {
        let interval = self.config.visibility.group_check_interval_ms;
        let pending: Vec<PlayerId> = self
            .players
            .values()
            .filter(|player| {
                player.visibility_dirty
                    && player
                        .last_visibility_check_ms
                        .map_or(true, |last| now_ms >= last.saturating_add(interval))
            })
            .map(|player| player.id)
            .collect();
        for player_id in pending {
            if let Err(error) = self.evaluate_view(
                player_id,
                now_ms,
                false,
                AppearReason::Meet,
                DisappearReason::Miss,
                sink,
            ) {
                debug!(player_id = player_id.0, %error, "pending_visibility_skipped");
            }
        }
    }

    /// Loads groups now in range of the player and unloads those nobody is near any more.
    fn update_groups(
        &mut self,
        player_id: PlayerId,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let (world_id, scene_id) = self.player_location(player_id)?;
        let position = self
            .players
            .get(&player_id)
            .map(|player| player.position)
            .ok_or(WorldError::UnknownPlayer(player_id))?;
        let world = self
            .worlds
            .get(&world_id)
            .ok_or(WorldError::UnknownWorld(world_id))?;
        let multiplayer = world.is_multiplayer();
        let scene = world
            .scenes
            .get(&scene_id)
            .ok_or(WorldError::UnknownScene(scene_id))?;

        let in_range = scene.groups_in_range(position)?;
        let to_load: Vec<u32> = in_range
            .iter()
            .copied()
            .filter(|group_id| !scene.is_group_loaded(*group_id))
            .collect();
        let to_unload: Vec<u32> = scene
            .loaded_group_ids()
            .into_iter()
            .filter(|group_id| !in_range.contains(group_id))
            .filter(|group_id| {
                !multiplayer
                    || !scene.players().any(|other| {
                        other != player_id
                            && self
                                .players
                                .get(&other)
                                .is_some_and(|p| scene.group_in_range(*group_id, p.position))
                    })
            })
            .collect();

        for group_id in to_unload {
            self.unload_group(world_id, scene_id, group_id, sink)?;
        }
        for group_id in to_load {
            self.load_group(world_id, scene_id, group_id, sink)?;
        }
        Ok(())
    }

    /// Unloads every loaded group that no player of the scene is within range of.
    pub(crate) fn unload_unwatched_groups(
        &mut self,
        world_id: WorldId,
        scene_id: SceneId,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let Some(scene) = self.scene(world_id, scene_id) else {
            return Ok(());
        };
        let unwatched: Vec<u32> = scene
            .loaded_group_ids()
            .into_iter()
            .filter(|group_id| {
                !scene.players().any(|player_id| {
                    self.players
                        .get(&player_id)
                        .is_some_and(|p| scene.group_in_range(*group_id, p.position))
                })
            })
            .collect();
        for group_id in unwatched {
            self.unload_group(world_id, scene_id, group_id, sink)?;
        }
        Ok(())
    }

    fn load_group(
        &mut self,
        world_id: WorldId,
        scene_id: SceneId,
        group_id: u32,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let scene = self
            .worlds
            .get_mut(&world_id)
            .and_then(|world| world.scenes.get_mut(&scene_id))
            .ok_or(WorldError::UnknownScene(scene_id))?;
        let Some(group) = scene.group_config(group_id).cloned() else {
            return Ok(());
        };

        let mut spawned = Vec::with_capacity(group.members.len());
        for member in &group.members {
            let kind = match member.kind {
                GroupMemberKind::Monster => EntityKind::Monster {
                    monster_id: member.config_id,
                },
                GroupMemberKind::Npc => EntityKind::Npc {
                    npc_id: member.config_id,
                },
                GroupMemberKind::Gadget => EntityKind::Gadget {
                    gadget_id: member.config_id,
                },
            };
            let entity_id = self.entity_ids.allocate();
            let mut entity = Entity::new(entity_id, kind, member.position, member.vision_level);
            entity.group_id = Some(group_id);
            scene.add_entity(entity)?;
            spawned.push(entity_id);
        }
        scene.mark_group_loaded(group_id, spawned.clone());
        debug!(
            world_id = world_id.0,
            scene_id = scene_id.0,
            group_id,
            entities = spawned.len(),
            "group_loaded"
        );
        self.sync_observers(
            world_id,
            scene_id,
            &spawned,
            AppearReason::Born,
            DisappearReason::Miss,
            sink,
        )
    }

    fn unload_group(
        &mut self,
        world_id: WorldId,
        scene_id: SceneId,
        group_id: u32,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let scene = self
            .worlds
            .get_mut(&world_id)
            .and_then(|world| world.scenes.get_mut(&scene_id))
            .ok_or(WorldError::UnknownScene(scene_id))?;
        let members = scene.take_group(group_id).unwrap_or_default();
        let mut removed = Vec::with_capacity(members.len());
        for entity_id in members {
            if scene.remove_entity(entity_id).is_ok() {
                removed.push(entity_id);
            }
        }
        debug!(
            world_id = world_id.0,
            scene_id = scene_id.0,
            group_id,
            entities = removed.len(),
            "group_unloaded"
        );
        self.sync_observers(
            world_id,
            scene_id,
            &removed,
            AppearReason::Meet,
            DisappearReason::Miss,
            sink,
        )
    }

    /// Diffs what the player should see in its scene against what it was shown by the scene
    /// pass. Disappears go out before appears.
    fn diff_scene_view(
        &mut self,
        player_id: PlayerId,
        appear: AppearReason,
        disappear: DisappearReason,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let max_batch = self.config.visibility.max_batch;
        let (world_id, scene_id) = self.player_location(player_id)?;
        let world = self
            .worlds
            .get(&world_id)
            .ok_or(WorldError::UnknownWorld(world_id))?;
        let ai_world = world.is_ai_world();
        let scene = world
            .scenes
            .get(&scene_id)
            .ok_or(WorldError::UnknownScene(scene_id))?;
        let player = self
            .players
            .get_mut(&player_id)
            .ok_or(WorldError::UnknownPlayer(player_id))?;

        let visible: BTreeSet<EntityId> = scene
            .visible_from(player.position)?
            .into_iter()
            .filter(|entity_id| Some(*entity_id) != player.avatar)
            .filter(|entity_id| {
                !ai_world || !scene.entity(*entity_id).is_some_and(|e| e.kind.is_avatar())
            })
            .collect();

        let stale: Vec<EntityId> = player
            .ledger
            .ids_from(ViewSource::Scene)
            .into_iter()
            .filter(|entity_id| !visible.contains(entity_id))
            .collect();
        for entity_id in &stale {
            player.ledger.evict(*entity_id);
        }
        let fresh: Vec<EntityDescriptor> = visible
            .iter()
            .filter(|entity_id| player.ledger.admit(**entity_id, ViewSource::Scene))
            .filter_map(|entity_id| scene.entity(*entity_id).map(Entity::descriptor))
            .collect();

        send_disappear(sink, player_id, disappear, stale, max_batch);
        send_appear(sink, player_id, appear, fresh, max_batch);
        Ok(())
    }

    /// Reconciles the given entities against the view of every player in the scene. Removed
    /// entities disappear; entities now in range appear.
    pub(crate) fn sync_observers(
        &mut self,
        world_id: WorldId,
        scene_id: SceneId,
        entity_ids: &[EntityId],
        appear: AppearReason,
        disappear: DisappearReason,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        if entity_ids.is_empty() {
            return Ok(());
        }
        let max_batch = self.config.visibility.max_batch;
        let world = self
            .worlds
            .get(&world_id)
            .ok_or(WorldError::UnknownWorld(world_id))?;
        let ai_world = world.is_ai_world();
        let Some(scene) = world.scenes.get(&scene_id) else {
            return Ok(());
        };

        for observer in scene.players() {
            let Some(player) = self.players.get_mut(&observer) else {
                continue;
            };
            let mut gone = Vec::new();
            let mut came = Vec::new();
            for entity_id in entity_ids {
                if player.avatar == Some(*entity_id) {
                    continue;
                }
                let entity = scene.entity(*entity_id);
                if ai_world && entity.is_some_and(|e| e.kind.is_avatar()) {
                    continue;
                }
                let visible = entity.is_some() && scene.can_observe(player.position, *entity_id);
                if visible {
                    if player.ledger.admit(*entity_id, ViewSource::Scene) {
                        if let Some(entity) = entity {
                            came.push(entity.descriptor());
                        }
                    }
                } else if player.ledger.source(*entity_id) == Some(ViewSource::Scene) {
                    player.ledger.evict(*entity_id);
                    gone.push(*entity_id);
                }
            }
            send_disappear(sink, observer, disappear, gone, max_batch);
            send_appear(sink, observer, appear, came, max_batch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::aoi::{GridBounds, GridShape, VisionLevel};
    use crate::config::{GroupConfig, GroupMemberConfig, SceneConfig, ServerConfig};
    use crate::math::Vec3;
    use crate::visibility::RecordingSink;
    use crate::world::{PlayerSnapshot, WorldChoice};

    use super::*;

    fn grouped_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.scenes.push(SceneConfig {
            id: 7,
            bounds: GridBounds {
                min: Vec3::new(-2000.0, -100.0, -2000.0),
                max: Vec3::new(2000.0, 100.0, 2000.0),
            },
            shape: GridShape::Planar,
            groups: vec![GroupConfig {
                id: 70001,
                anchor: Vec3::new(0.0, 0.0, 0.0),
                trigger_radius: None,
                members: vec![GroupMemberConfig {
                    kind: GroupMemberKind::Monster,
                    config_id: 21010101,
                    position: Vec3::new(5.0, 0.0, 5.0),
                    vision_level: VisionLevel::Normal,
                }],
            }],
        });
        config
    }

    fn join(worlds: &mut WorldManager, id: u32, choice: WorldChoice, position: Vec3) {
        let mut sink = RecordingSink::default();
        worlds
            .player_join(
                PlayerSnapshot {
                    player_id: PlayerId(id),
                    scene_id: SceneId(7),
                    position,
                    rotation: Vec3::ZERO,
                },
                choice,
                0,
                &mut sink,
            )
            .expect("join");
    }

    #[test]
    fn groups_load_on_join_and_stay_for_a_nearby_guest() {
        let mut worlds = WorldManager::new(Arc::new(grouped_config())).expect("manager");
        join(&mut worlds, 1, WorldChoice::Own, Vec3::ZERO);
        join(&mut worlds, 2, WorldChoice::Join(PlayerId(1)), Vec3::new(10.0, 0.0, 0.0));
        let scene = worlds.scene(WorldId(1), SceneId(7)).expect("scene");
        assert!(scene.is_group_loaded(70001));
        assert_eq!(scene.entity_count(), 3);

        let mut sink = RecordingSink::default();
        worlds
            .teleport(PlayerId(1), SceneId(7), Vec3::new(1500.0, 0.0, 0.0), 500, &mut sink)
            .expect("teleport");
        let scene = worlds.scene(WorldId(1), SceneId(7)).expect("scene");
        assert!(scene.is_group_loaded(70001), "guest still near the group");
    }

    #[test]
    fn throttled_passes_are_flushed_later() {
        let mut worlds = WorldManager::new(Arc::new(grouped_config())).expect("manager");
        join(&mut worlds, 1, WorldChoice::Own, Vec3::new(900.0, 0.0, 0.0));
        let mut sink = RecordingSink::default();
        let evaluated = worlds
            .evaluate_view(PlayerId(1), 100, false, AppearReason::Meet, DisappearReason::Miss, &mut sink)
            .expect("evaluate");
        assert!(!evaluated);
        assert!(worlds.player(PlayerId(1)).is_some_and(|p| p.visibility_dirty));

        worlds.flush_pending_visibility(150, &mut sink);
        assert!(worlds.player(PlayerId(1)).is_some_and(|p| p.visibility_dirty));
        worlds.flush_pending_visibility(200, &mut sink);
        assert!(worlds.player(PlayerId(1)).is_some_and(|p| !p.visibility_dirty));
    }
}
