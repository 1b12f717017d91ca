use crate::world::{EntityMove, PlayerId, WorldError, WorldManager};

use super::notify::{AppearReason, DisappearReason, NotificationSink};

impl WorldManager {
    /// Applies a client position report. The target is validated first: an out-of-bounds or
    /// non-finite position changes nothing. Avatars drive their owner's view; any entity whose
    /// cell changed is reconciled against every observer in the scene.
    pub fn apply_entity_move(
        &mut self,
        player_id: PlayerId,
        report: EntityMove,
        now_ms: u64,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let (world_id, scene_id) = self.player_location(player_id)?;
        let own_avatar = self.players.get(&player_id).and_then(|p| p.avatar);
        let world = self
            .worlds
            .get_mut(&world_id)
            .ok_or(WorldError::UnknownWorld(world_id))?;
        let ai_world = world.is_ai_world();
        let scene = world
            .scenes
            .get_mut(&scene_id)
            .ok_or(WorldError::UnknownScene(scene_id))?;

        let entity = scene
            .entity(report.entity_id)
            .ok_or(WorldError::UnknownEntity(report.entity_id))?;
        let is_own_avatar = own_avatar == Some(report.entity_id);
        if entity.kind.is_avatar() && !is_own_avatar {
            return Err(WorldError::NotOwner {
                player: player_id,
                entity: report.entity_id,
            });
        }
        scene.validate_position(report.position)?;

        let change = scene.move_entity(report.entity_id, report.position, report.rotation)?;
        if let Some(entity) = scene.entity_mut(report.entity_id) {
            entity.motion_state = report.motion_state;
            entity.last_move_scene_time = report.scene_time;
            entity.last_move_reliable_seq = report.reliable_seq;
        }

        if is_own_avatar {
            if let Some(player) = self.players.get_mut(&player_id) {
                player.position = report.position;
                player.rotation = report.rotation;
            }
            if ai_world {
                self.move_peer(
                    player_id,
                    Some(report.position),
                    AppearReason::Meet,
                    DisappearReason::Miss,
                    sink,
                )?;
            }
            self.evaluate_view(
                player_id,
                now_ms,
                false,
                AppearReason::Meet,
                DisappearReason::Miss,
                sink,
            )?;
        }
        if change.crossed() {
            self.sync_observers(
                world_id,
                scene_id,
                &[report.entity_id],
                AppearReason::Meet,
                DisappearReason::Miss,
                sink,
            )?;
        }
        Ok(())
    }

    /// Forced view pass for one player, bypassing the check interval.
    pub fn refresh_visibility(
        &mut self,
        player_id: PlayerId,
        now_ms: u64,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        self.evaluate_view(
            player_id,
            now_ms,
            true,
            AppearReason::Meet,
            DisappearReason::Miss,
            sink,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::ServerConfig;
    use crate::math::Vec3;
    use crate::visibility::RecordingSink;
    use crate::world::{
        EntityId, MotionState, Player, PlayerSnapshot, SceneId, WorldChoice, WorldError,
    };

    use super::*;

    fn report(entity_id: EntityId, position: Vec3) -> EntityMove {
        EntityMove {
            entity_id,
            position,
            rotation: Vec3::ZERO,
            motion_state: MotionState::Run,
            scene_time: 0,
            reliable_seq: 0,
        }
    }

    fn online(worlds: &mut WorldManager, id: u32, choice: WorldChoice, position: Vec3) -> EntityId {
        let mut sink = RecordingSink::default();
        worlds
            .player_join(
                PlayerSnapshot {
                    player_id: PlayerId(id),
                    scene_id: SceneId(3),
                    position,
                    rotation: Vec3::ZERO,
                },
                choice,
                0,
                &mut sink,
            )
            .expect("join");
        worlds
            .player(PlayerId(id))
            .and_then(Player::avatar)
            .expect("avatar")
    }

    #[test]
    fn out_of_bounds_reports_are_dropped_whole() {
        let mut worlds = WorldManager::new(Arc::new(ServerConfig::default())).expect("manager");
        let avatar = online(&mut worlds, 1, WorldChoice::Own, Vec3::ZERO);
        let mut sink = RecordingSink::default();
        let result = worlds.apply_entity_move(
            PlayerId(1),
            report(avatar, Vec3::new(9_000.0, 0.0, 0.0)),
            1_000,
            &mut sink,
        );
        assert!(matches!(result, Err(WorldError::Aoi(_))));
        assert_eq!(worlds.player(PlayerId(1)).map(Player::position), Some(Vec3::ZERO));
        let entity = worlds.entity(avatar).expect("avatar");
        assert_eq!(entity.position, Vec3::ZERO);
        assert_eq!(entity.motion_state, MotionState::Standby);
        assert!(sink.delivered.is_empty());
    }

    #[test]
    fn players_cannot_move_someone_elses_avatar() {
        let mut worlds = WorldManager::new(Arc::new(ServerConfig::default())).expect("manager");
        online(&mut worlds, 1, WorldChoice::Own, Vec3::ZERO);
        let guest = online(&mut worlds, 2, WorldChoice::Join(PlayerId(1)), Vec3::ZERO);
        let mut sink = RecordingSink::default();
        assert_eq!(
            worlds.apply_entity_move(
                PlayerId(1),
                report(guest, Vec3::new(1.0, 0.0, 1.0)),
                0,
                &mut sink
            ),
            Err(WorldError::NotOwner {
                player: PlayerId(1),
                entity: guest,
            })
        );
    }

    #[test]
    fn crossing_cells_updates_other_observers_immediately() {
        let mut worlds = WorldManager::new(Arc::new(ServerConfig::default())).expect("manager");
        let host = online(&mut worlds, 1, WorldChoice::Own, Vec3::ZERO);
        online(&mut worlds, 2, WorldChoice::Join(PlayerId(1)), Vec3::new(5.0, 0.0, 5.0));

        let mut sink = RecordingSink::default();
        worlds
            .apply_entity_move(PlayerId(1), report(host, Vec3::new(200.0, 0.0, 0.0)), 10, &mut sink)
            .expect("move");
        assert_eq!(sink.disappeared(PlayerId(2)), vec![host]);

        sink.clear();
        worlds
            .apply_entity_move(PlayerId(1), report(host, Vec3::new(10.0, 0.0, 0.0)), 20, &mut sink)
            .expect("move back");
        assert_eq!(sink.appeared(PlayerId(2)), vec![host]);
    }
}
