use tracing::{debug, info};

use crate::aoi::VisionLevel;
use crate::math::Vec3;
use crate::physics::{RigidBody, StepEvent};
use crate::visibility::{AppearReason, DisappearReason, Notification, NotificationSink};

use super::entity::{Entity, EntityId, EntityKind, FightProp, PlayerId, SceneId, WorldId};
use super::instance::{World, AI_WORLD_ID};
use super::manager::{ForwardTarget, ProjectileLaunch, WorldManager};
use super::WorldError;

impl WorldManager {
    /// Spawns a projectile entity at the launch point and hands it to the physics engine.
    /// Only the AI world simulates projectiles.
    pub fn fire_projectile(
        &mut self,
        player_id: PlayerId,
        launch: ProjectileLaunch,
        sink: &mut dyn NotificationSink,
    ) -> Result<EntityId, WorldError> {
        for value in [
            launch.velocity.x,
            launch.velocity.y,
            launch.velocity.z,
            launch.drag,
            launch.mass,
        ] {
            if !value.is_finite() {
                return Err(WorldError::NonFinite(value));
            }
        }
        let (world_id, scene_id) = self.player_location(player_id)?;
        let shooter = self
            .players
            .get(&player_id)
            .and_then(|player| player.avatar)
            .ok_or(WorldError::NoAvatar(player_id))?;
        let world = self
            .worlds
            .get(&world_id)
            .ok_or(WorldError::UnknownWorld(world_id))?;
        if world.physics.is_none() {
            return Err(WorldError::NotInAiWorld(player_id));
        }
        world
            .scenes
            .get(&scene_id)
            .ok_or(WorldError::UnknownScene(scene_id))?
            .validate_position(launch.position)?;

        let entity_id = match launch.client_entity_id {
            Some(entity_id) => {
                self.claim_client_id(world_id, scene_id, shooter, entity_id, sink)?;
                entity_id
            }
            None => self.entity_ids.allocate(),
        };
        let kind = EntityKind::Projectile {
            gadget_id: launch.gadget_id,
            shooter,
        };
        let world = self
            .worlds
            .get_mut(&world_id)
            .ok_or(WorldError::UnknownWorld(world_id))?;
        let scene = world
            .scenes
            .get_mut(&scene_id)
            .ok_or(WorldError::UnknownScene(scene_id))?;
        scene.add_entity(Entity::new(
            entity_id,
            kind,
            launch.position,
            VisionLevel::Normal,
        ))?;
        if let Some(physics) = world.physics.as_mut() {
            physics.spawn(RigidBody {
                entity_id,
                scene_id,
                position: launch.position,
                velocity: launch.velocity,
                drag: launch.drag,
                mass: launch.mass,
                shooter,
            });
        }
        self.sync_observers(
            world_id,
            scene_id,
            &[entity_id],
            AppearReason::Born,
            DisappearReason::Miss,
            sink,
        )?;
        debug!(
            player_id = player_id.0,
            entity_id = entity_id.0,
            gadget_id = launch.gadget_id,
            "projectile_fired"
        );
        Ok(entity_id)
    }

    /// Takes a client-chosen projectile id. A live projectile from the same shooter under that
    /// id is replaced; any other holder of the id is a conflict.
    fn claim_client_id(
        &mut self,
        world_id: WorldId,
        scene_id: SceneId,
        shooter: EntityId,
        entity_id: EntityId,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        if let Some(location) = self.locate_entity(entity_id) {
            let same_shooter = matches!(
                self.entity(entity_id).map(|entity| entity.kind),
                Some(EntityKind::Projectile { shooter: owner, .. }) if owner == shooter
            );
            if location != (world_id, scene_id) || !same_shooter {
                return Err(WorldError::DuplicateEntity(entity_id));
            }
            self.despawn(world_id, scene_id, entity_id, DisappearReason::Replace, sink)?;
            debug!(entity_id = entity_id.0, "projectile_replaced");
        }
        self.entity_ids.reserve(entity_id);
        Ok(())
    }

    /// Client-reported end of life for a gadget or projectile it spawned.
    pub fn destroy_client_entity(
        &mut self,
        player_id: PlayerId,
        entity_id: EntityId,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let (world_id, scene_id) = self.player_location(player_id)?;
        let own_avatar = self.players.get(&player_id).and_then(|p| p.avatar);
        let kind = self
            .scene(world_id, scene_id)
            .and_then(|scene| scene.entity(entity_id))
            .map(|entity| entity.kind)
            .ok_or(WorldError::UnknownEntity(entity_id))?;
        let allowed = match kind {
            EntityKind::Gadget { .. } => true,
            EntityKind::Projectile { shooter, .. } => Some(shooter) == own_avatar,
            EntityKind::Avatar { .. } | EntityKind::Monster { .. } | EntityKind::Npc { .. } => {
                false
            }
        };
        if !allowed {
            return Err(WorldError::NotOwner {
                player: player_id,
                entity: entity_id,
            });
        }
        self.despawn(world_id, scene_id, entity_id, DisappearReason::Miss, sink)?;
        Ok(())
    }

    /// Relays an opaque combat payload about `entity_id` to the players that can see it.
    pub fn forward_combat(
        &mut self,
        player_id: PlayerId,
        target: ForwardTarget,
        entity_id: EntityId,
        payload: Vec<u8>,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let (world_id, scene_id) = self.player_location(player_id)?;
        if self
            .scene(world_id, scene_id)
            .and_then(|scene| scene.entity(entity_id))
            .is_none()
        {
            return Err(WorldError::UnknownEntity(entity_id));
        }
        let notification = Notification::CombatForward {
            source: player_id,
            entity_id,
            payload,
        };
        match target {
            ForwardTarget::ToAll => {
                self.broadcast_to_observers(world_id, scene_id, entity_id, notification, None, sink)
            }
            ForwardTarget::ToAllExceptSelf => self.broadcast_to_observers(
                world_id,
                scene_id,
                entity_id,
                notification,
                Some(player_id),
                sink,
            ),
            ForwardTarget::ToHost => {
                let host = self.worlds.get(&world_id).map(World::owner);
                let host_here = host
                    .and_then(|host| self.players.get(&host))
                    .filter(|host| host.scene_id == scene_id)
                    .map(|host| host.id);
                if let Some(host) = host_here {
                    sink.deliver(host, notification);
                }
            }
        }
        Ok(())
    }

    /// Advances projectile physics by `elapsed_ms`, mirrors body positions onto their entities
    /// and resolves hits and expiries.
    pub fn step_physics(
        &mut self,
        elapsed_ms: u64,
        sink: &mut dyn NotificationSink,
    ) -> Vec<StepEvent> {
        let dt = elapsed_ms as f32 / 1_000.0;
        let players = &self.players;
        let Some(World {
            physics: Some(physics),
            scenes,
            ..
        }) = self.worlds.get_mut(&AI_WORLD_ID)
        else {
            return Vec::new();
        };
        if physics.is_empty() {
            return Vec::new();
        }

        let events = physics.step(dt, scenes, |entity| {
            entity
                .kind
                .avatar_owner()
                .and_then(|owner| players.get(&owner))
                .is_some_and(|owner| owner.avatar == Some(entity.id))
        });

        let mut crossed: Vec<(SceneId, EntityId)> = Vec::new();
        for body in physics.bodies() {
            let Some(scene) = scenes.get_mut(&body.scene_id) else {
                continue;
            };
            let Some(rotation) = scene.entity(body.entity_id).map(|e| e.rotation) else {
                continue;
            };
            // Bodies that just left the scene are expired on the next step.
            if let Ok(change) = scene.move_entity(body.entity_id, body.position, rotation) {
                if change.crossed() {
                    crossed.push((body.scene_id, body.entity_id));
                }
            }
        }

        for (scene_id, entity_id) in crossed {
            if let Err(error) = self.sync_observers(
                AI_WORLD_ID,
                scene_id,
                &[entity_id],
                AppearReason::Meet,
                DisappearReason::Miss,
                sink,
            ) {
                debug!(entity_id = entity_id.0, %error, "projectile_sync_failed");
            }
        }
        for event in &events {
            self.resolve_step_event(*event, sink);
        }
        events
    }

    fn resolve_step_event(&mut self, event: StepEvent, sink: &mut dyn NotificationSink) {
        match event {
            StepEvent::Hit {
                body,
                target,
                shooter,
                position,
            } => {
                self.remove_projectile(body, DisappearReason::Die, sink);
                let damage = self.config.physics.projectile_damage;
                let Some(current) = self.entity(target).map(|e| e.fight_prop(FightProp::CurHp))
                else {
                    return;
                };
                let remaining = (current - damage).max(0.0);
                if let Err(error) = self.set_fight_prop(target, FightProp::CurHp, remaining, sink) {
                    debug!(entity_id = target.0, %error, "projectile_damage_skipped");
                }
                info!(
                    projectile = body.0,
                    target = target.0,
                    shooter = shooter.0,
                    x = position.x,
                    y = position.y,
                    z = position.z,
                    remaining_hp = remaining,
                    "projectile_hit"
                );
            }
            StepEvent::Expired { body, reason } => {
                self.remove_projectile(body, DisappearReason::Miss, sink);
                debug!(projectile = body.0, ?reason, "projectile_expired");
            }
        }
    }

    fn remove_projectile(
        &mut self,
        entity_id: EntityId,
        reason: DisappearReason,
        sink: &mut dyn NotificationSink,
    ) {
        let Some((world_id, scene_id)) = self.locate_entity(entity_id) else {
            return;
        };
        if let Err(error) = self.despawn(world_id, scene_id, entity_id, reason, sink) {
            debug!(entity_id = entity_id.0, %error, "projectile_removal_failed");
        }
    }
}
