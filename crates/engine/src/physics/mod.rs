use std::collections::BTreeMap;

use tracing::debug;

use crate::config::PhysicsConfig;
use crate::math::Vec3;
use crate::world::{Entity, EntityId, Scene, SceneId};

/// Transient flight state of one projectile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidBody {
    pub entity_id: EntityId,
    pub scene_id: SceneId,
    pub position: Vec3,
    pub velocity: Vec3,
    pub drag: f32,
    pub mass: f32,
    /// Never collides with this entity.
    pub shooter: EntityId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireReason {
    SceneGone,
    OutOfBounds,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepEvent {
    Hit {
        body: EntityId,
        target: EntityId,
        shooter: EntityId,
        position: Vec3,
    },
    Expired {
        body: EntityId,
        reason: ExpireReason,
    },
}

#[derive(Debug, Clone)]
pub struct PhysicsEngine {
    bodies: BTreeMap<EntityId, RigidBody>,
    gravity: f32,
    avatar_radius: f32,
    avatar_height: f32,
}

impl PhysicsEngine {
    pub fn new(config: &PhysicsConfig) -> Self {
        Self {
            bodies: BTreeMap::new(),
            gravity: config.gravity,
            avatar_radius: config.avatar_radius,
            avatar_height: config.avatar_height,
        }
    }

    /// Registers a body. An existing body with the same id is replaced and returned.
    pub fn spawn(&mut self, body: RigidBody) -> Option<RigidBody> {
        self.bodies.insert(body.entity_id, body)
    }

    pub fn despawn(&mut self, entity_id: EntityId) -> Option<RigidBody> {
        self.bodies.remove(&entity_id)
    }

    pub fn body(&self, entity_id: EntityId) -> Option<&RigidBody> {
        self.bodies.get(&entity_id)
    }

    pub fn bodies(&self) -> impl Iterator<Item = &RigidBody> {
        self.bodies.values()
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn clear(&mut self) {
        self.bodies.clear();
    }

    /// Advances every body by `dt` seconds. Bodies whose scene is gone or emptied, or that left
    /// the scene bounds on any axis, expire before integrating; a body that sweeps through an eligible avatar is
    /// destroyed and reported as a hit.
    pub fn step<F>(
        &mut self,
        dt: f32,
        scenes: &BTreeMap<SceneId, Scene>,
        is_active_avatar: F,
    ) -> Vec<StepEvent>
    where
        F: Fn(&Entity) -> bool,
    {
        let mut events = Vec::new();
        if !dt.is_finite() || dt < 0.0 {
            return events;
        }

        let mut finished = Vec::new();
        for body in self.bodies.values_mut() {
            let Some(scene) = scenes.get(&body.scene_id).filter(|scene| scene.entity_count() > 0)
            else {
                finished.push(body.entity_id);
                events.push(StepEvent::Expired {
                    body: body.entity_id,
                    reason: ExpireReason::SceneGone,
                });
                continue;
            };
            if !scene.contains_volume(body.position) {
                finished.push(body.entity_id);
                events.push(StepEvent::Expired {
                    body: body.entity_id,
                    reason: ExpireReason::OutOfBounds,
                });
                continue;
            }

            body.velocity = Vec3::new(
                apply_drag(body.velocity.x, body.drag, dt),
                apply_drag(body.velocity.y, body.drag, dt),
                apply_drag(body.velocity.z, body.drag, dt),
            );
            body.velocity.y += self.gravity * dt;

            let start = body.position;
            let end = start + body.velocity * dt;
            body.position = end;

            let sweep_min = start.component_min(end);
            let sweep_max = start.component_max(end);
            let radius = self.avatar_radius;
            let height = self.avatar_height;
            let candidates = scene.entities_in_box(
                Vec3::new(sweep_min.x - radius, sweep_min.y - height, sweep_min.z - radius),
                Vec3::new(sweep_max.x + radius, sweep_max.y, sweep_max.z + radius),
            );
            let hit = candidates.into_iter().find_map(|candidate| {
                let entity = scene.entity(candidate)?;
                let eligible = entity.kind.is_avatar()
                    && entity.id != body.shooter
                    && entity.is_alive()
                    && is_active_avatar(entity);
                (eligible && sweep_overlaps_avatar(sweep_min, sweep_max, entity.position, radius, height))
                    .then_some(entity.id)
            });
            if let Some(target) = hit {
                finished.push(body.entity_id);
                events.push(StepEvent::Hit {
                    body: body.entity_id,
                    target,
                    shooter: body.shooter,
                    position: end,
                });
            }
        }

        for entity_id in finished {
            self.bodies.remove(&entity_id);
        }
        if !events.is_empty() {
            debug!(events = events.len(), live = self.bodies.len(), "physics_step");
        }
        events
    }
}

/// Linear drag that clamps to zero instead of overshooting past it.
pub fn apply_drag(velocity: f32, drag: f32, dt: f32) -> f32 {
    let reduction = drag * velocity * dt;
    if reduction.abs() >= velocity.abs() {
        0.0
    } else {
        velocity - reduction
    }
}

/// Per-axis interval overlap of the sweep box against the avatar box (feet at `feet`).
fn sweep_overlaps_avatar(
    sweep_min: Vec3,
    sweep_max: Vec3,
    feet: Vec3,
    radius: f32,
    height: f32,
) -> bool {
    let overlaps = |low: f32, high: f32, other_low: f32, other_high: f32| {
        low <= other_high && high >= other_low
    };
    overlaps(sweep_min.x, sweep_max.x, feet.x - radius, feet.x + radius)
        && overlaps(sweep_min.y, sweep_max.y, feet.y, feet.y + height)
        && overlaps(sweep_min.z, sweep_max.z, feet.z - radius, feet.z + radius)
}
