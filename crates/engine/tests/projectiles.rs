use std::sync::Arc;

use engine::config::{PhysicsConfig, ServerConfig};
use engine::math::Vec3;
use engine::physics::{ExpireReason, StepEvent};
use engine::visibility::{DisappearReason, Notification, RecordingSink};
use engine::world::{
    EntityId, FightProp, PlayerId, PlayerSnapshot, ProjectileLaunch, SceneId, WorldChoice,
    WorldManager, DEFAULT_MAX_HP,
};

fn weightless() -> WorldManager {
    let config = ServerConfig {
        physics: PhysicsConfig {
            gravity: 0.0,
            ..PhysicsConfig::default()
        },
        ..ServerConfig::default()
    };
    WorldManager::new(Arc::new(config)).expect("manager")
}

fn join_ai(
    worlds: &mut WorldManager,
    id: u32,
    position: Vec3,
    sink: &mut RecordingSink,
) -> EntityId {
    worlds
        .player_join(
            PlayerSnapshot {
                player_id: PlayerId(id),
                scene_id: SceneId(3),
                position,
                rotation: Vec3::ZERO,
            },
            WorldChoice::AiWorld,
            0,
            sink,
        )
        .expect("join");
    worlds
        .player(PlayerId(id))
        .and_then(|player| player.avatar())
        .expect("avatar")
}

fn fire(
    worlds: &mut WorldManager,
    shooter: u32,
    velocity: Vec3,
    drag: f32,
    sink: &mut RecordingSink,
) -> EntityId {
    worlds
        .fire_projectile(
            PlayerId(shooter),
            ProjectileLaunch {
                client_entity_id: None,
                gadget_id: 41_000_001,
                position: Vec3::ZERO,
                velocity,
                drag,
                mass: 1.0,
            },
            sink,
        )
        .expect("fire")
}

fn body_velocity(worlds: &WorldManager, projectile: EntityId) -> Option<Vec3> {
    worlds
        .ai_world()
        .and_then(|world| world.physics())
        .and_then(|physics| physics.body(projectile))
        .map(|body| body.velocity)
}

#[test]
fn a_projectile_short_of_its_target_stays_live() {
    let mut worlds = weightless();
    let mut sink = RecordingSink::default();
    join_ai(&mut worlds, 1, Vec3::ZERO, &mut sink);
    join_ai(&mut worlds, 2, Vec3::new(0.0, 0.0, 100.0), &mut sink);
    let projectile = fire(&mut worlds, 1, Vec3::new(0.0, 0.0, 10.0), 0.0, &mut sink);

    for _ in 0..5 {
        let events = worlds.step_physics(1_000, &mut sink);
        assert!(events.is_empty(), "unexpected events {events:?}");
    }

    let entity = worlds.entity(projectile).expect("projectile still tracked");
    assert!((entity.position.z - 50.0).abs() < 1e-3);
    assert!(body_velocity(&worlds, projectile).is_some());
}

#[test]
fn a_projectile_reaching_an_avatar_hits_and_is_destroyed() {
    let mut worlds = weightless();
    let mut sink = RecordingSink::default();
    let shooter = join_ai(&mut worlds, 1, Vec3::ZERO, &mut sink);
    let target = join_ai(&mut worlds, 2, Vec3::new(0.0, 0.0, 9.6), &mut sink);
    let projectile = fire(&mut worlds, 1, Vec3::new(0.0, 0.0, 10.0), 0.0, &mut sink);
    sink.clear();

    let events = worlds.step_physics(1_000, &mut sink);
    assert!(matches!(
        events.as_slice(),
        [StepEvent::Hit { body, target: hit, shooter: from, .. }]
            if *body == projectile && *hit == target && *from == shooter
    ));

    assert!(worlds.entity(projectile).is_none());
    assert!(body_velocity(&worlds, projectile).is_none());
    assert!(worlds.step_physics(1_000, &mut sink).is_empty());

    let damage = PhysicsConfig::default().projectile_damage;
    let hp = worlds
        .entity(target)
        .map(|entity| entity.fight_prop(FightProp::CurHp))
        .expect("target");
    assert_eq!(hp, DEFAULT_MAX_HP - damage);

    for observer in [PlayerId(1), PlayerId(2)] {
        let notifications = sink.for_player(observer);
        assert!(notifications.iter().any(|n| matches!(
            n,
            Notification::EntityDisappear { reason: DisappearReason::Die, entity_ids }
                if entity_ids == &vec![projectile]
        )));
        assert!(notifications.iter().any(|n| matches!(
            n,
            Notification::FightPropUpdate { entity_id, prop: FightProp::CurHp, .. }
                if *entity_id == target
        )));
    }
}

#[test]
fn drag_decays_each_axis_toward_zero_without_flipping_sign() {
    let mut worlds = weightless();
    let mut sink = RecordingSink::default();
    join_ai(&mut worlds, 1, Vec3::ZERO, &mut sink);
    let projectile = fire(&mut worlds, 1, Vec3::new(3.0, 0.0, -3.0), 0.5, &mut sink);

    let mut previous = Vec3::new(3.0, 0.0, -3.0);
    for _ in 0..50 {
        worlds.step_physics(100, &mut sink);
        let velocity = body_velocity(&worlds, projectile).expect("body");
        assert!(velocity.x >= 0.0 && velocity.x <= previous.x);
        assert!(velocity.z <= 0.0 && velocity.z >= previous.z);
        previous = velocity;
    }
    assert!(previous.x < 3.0);
}

#[test]
fn projectiles_outside_the_ai_world_are_refused() {
    let mut worlds = weightless();
    let mut sink = RecordingSink::default();
    worlds
        .player_join(
            PlayerSnapshot {
                player_id: PlayerId(5),
                scene_id: SceneId(3),
                position: Vec3::ZERO,
                rotation: Vec3::ZERO,
            },
            WorldChoice::Own,
            0,
            &mut sink,
        )
        .expect("join");

    let result = worlds.fire_projectile(
        PlayerId(5),
        ProjectileLaunch {
            client_entity_id: None,
            gadget_id: 1,
            position: Vec3::ZERO,
            velocity: Vec3::new(1.0, 0.0, 0.0),
            drag: 0.0,
            mass: 1.0,
        },
        &mut sink,
    );
    assert!(result.is_err());
    assert_eq!(worlds.status().projectiles, 0);
}

#[test]
fn a_missed_shot_falls_out_of_the_scene_and_expires() {
    let mut worlds = WorldManager::new(Arc::new(ServerConfig::default())).expect("manager");
    let mut sink = RecordingSink::default();
    join_ai(&mut worlds, 1, Vec3::ZERO, &mut sink);
    let projectile = worlds
        .fire_projectile(
            PlayerId(1),
            ProjectileLaunch {
                client_entity_id: None,
                gadget_id: 41_000_001,
                position: Vec3::new(0.0, 1.5, 0.0),
                velocity: Vec3::new(30.0, 0.0, 0.0),
                drag: 0.1,
                mass: 1.0,
            },
            &mut sink,
        )
        .expect("fire");

    let mut expired = false;
    for _ in 0..120 {
        let events = worlds.step_physics(1_000, &mut sink);
        if events.iter().any(|event| {
            matches!(
                event,
                StepEvent::Expired { body, reason: ExpireReason::OutOfBounds } if *body == projectile
            )
        }) {
            expired = true;
            break;
        }
    }
    assert!(expired, "projectile never left the scene");
    assert!(worlds.entity(projectile).is_none());
    assert_eq!(worlds.status().projectiles, 0);
}

#[test]
fn bodies_in_a_torn_down_scene_are_dropped() {
    let mut worlds = weightless();
    let mut sink = RecordingSink::default();
    join_ai(&mut worlds, 1, Vec3::ZERO, &mut sink);
    let projectile = fire(&mut worlds, 1, Vec3::new(1.0, 0.0, 0.0), 0.0, &mut sink);
    worlds.player_leave(PlayerId(1), &mut sink).expect("leave");
    assert_eq!(worlds.status().projectiles, 1);

    let events = worlds.step_physics(100, &mut sink);
    assert_eq!(
        events,
        vec![StepEvent::Expired {
            body: projectile,
            reason: ExpireReason::SceneGone,
        }]
    );
    assert_eq!(worlds.status().projectiles, 0);
}
