use std::f32::consts::{PI, TAU};

use engine::aoi::{GridBounds, GridShape};
use engine::config::ServerConfig;
use engine::dispatch::{
    ExternalHandler, HandlerContext, InboundCommand, InboundMessage, LocalEvent, QueueClosed,
    QueueHandles,
};
use engine::math::Vec3;
use engine::world::{
    EntityMove, MotionState, PlayerId, PlayerSnapshot, ProjectileLaunch, SceneId, WorldChoice,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, trace, warn};

const BOT_COUNT_ENV_VAR: &str = "WORLDCORE_BOTS";
const BOT_RUN_SECS_ENV_VAR: &str = "WORLDCORE_BOT_RUN_SECS";
const BOT_SPEED_ENV_VAR: &str = "WORLDCORE_BOT_SPEED";
const BOT_SEED_ENV_VAR: &str = "WORLDCORE_BOT_SEED";

const FIRST_BOT_ID: u32 = 10_001;
const BOT_STEP_PERIOD_MS: u64 = 100;
const SPAWN_SPREAD: f32 = 60.0;
const FIRE_CHANCE: f64 = 0.05;
const PROJECTILE_GADGET_ID: u32 = 41_000_001;
const PROJECTILE_SPEED: f32 = 30.0;
const MUZZLE_HEIGHT: f32 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BotConfig {
    pub(crate) count: u32,
    pub(crate) run_secs: u64,
    pub(crate) speed: f32,
    pub(crate) seed: Option<u64>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            count: 4,
            run_secs: 10,
            speed: 6.0,
            seed: None,
        }
    }
}

impl BotConfig {
    pub(crate) fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            count: parse_env_or(BOT_COUNT_ENV_VAR, defaults.count),
            run_secs: parse_env_or(BOT_RUN_SECS_ENV_VAR, defaults.run_secs),
            speed: parse_env_or(BOT_SPEED_ENV_VAR, defaults.speed),
            seed: std::env::var(BOT_SEED_ENV_VAR)
                .ok()
                .and_then(|raw| raw.parse().ok()),
        }
    }
}

fn parse_env_or<T>(var: &'static str, fallback: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match std::env::var(var).ok() {
        Some(value) => match value.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(var, value = %value, fallback = %fallback, "bot_env_invalid_using_default");
                fallback
            }
        },
        None => fallback,
    }
}

#[derive(Debug, Clone, Copy)]
struct Bot {
    player_id: PlayerId,
    heading: f32,
    reliable_seq: u32,
}

/// Drives wandering bots in the AI world. It reads bot avatars on the dispatcher thread and
/// feeds moves and projectile launches back through the inbound queue like any client would.
/// After the configured run time it requests a drain.
pub(crate) struct BotDirector {
    config: BotConfig,
    scene_id: SceneId,
    bounds: GridBounds,
    shape: GridShape,
    bots: Vec<Bot>,
    rng: StdRng,
    handles: QueueHandles,
    drain_requested: bool,
}

impl BotDirector {
    pub(crate) fn new(config: BotConfig, server: &ServerConfig, handles: QueueHandles) -> Self {
        let scene_id = server.ai_world.scene_id;
        let (bounds, shape) = server
            .scene(scene_id)
            .map(|scene| (scene.bounds, scene.shape))
            .unwrap_or((
                GridBounds {
                    min: Vec3::new(-SPAWN_SPREAD, 0.0, -SPAWN_SPREAD),
                    max: Vec3::new(SPAWN_SPREAD, 0.0, SPAWN_SPREAD),
                },
                GridShape::Planar,
            ));
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let bots = (0..config.count)
            .map(|index| Bot {
                player_id: PlayerId(FIRST_BOT_ID + index),
                heading: 0.0,
                reliable_seq: 0,
            })
            .collect();
        Self {
            config,
            scene_id: SceneId(scene_id),
            bounds,
            shape,
            bots,
            rng,
            handles,
            drain_requested: false,
        }
    }

    /// Queues a join for every bot at a random point near the scene centre.
    pub(crate) fn join_all(&mut self) -> Result<(), QueueClosed> {
        let centre = (self.bounds.min + self.bounds.max) * 0.5;
        for bot in &mut self.bots {
            bot.heading = self.rng.gen_range(0.0..TAU);
            let offset = Vec3::new(
                self.rng.gen_range(-SPAWN_SPREAD..SPAWN_SPREAD),
                0.0,
                self.rng.gen_range(-SPAWN_SPREAD..SPAWN_SPREAD),
            );
            let mut position = centre + offset;
            if !self.bounds.contains(position, self.shape) {
                position = centre;
            }
            self.handles.send_local(LocalEvent::PlayerJoined {
                snapshot: PlayerSnapshot {
                    player_id: bot.player_id,
                    scene_id: self.scene_id,
                    position,
                    rotation: Vec3::ZERO,
                },
                choice: WorldChoice::AiWorld,
            })?;
        }
        info!(
            bots = self.bots.len(),
            scene_id = self.scene_id.0,
            run_secs = self.config.run_secs,
            "bots_joining"
        );
        Ok(())
    }

    fn step_bots(&mut self, ctx: &mut HandlerContext<'_>) {
        let step = self.config.speed * (BOT_STEP_PERIOD_MS as f32 / 1_000.0);
        let positions: Vec<(PlayerId, Vec3)> = self
            .bots
            .iter()
            .filter_map(|bot| ctx.worlds.player(bot.player_id))
            .map(|player| (player.id(), player.position()))
            .collect();

        for bot in &mut self.bots {
            let Some(player) = ctx.worlds.player(bot.player_id) else {
                continue;
            };
            let Some(avatar) = player.avatar() else {
                continue;
            };
            let position = player.position();

            bot.heading = (bot.heading + self.rng.gen_range(-0.5..0.5)).rem_euclid(TAU);
            let mut next = position + Vec3::new(bot.heading.cos(), 0.0, bot.heading.sin()) * step;
            if !self.bounds.contains(next, self.shape) {
                bot.heading = (bot.heading + PI).rem_euclid(TAU);
                next = position;
            }
            bot.reliable_seq = bot.reliable_seq.wrapping_add(1);
            let report = EntityMove {
                entity_id: avatar,
                position: next,
                rotation: Vec3::new(0.0, bot.heading.to_degrees(), 0.0),
                motion_state: MotionState::Run,
                scene_time: scene_time(ctx.now_ms),
                reliable_seq: bot.reliable_seq,
            };
            send(&self.handles, bot.player_id, InboundCommand::EntityMove(report));

            if self.rng.gen_bool(FIRE_CHANCE) {
                let others: Vec<Vec3> = positions
                    .iter()
                    .filter(|(other, _)| *other != bot.player_id)
                    .map(|(_, at)| *at)
                    .collect();
                let target = (!others.is_empty())
                    .then(|| others[self.rng.gen_range(0..others.len())]);
                if let Some(target) = target {
                    let launch = aim(position, target);
                    send(
                        &self.handles,
                        bot.player_id,
                        InboundCommand::ProjectileFire(launch),
                    );
                }
            }
        }
    }
}

fn send(handles: &QueueHandles, player_id: PlayerId, command: InboundCommand) {
    let name = command.name();
    if let Err(err) = handles.send_inbound(InboundMessage { player_id, command }) {
        warn!(player_id = player_id.0, command = name, error = %err, "bot_send_failed");
    }
}

/// Scene clock in the move report's width; saturates once logical time outgrows it.
fn scene_time(now_ms: u64) -> u32 {
    u32::try_from(now_ms).unwrap_or(u32::MAX)
}

/// A flat shot from muzzle height toward the target's chest.
fn aim(from: Vec3, to: Vec3) -> ProjectileLaunch {
    let muzzle = from + Vec3::new(0.0, MUZZLE_HEIGHT, 0.0);
    let chest = to + Vec3::new(0.0, MUZZLE_HEIGHT, 0.0);
    let delta = chest - muzzle;
    let length = muzzle.distance(chest).max(f32::EPSILON);
    ProjectileLaunch {
        client_entity_id: None,
        gadget_id: PROJECTILE_GADGET_ID,
        position: muzzle,
        velocity: delta * (PROJECTILE_SPEED / length),
        drag: 0.1,
        mass: 1.0,
    }
}

impl ExternalHandler for BotDirector {
    fn on_period(&mut self, ctx: &mut HandlerContext<'_>, period_ms: u64) {
        if period_ms != BOT_STEP_PERIOD_MS || self.drain_requested {
            return;
        }
        if ctx.now_ms >= self.config.run_secs.saturating_mul(1_000) {
            self.drain_requested = true;
            info!(now_ms = ctx.now_ms, "bot_run_finished");
            if let Err(err) = self.handles.send_local(LocalEvent::Drain) {
                warn!(error = %err, "drain_request_dropped");
            }
            return;
        }
        self.step_bots(ctx);
    }

    fn on_player_tick(&mut self, ctx: &mut HandlerContext<'_>, player_id: PlayerId) {
        if let Some(player) = ctx.worlds.player(player_id) {
            trace!(
                player_id = player_id.0,
                visible = player.ledger().len(),
                "bot_tick"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aim_points_the_shot_at_the_target() {
        let launch = aim(Vec3::ZERO, Vec3::new(30.0, 0.0, 0.0));
        assert_eq!(launch.position, Vec3::new(0.0, MUZZLE_HEIGHT, 0.0));
        assert!((launch.velocity.x - PROJECTILE_SPEED).abs() < 1e-3);
        assert!(launch.velocity.y.abs() < 1e-6);
        assert!(launch.velocity.z.abs() < 1e-6);
    }

    #[test]
    fn scene_time_saturates_instead_of_wrapping() {
        assert_eq!(scene_time(1_500), 1_500);
        assert_eq!(scene_time(u64::from(u32::MAX) + 1), u32::MAX);
        assert_eq!(scene_time(u64::MAX), u32::MAX);
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = BotConfig::default();
        assert_eq!(config.count, 4);
        assert_eq!(parse_env_or("WORLDCORE_TEST_UNSET_VAR", 7u32), 7);
    }
}
