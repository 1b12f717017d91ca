use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::aoi::{
    default_entries, GridBounds, GridShape, SpatialIndex, VisionLevel, VisionLevelConfig,
    VisionTable, VisionTableError,
};
use crate::math::Vec3;

pub const CONFIG_ENV_VAR: &str = "WORLDCORE_CONFIG";
pub const DEFAULT_AI_SCENE_ID: u32 = 3;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub tick: TickConfig,
    pub vision_levels: Vec<VisionLevelConfig>,
    pub visibility: VisibilityConfig,
    pub scenes: Vec<SceneConfig>,
    pub ai_world: AiWorldConfig,
    pub physics: PhysicsConfig,
    pub supervisor: SupervisorConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick: TickConfig::default(),
            vision_levels: default_entries().to_vec(),
            visibility: VisibilityConfig::default(),
            scenes: vec![SceneConfig {
                id: DEFAULT_AI_SCENE_ID,
                bounds: GridBounds {
                    min: Vec3::new(-4096.0, -1024.0, -4096.0),
                    max: Vec3::new(4096.0, 1024.0, 4096.0),
                },
                shape: GridShape::Planar,
                groups: Vec::new(),
            }],
            ai_world: AiWorldConfig::default(),
            physics: PhysicsConfig::default(),
            supervisor: SupervisorConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TickConfig {
    pub base_ms: u64,
    pub player_tick_ms: u64,
    pub metrics_period_ms: u64,
    /// Base ticks run back to back after a stall before the rest of the backlog is dropped.
    pub max_catch_up_ticks: u32,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            base_ms: 10,
            player_tick_ms: 1_000,
            metrics_period_ms: 5_000,
            max_catch_up_ticks: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VisibilityConfig {
    pub group_load_distance: f32,
    pub group_check_interval_ms: u64,
    pub max_batch: usize,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            group_load_distance: 250.0,
            group_check_interval_ms: 200,
            max_batch: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SceneConfig {
    pub id: u32,
    pub bounds: GridBounds,
    #[serde(default)]
    pub shape: GridShape,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub id: u32,
    pub anchor: Vec3,
    /// Falls back to `visibility.group_load_distance` when absent.
    #[serde(default)]
    pub trigger_radius: Option<f32>,
    #[serde(default)]
    pub members: Vec<GroupMemberConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMemberKind {
    Monster,
    Npc,
    Gadget,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupMemberConfig {
    pub kind: GroupMemberKind,
    pub config_id: u32,
    pub position: Vec3,
    #[serde(default)]
    pub vision_level: VisionLevel,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AiWorldConfig {
    pub scene_id: u32,
    pub vision_level: VisionLevel,
}

impl Default for AiWorldConfig {
    fn default() -> Self {
        Self {
            scene_id: DEFAULT_AI_SCENE_ID,
            vision_level: VisionLevel::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhysicsConfig {
    pub gravity: f32,
    pub projectile_damage: f32,
    pub avatar_radius: f32,
    pub avatar_height: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: -9.8,
            projectile_damage: 10.0,
            avatar_radius: 0.4,
            avatar_height: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub window_ms: u64,
    pub grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            window_ms: 1_000,
            grace_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    pub flush_timeout_ms: u64,
    pub disconnect_stagger_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            flush_timeout_ms: 5_000,
            disconnect_stagger_ms: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read environment variable {var}: {source}")]
    EnvVar {
        var: &'static str,
        #[source]
        source: env::VarError,
    },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config value at '{json_path}': {source}")]
    Parse {
        json_path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    VisionTable(#[from] VisionTableError),
    #[error("tick.{field} must be a positive multiple of tick.base_ms ({base_ms}), got {value}")]
    TickPeriod {
        field: &'static str,
        base_ms: u64,
        value: u64,
    },
    #[error("tick.max_catch_up_ticks must be positive")]
    ZeroCatchUp,
    #[error("visibility.max_batch must be positive")]
    ZeroBatch,
    #[error("visibility.group_load_distance must be positive and finite, got {0}")]
    GroupLoadDistance(f32),
    #[error("scene {0} is configured more than once")]
    DuplicateScene(u32),
    #[error("scene {scene_id} has empty or inverted bounds")]
    SceneBounds { scene_id: u32 },
    #[error("group {group_id} is configured more than once in scene {scene_id}")]
    DuplicateGroup { scene_id: u32, group_id: u32 },
    #[error("group {group_id} in scene {scene_id} has an anchor or member outside the scene bounds")]
    GroupOutOfBounds { scene_id: u32, group_id: u32 },
    #[error("ai_world.scene_id {0} is not a configured scene")]
    MissingAiScene(u32),
    #[error("supervisor.max_restarts and supervisor.window_ms must be positive")]
    Supervisor,
}

impl ServerConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let deserializer = &mut serde_json::Deserializer::from_str(raw);
        let config: ServerConfig =
            serde_path_to_error::deserialize(deserializer).map_err(|error| {
                ConfigError::Parse {
                    json_path: error.path().to_string(),
                    source: error.into_inner(),
                }
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn vision_table(&self) -> Result<VisionTable, ConfigError> {
        Ok(VisionTable::from_entries(&self.vision_levels)?)
    }

    pub fn scene(&self, scene_id: u32) -> Option<&SceneConfig> {
        self.scenes.iter().find(|scene| scene.id == scene_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vision_table()?;

        let base_ms = self.tick.base_ms;
        for (field, value) in [
            ("base_ms", base_ms),
            ("player_tick_ms", self.tick.player_tick_ms),
            ("metrics_period_ms", self.tick.metrics_period_ms),
        ] {
            if base_ms == 0 || value == 0 || value % base_ms != 0 {
                return Err(ConfigError::TickPeriod {
                    field,
                    base_ms,
                    value,
                });
            }
        }

        if self.tick.max_catch_up_ticks == 0 {
            return Err(ConfigError::ZeroCatchUp);
        }
        if self.visibility.max_batch == 0 {
            return Err(ConfigError::ZeroBatch);
        }
        let distance = self.visibility.group_load_distance;
        if !distance.is_finite() || distance <= 0.0 {
            return Err(ConfigError::GroupLoadDistance(distance));
        }
        if self.supervisor.max_restarts == 0 || self.supervisor.window_ms == 0 {
            return Err(ConfigError::Supervisor);
        }

        let mut scene_ids = HashSet::new();
        for scene in &self.scenes {
            if !scene_ids.insert(scene.id) {
                return Err(ConfigError::DuplicateScene(scene.id));
            }
            if SpatialIndex::<()>::new(distance, scene.bounds, scene.shape).is_err() {
                return Err(ConfigError::SceneBounds { scene_id: scene.id });
            }
            let mut group_ids = HashSet::new();
            for group in &scene.groups {
                if !group_ids.insert(group.id) {
                    return Err(ConfigError::DuplicateGroup {
                        scene_id: scene.id,
                        group_id: group.id,
                    });
                }
                let inside = scene.bounds.contains(group.anchor, scene.shape)
                    && group
                        .members
                        .iter()
                        .all(|member| scene.bounds.contains(member.position, scene.shape));
                if !inside {
                    return Err(ConfigError::GroupOutOfBounds {
                        scene_id: scene.id,
                        group_id: group.id,
                    });
                }
            }
        }
        if !scene_ids.contains(&self.ai_world.scene_id) {
            return Err(ConfigError::MissingAiScene(self.ai_world.scene_id));
        }
        Ok(())
    }
}

/// Loads the file named by `WORLDCORE_CONFIG`, or the built-in defaults when it is unset.
pub fn resolve_server_config() -> Result<ServerConfig, ConfigError> {
    match env::var(CONFIG_ENV_VAR) {
        Ok(value) => ServerConfig::load(Path::new(&value)),
        Err(env::VarError::NotPresent) => {
            let config = ServerConfig::default();
            config.validate()?;
            Ok(config)
        }
        Err(source) => Err(ConfigError::EnvVar {
            var: CONFIG_ENV_VAR,
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"{
        "tick": { "base_ms": 20, "player_tick_ms": 1000, "metrics_period_ms": 5000 },
        "visibility": { "group_load_distance": 100.0 },
        "scenes": [
            {
                "id": 3,
                "bounds": { "min": { "x": -500, "y": -50, "z": -500 }, "max": { "x": 500, "y": 50, "z": 500 } },
                "groups": [
                    {
                        "id": 133001,
                        "anchor": { "x": 10, "y": 0, "z": 10 },
                        "trigger_radius": 60.0,
                        "members": [
                            { "kind": "monster", "config_id": 21010101, "position": { "x": 12, "y": 0, "z": 9 } }
                        ]
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.tick.base_ms, 10);
        assert_eq!(config.visibility.max_batch, 1_000);
        assert!(config.scene(DEFAULT_AI_SCENE_ID).is_some());
    }

    #[test]
    fn sample_config_parses_with_defaults_for_missing_sections() {
        let config = ServerConfig::from_json_str(SAMPLE).expect("config");
        assert_eq!(config.tick.base_ms, 20);
        assert_eq!(config.visibility.group_load_distance, 100.0);
        assert_eq!(config.visibility.group_check_interval_ms, 200);
        let scene = config.scene(3).expect("scene");
        assert_eq!(scene.shape, GridShape::Planar);
        assert_eq!(scene.groups[0].trigger_radius, Some(60.0));
        assert_eq!(scene.groups[0].members[0].vision_level, VisionLevel::Normal);
        assert_eq!(config.physics.avatar_radius, 0.4);
    }

    #[test]
    fn parse_errors_report_the_json_path() {
        let raw = r#"{ "tick": { "base_ms": "fast" } }"#;
        let error = ServerConfig::from_json_str(raw).expect_err("should fail");
        match error {
            ConfigError::Parse { json_path, .. } => assert_eq!(json_path, "tick.base_ms"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn tick_periods_must_be_multiples_of_base() {
        let raw = r#"{ "tick": { "base_ms": 20, "player_tick_ms": 1010 } }"#;
        assert!(matches!(
            ServerConfig::from_json_str(raw),
            Err(ConfigError::TickPeriod {
                field: "player_tick_ms",
                ..
            })
        ));
    }

    #[test]
    fn group_outside_scene_bounds_is_rejected() {
        let raw = SAMPLE.replace(r#""x": 12, "y": 0, "z": 9"#, r#""x": 9000, "y": 0, "z": 9"#);
        assert!(matches!(
            ServerConfig::from_json_str(&raw),
            Err(ConfigError::GroupOutOfBounds {
                scene_id: 3,
                group_id: 133001
            })
        ));
    }

    #[test]
    fn missing_ai_scene_is_rejected() {
        let raw = r#"{ "ai_world": { "scene_id": 99 } }"#;
        assert!(matches!(
            ServerConfig::from_json_str(raw),
            Err(ConfigError::MissingAiScene(99))
        ));
    }

    #[test]
    fn load_reads_config_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(SAMPLE.as_bytes()).expect("write");
        let config = ServerConfig::load(file.path()).expect("load");
        assert_eq!(config.scenes.len(), 1);

        let missing = ServerConfig::load(Path::new("/definitely/not/here.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
