pub mod aoi;
pub mod config;
pub mod dispatch;
pub mod math;
pub mod physics;
pub mod tick;
pub mod visibility;
pub mod world;

pub use aoi::{AoiError, GridBounds, GridId, GridShape, SpatialIndex, VisionLevel, VisionTable};
pub use config::{resolve_server_config, ConfigError, ServerConfig, CONFIG_ENV_VAR};
pub use dispatch::{
    dispatch_queues, DispatchFault, Dispatcher, ExternalHandler, LocalEvent, Outbound,
    QueueHandles,
};
pub use math::Vec3;
pub use physics::PhysicsEngine;
pub use tick::{LoopExit, Supervisor, SupervisorError, TickCadence};
pub use visibility::{Notification, NotificationSink, RecordingSink};
pub use world::{EntityId, PlayerId, SceneId, WorldError, WorldId, WorldManager};
