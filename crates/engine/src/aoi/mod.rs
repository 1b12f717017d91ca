mod grid;
mod vision;

pub use grid::{AoiError, GridBounds, GridId, GridShape, InsertOutcome, SpatialIndex};
pub use vision::{
    default_entries, VisionLevel, VisionLevelConfig, VisionTable, VisionTableError,
};
