use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum VisionLevel {
    #[default]
    Normal,
    LittleRemote,
    Remote,
    Super,
    Nearby,
    SuperNearby,
}

impl VisionLevel {
    pub const ALL: [VisionLevel; 6] = [
        VisionLevel::Normal,
        VisionLevel::LittleRemote,
        VisionLevel::Remote,
        VisionLevel::Super,
        VisionLevel::Nearby,
        VisionLevel::SuperNearby,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::LittleRemote => "little_remote",
            Self::Remote => "remote",
            Self::Super => "super",
            Self::Nearby => "nearby",
            Self::SuperNearby => "super_nearby",
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::Normal => 0,
            Self::LittleRemote => 1,
            Self::Remote => 2,
            Self::Super => 3,
            Self::Nearby => 4,
            Self::SuperNearby => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisionLevelConfig {
    pub level: VisionLevel,
    pub range: f32,
    pub grid_width: f32,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VisionTableError {
    #[error("vision level {0} is configured more than once")]
    Duplicate(&'static str),
    #[error("vision level {0} is missing from the table")]
    Missing(&'static str),
    #[error("vision level {level} has range {range} and grid width {grid_width}; both must be positive and range >= grid width")]
    InvalidEntry {
        level: &'static str,
        range: f32,
        grid_width: f32,
    },
}

/// Process-wide, read-only (range, grid width) table; one entry per level.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionTable {
    entries: [VisionLevelConfig; 6],
}

impl VisionTable {
    pub fn from_entries(entries: &[VisionLevelConfig]) -> Result<Self, VisionTableError> {
        let mut slots: [Option<VisionLevelConfig>; 6] = [None; 6];
        for entry in entries {
            let valid = entry.grid_width.is_finite()
                && entry.range.is_finite()
                && entry.grid_width > 0.0
                && entry.range >= entry.grid_width;
            if !valid {
                return Err(VisionTableError::InvalidEntry {
                    level: entry.level.name(),
                    range: entry.range,
                    grid_width: entry.grid_width,
                });
            }
            let slot = &mut slots[entry.level.slot()];
            if slot.is_some() {
                return Err(VisionTableError::Duplicate(entry.level.name()));
            }
            *slot = Some(*entry);
        }

        let mut resolved = default_entries();
        for level in VisionLevel::ALL {
            resolved[level.slot()] =
                slots[level.slot()].ok_or(VisionTableError::Missing(level.name()))?;
        }
        Ok(Self { entries: resolved })
    }

    pub fn get(&self, level: VisionLevel) -> VisionLevelConfig {
        self.entries[level.slot()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &VisionLevelConfig> {
        self.entries.iter()
    }

    pub fn entries(&self) -> Vec<VisionLevelConfig> {
        self.entries.to_vec()
    }
}

impl Default for VisionTable {
    fn default() -> Self {
        Self {
            entries: default_entries(),
        }
    }
}

pub fn default_entries() -> [VisionLevelConfig; 6] {
    let entry = |level, range, grid_width| VisionLevelConfig {
        level,
        range,
        grid_width,
    };
    [
        entry(VisionLevel::Normal, 80.0, 20.0),
        entry(VisionLevel::LittleRemote, 160.0, 40.0),
        entry(VisionLevel::Remote, 1000.0, 250.0),
        entry(VisionLevel::Super, 4000.0, 1000.0),
        entry(VisionLevel::Nearby, 40.0, 20.0),
        entry(VisionLevel::SuperNearby, 20.0, 20.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_round_trips_through_from_entries() {
        let table = VisionTable::default();
        let rebuilt = VisionTable::from_entries(&table.entries()).expect("table");
        assert_eq!(rebuilt, table);
        assert_eq!(table.get(VisionLevel::Remote).grid_width, 250.0);
        assert_eq!(table.get(VisionLevel::SuperNearby).range, 20.0);
    }

    #[test]
    fn missing_and_duplicate_levels_are_rejected() {
        let mut entries = default_entries().to_vec();
        entries.pop();
        assert_eq!(
            VisionTable::from_entries(&entries),
            Err(VisionTableError::Missing("super_nearby"))
        );

        let mut entries = default_entries().to_vec();
        entries.push(entries[0]);
        assert_eq!(
            VisionTable::from_entries(&entries),
            Err(VisionTableError::Duplicate("normal"))
        );
    }

    #[test]
    fn range_smaller_than_grid_width_is_rejected() {
        let mut entries = default_entries().to_vec();
        entries[1].range = 10.0;
        assert!(matches!(
            VisionTable::from_entries(&entries),
            Err(VisionTableError::InvalidEntry {
                level: "little_remote",
                ..
            })
        ));
    }
}
