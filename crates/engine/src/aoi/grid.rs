use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use thiserror::Error;

use crate::math::Vec3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridId(pub i64);

/// Planar indexes bucket on x/z only (y is height); volume indexes use all three axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridShape {
    #[default]
    Planar,
    Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GridBounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl GridBounds {
    pub fn contains(&self, position: Vec3, shape: GridShape) -> bool {
        let planar = position.x >= self.min.x
            && position.x <= self.max.x
            && position.z >= self.min.z
            && position.z <= self.max.z;
        match shape {
            GridShape::Planar => planar,
            GridShape::Volume => planar && position.y >= self.min.y && position.y <= self.max.y,
        }
    }

    /// Checks all three axes whatever the index shape.
    pub fn contains_volume(&self, position: Vec3) -> bool {
        self.contains(position, GridShape::Volume)
    }

    fn is_well_formed(&self, shape: GridShape) -> bool {
        if !self.min.is_finite() || !self.max.is_finite() {
            return false;
        }
        let planar = self.min.x < self.max.x && self.min.z < self.max.z;
        match shape {
            GridShape::Planar => planar,
            GridShape::Volume => planar && self.min.y < self.max.y,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AoiError {
    #[error("grid width must be positive and finite, got {width}")]
    InvalidGridWidth { width: f32 },
    #[error("index bounds are empty or inverted: min {min:?} max {max:?}")]
    InvalidBounds { min: Vec3, max: Vec3 },
    #[error("position ({x}, {y}, {z}) is outside the index bounds")]
    OutOfBounds { x: f32, y: f32, z: f32 },
    #[error("grid id {0} is not part of this index")]
    UnknownGrid(i64),
    #[error("object {object_id} is not present in grid {grid_id}")]
    NotFound { object_id: i64, grid_id: i64 },
}

impl AoiError {
    fn out_of_bounds(position: Vec3) -> Self {
        Self::OutOfBounds {
            x: position.x,
            y: position.y,
            z: position.z,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(GridId),
    /// The object already lives in this cell; nothing was changed.
    AlreadyPresent(GridId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellCoord {
    x: i64,
    y: i64,
    z: i64,
}

/// Uniform grid over a bounded plane or volume mapping object ids to caller payloads.
#[derive(Debug, Clone)]
pub struct SpatialIndex<P> {
    width: f32,
    shape: GridShape,
    bounds: GridBounds,
    min_cell: CellCoord,
    extent: CellCoord,
    cells: HashMap<GridId, HashMap<i64, P>>,
    locations: HashMap<i64, GridId>,
}

impl<P: Clone> SpatialIndex<P> {
    pub fn new(width: f32, bounds: GridBounds, shape: GridShape) -> Result<Self, AoiError> {
        if !width.is_finite() || width <= 0.0 {
            return Err(AoiError::InvalidGridWidth { width });
        }
        if !bounds.is_well_formed(shape) {
            return Err(AoiError::InvalidBounds {
                min: bounds.min,
                max: bounds.max,
            });
        }

        let min_cell = quantize(bounds.min, width, shape);
        let max_cell = quantize(bounds.max, width, shape);
        // Packed grid ids must fit in an i64, which caps the cell count.
        let too_fine = AoiError::InvalidGridWidth { width };
        let extent = CellCoord {
            x: span(min_cell.x, max_cell.x).ok_or_else(|| too_fine.clone())?,
            y: span(min_cell.y, max_cell.y).ok_or_else(|| too_fine.clone())?,
            z: span(min_cell.z, max_cell.z).ok_or_else(|| too_fine.clone())?,
        };
        extent
            .x
            .checked_mul(extent.y)
            .and_then(|layer| layer.checked_mul(extent.z))
            .ok_or(too_fine)?;

        Ok(Self {
            width,
            shape,
            bounds,
            min_cell,
            extent,
            cells: HashMap::new(),
            locations: HashMap::new(),
        })
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn bounds(&self) -> GridBounds {
        self.bounds
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn grid_count(&self) -> i64 {
        self.extent.x * self.extent.y * self.extent.z
    }

    pub fn contains_position(&self, position: Vec3) -> bool {
        self.grid_id_for_position(position).is_ok()
    }

    pub fn grid_id_for_position(&self, position: Vec3) -> Result<GridId, AoiError> {
        if !position.is_finite() || !self.bounds.contains(position, self.shape) {
            return Err(AoiError::out_of_bounds(position));
        }
        let cell = quantize(position, self.width, self.shape);
        Ok(self.encode(CellCoord {
            x: cell.x - self.min_cell.x,
            y: cell.y - self.min_cell.y,
            z: cell.z - self.min_cell.z,
        }))
    }

    /// The 3x3 (planar) or 3x3x3 (volume) block around `grid`, clipped to the index extent.
    pub fn neighbor_grids(&self, grid: GridId) -> Result<Vec<GridId>, AoiError> {
        let center = self.decode(grid).ok_or(AoiError::UnknownGrid(grid.0))?;
        let dy_range = match self.shape {
            GridShape::Planar => 0..=0,
            GridShape::Volume => -1..=1,
        };

        let mut neighbors = Vec::with_capacity(27);
        for dy in dy_range {
            for dz in -1..=1 {
                for dx in -1..=1 {
                    let coord = CellCoord {
                        x: center.x + dx,
                        y: center.y + dy,
                        z: center.z + dz,
                    };
                    if self.in_extent(coord) {
                        neighbors.push(self.encode(coord));
                    }
                }
            }
        }
        Ok(neighbors)
    }

    pub fn is_neighbor(&self, center: GridId, other: GridId) -> bool {
        match (self.decode(center), self.decode(other)) {
            (Some(a), Some(b)) => {
                (a.x - b.x).abs() <= 1 && (a.y - b.y).abs() <= 1 && (a.z - b.z).abs() <= 1
            }
            _ => false,
        }
    }

    /// Inserts `object_id` into the cell for `position`. An object already tracked anywhere in
    /// the index is left untouched; callers remove before re-inserting.
    pub fn insert(
        &mut self,
        object_id: i64,
        payload: P,
        position: Vec3,
    ) -> Result<InsertOutcome, AoiError> {
        let grid = self.grid_id_for_position(position)?;
        if let Some(existing) = self.locations.get(&object_id) {
            return Ok(InsertOutcome::AlreadyPresent(*existing));
        }
        self.cells
            .entry(grid)
            .or_default()
            .insert(object_id, payload);
        self.locations.insert(object_id, grid);
        Ok(InsertOutcome::Inserted(grid))
    }

    /// Removes `object_id` from the cell computed for `position`. A stale position is an error.
    pub fn remove(&mut self, object_id: i64, position: Vec3) -> Result<P, AoiError> {
        let grid = self.grid_id_for_position(position)?;
        let not_found = AoiError::NotFound {
            object_id,
            grid_id: grid.0,
        };
        let cell = self.cells.get_mut(&grid).ok_or_else(|| not_found.clone())?;
        let payload = cell.remove(&object_id).ok_or(not_found)?;
        if cell.is_empty() {
            self.cells.remove(&grid);
        }
        self.locations.remove(&object_id);
        Ok(payload)
    }

    pub fn cell_of(&self, object_id: i64) -> Option<GridId> {
        self.locations.get(&object_id).copied()
    }

    pub fn objects_in_grid(&self, grid: GridId) -> Option<&HashMap<i64, P>> {
        self.cells.get(&grid)
    }

    pub fn objects_near_position(&self, position: Vec3) -> Result<BTreeMap<i64, P>, AoiError> {
        let grid = self.grid_id_for_position(position)?;
        let mut found = BTreeMap::new();
        for neighbor in self.neighbor_grids(grid)? {
            if let Some(cell) = self.cells.get(&neighbor) {
                found.extend(cell.iter().map(|(id, payload)| (*id, payload.clone())));
            }
        }
        Ok(found)
    }

    /// Every object in a cell overlapped by the axis-aligned box `[min, max]`.
    pub fn objects_in_box(&self, min: Vec3, max: Vec3) -> BTreeMap<i64, P> {
        let mut found = BTreeMap::new();
        if !min.is_finite() || !max.is_finite() {
            return found;
        }
        let low = quantize(min.component_min(max), self.width, self.shape);
        let high = quantize(min.component_max(max), self.width, self.shape);
        let clamp = |value: i64, origin: i64, extent: i64| (value - origin).clamp(0, extent - 1);

        let (x0, x1) = (
            clamp(low.x, self.min_cell.x, self.extent.x),
            clamp(high.x, self.min_cell.x, self.extent.x),
        );
        let (y0, y1) = (
            clamp(low.y, self.min_cell.y, self.extent.y),
            clamp(high.y, self.min_cell.y, self.extent.y),
        );
        let (z0, z1) = (
            clamp(low.z, self.min_cell.z, self.extent.z),
            clamp(high.z, self.min_cell.z, self.extent.z),
        );
        if high.x < self.min_cell.x
            || low.x >= self.min_cell.x + self.extent.x
            || high.z < self.min_cell.z
            || low.z >= self.min_cell.z + self.extent.z
            || high.y < self.min_cell.y
            || low.y >= self.min_cell.y + self.extent.y
        {
            return found;
        }

        for y in y0..=y1 {
            for z in z0..=z1 {
                for x in x0..=x1 {
                    let grid = self.encode(CellCoord { x, y, z });
                    if let Some(cell) = self.cells.get(&grid) {
                        found.extend(cell.iter().map(|(id, payload)| (*id, payload.clone())));
                    }
                }
            }
        }
        found
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.locations.clear();
    }

    fn in_extent(&self, coord: CellCoord) -> bool {
        coord.x >= 0
            && coord.x < self.extent.x
            && coord.y >= 0
            && coord.y < self.extent.y
            && coord.z >= 0
            && coord.z < self.extent.z
    }

    fn encode(&self, offset: CellCoord) -> GridId {
        GridId(offset.x + offset.y * self.extent.x + offset.z * self.extent.x * self.extent.y)
    }

    fn decode(&self, grid: GridId) -> Option<CellCoord> {
        if grid.0 < 0 || grid.0 >= self.grid_count() {
            return None;
        }
        let layer = self.extent.x * self.extent.y;
        Some(CellCoord {
            x: grid.0 % self.extent.x,
            y: (grid.0 % layer) / self.extent.x,
            z: grid.0 / layer,
        })
    }
}

/// Cells from `min` to `max` inclusive, if the far edge stays representable.
fn span(min: i64, max: i64) -> Option<i64> {
    max.checked_add(1)?.checked_sub(min)
}

fn quantize(position: Vec3, width: f32, shape: GridShape) -> CellCoord {
    let cell = |coord: f32| (coord / width).floor() as i64;
    CellCoord {
        x: cell(position.x),
        y: match shape {
            GridShape::Planar => 0,
            GridShape::Volume => cell(position.y),
        },
        z: cell(position.z),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn planar_index(width: f32) -> SpatialIndex<u32> {
        SpatialIndex::new(
            width,
            GridBounds {
                min: Vec3::new(-100.0, -10.0, -100.0),
                max: Vec3::new(100.0, 10.0, 100.0),
            },
            GridShape::Planar,
        )
        .expect("index")
    }

    fn volume_index() -> SpatialIndex<u32> {
        SpatialIndex::new(
            10.0,
            GridBounds {
                min: Vec3::new(0.0, 0.0, 0.0),
                max: Vec3::new(49.0, 49.0, 49.0),
            },
            GridShape::Volume,
        )
        .expect("index")
    }

    #[test]
    fn new_rejects_bad_width_and_bounds() {
        let bounds = GridBounds {
            min: Vec3::ZERO,
            max: Vec3::new(10.0, 10.0, 10.0),
        };
        assert!(matches!(
            SpatialIndex::<u32>::new(0.0, bounds, GridShape::Planar),
            Err(AoiError::InvalidGridWidth { .. })
        ));
        assert!(matches!(
            SpatialIndex::<u32>::new(f32::NAN, bounds, GridShape::Planar),
            Err(AoiError::InvalidGridWidth { .. })
        ));
        let huge = GridBounds {
            min: Vec3::new(-1.0e9, -1.0e9, -1.0e9),
            max: Vec3::new(1.0e9, 1.0e9, 1.0e9),
        };
        assert!(matches!(
            SpatialIndex::<u32>::new(1.0e-3, huge, GridShape::Volume),
            Err(AoiError::InvalidGridWidth { .. })
        ));
        assert!(matches!(
            SpatialIndex::<u32>::new(f32::MIN_POSITIVE, huge, GridShape::Planar),
            Err(AoiError::InvalidGridWidth { .. })
        ));
        let inverted = GridBounds {
            min: Vec3::new(10.0, 0.0, 0.0),
            max: Vec3::new(0.0, 10.0, 10.0),
        };
        assert!(matches!(
            SpatialIndex::<u32>::new(5.0, inverted, GridShape::Planar),
            Err(AoiError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn grid_id_is_deterministic_for_positions_in_bounds() {
        let index = planar_index(20.0);
        for (x, z) in [(-100.0, -100.0), (-0.5, 0.5), (19.99, 20.0), (100.0, 100.0)] {
            let position = Vec3::new(x, 3.0, z);
            let first = index.grid_id_for_position(position).expect("grid");
            let second = index.grid_id_for_position(position).expect("grid");
            assert_eq!(first, second);
            assert!(first.0 >= 0 && first.0 < index.grid_count());
        }
    }

    #[test]
    fn planar_index_ignores_height_but_volume_does_not() {
        let planar = planar_index(20.0);
        let a = planar
            .grid_id_for_position(Vec3::new(5.0, -9.0, 5.0))
            .expect("grid");
        let b = planar
            .grid_id_for_position(Vec3::new(5.0, 9.0, 5.0))
            .expect("grid");
        assert_eq!(a, b);
        assert!(planar.contains_position(Vec3::new(5.0, 500.0, 5.0)));

        let volume = volume_index();
        let low = volume
            .grid_id_for_position(Vec3::new(5.0, 1.0, 5.0))
            .expect("grid");
        let high = volume
            .grid_id_for_position(Vec3::new(5.0, 25.0, 5.0))
            .expect("grid");
        assert_ne!(low, high);
        assert!(!volume.contains_position(Vec3::new(5.0, 500.0, 5.0)));
    }

    #[test]
    fn positions_outside_bounds_fail_explicitly() {
        let mut index = planar_index(20.0);
        let outside = Vec3::new(100.5, 0.0, 0.0);
        assert!(matches!(
            index.grid_id_for_position(outside),
            Err(AoiError::OutOfBounds { .. })
        ));
        assert!(index.insert(1, 1, outside).is_err());
        assert!(index.objects_near_position(outside).is_err());
        assert!(index
            .grid_id_for_position(Vec3::new(f32::NAN, 0.0, 0.0))
            .is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn neighbor_relation_is_symmetric() {
        for index in [planar_index(40.0), volume_index()] {
            for raw in 0..index.grid_count() {
                let grid = GridId(raw);
                for neighbor in index.neighbor_grids(grid).expect("neighbors") {
                    let back = index.neighbor_grids(neighbor).expect("neighbors");
                    assert!(back.contains(&grid), "{grid:?} <-> {neighbor:?}");
                    assert!(index.is_neighbor(neighbor, grid));
                }
            }
        }
    }

    #[test]
    fn neighbor_block_is_clipped_at_edges() {
        let index = planar_index(20.0);
        let corner = index
            .grid_id_for_position(Vec3::new(-100.0, 0.0, -100.0))
            .expect("grid");
        assert_eq!(index.neighbor_grids(corner).expect("neighbors").len(), 4);
        let middle = index
            .grid_id_for_position(Vec3::new(0.0, 0.0, 0.0))
            .expect("grid");
        assert_eq!(index.neighbor_grids(middle).expect("neighbors").len(), 9);

        let volume = volume_index();
        let center = volume
            .grid_id_for_position(Vec3::new(25.0, 25.0, 25.0))
            .expect("grid");
        assert_eq!(volume.neighbor_grids(center).expect("neighbors").len(), 27);
        assert!(matches!(
            volume.neighbor_grids(GridId(-1)),
            Err(AoiError::UnknownGrid(-1))
        ));
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let mut index = planar_index(20.0);
        let first = index
            .insert(7, 70, Vec3::new(1.0, 0.0, 1.0))
            .expect("insert");
        let InsertOutcome::Inserted(grid) = first else {
            panic!("expected insert");
        };
        let second = index
            .insert(7, 71, Vec3::new(90.0, 0.0, 90.0))
            .expect("insert");
        assert_eq!(second, InsertOutcome::AlreadyPresent(grid));
        assert_eq!(index.len(), 1);
        assert_eq!(index.objects_in_grid(grid).expect("cell").get(&7), Some(&70));
    }

    #[test]
    fn stale_position_removal_is_reported() {
        let mut index = planar_index(20.0);
        index
            .insert(3, 30, Vec3::new(1.0, 0.0, 1.0))
            .expect("insert");
        let stale = index.remove(3, Vec3::new(60.0, 0.0, 60.0));
        assert!(matches!(
            stale,
            Err(AoiError::NotFound { object_id: 3, .. })
        ));
        assert_eq!(index.len(), 1);
        assert_eq!(index.remove(3, Vec3::new(2.0, 0.0, 2.0)), Ok(30));
        assert!(index.is_empty());
    }

    #[test]
    fn simulated_movement_keeps_objects_in_at_most_one_cell() {
        let mut index = planar_index(20.0);
        let mut positions: HashMap<i64, Vec3> = HashMap::new();
        for id in 0..16i64 {
            let position = Vec3::new(-90.0 + id as f32 * 11.0, 0.0, -90.0 + id as f32 * 7.0);
            index.insert(id, id as u32, position).expect("insert");
            positions.insert(id, position);
        }

        for step in 0..200i64 {
            let id = step % 16;
            let old = positions[&id];
            let mut next = Vec3::new(
                old.x + ((step * 37) % 41 - 20) as f32,
                0.0,
                old.z + ((step * 53) % 43 - 21) as f32,
            );
            if !index.contains_position(next) {
                next = Vec3::new(-old.x * 0.5, 0.0, -old.z * 0.5);
            }
            let payload = index.remove(id, old).expect("remove");
            index.insert(id, payload, next).expect("insert");
            positions.insert(id, next);
        }

        let mut seen = HashSet::new();
        for raw in 0..index.grid_count() {
            if let Some(cell) = index.objects_in_grid(GridId(raw)) {
                for id in cell.keys() {
                    assert!(seen.insert(*id), "object {id} in more than one cell");
                }
            }
        }
        assert_eq!(seen.len(), 16);
        for (id, position) in positions {
            assert_eq!(
                index.cell_of(id),
                Some(index.grid_id_for_position(position).expect("grid"))
            );
        }
    }

    #[test]
    fn objects_near_position_unions_the_neighbor_block() {
        let mut index = planar_index(20.0);
        index.insert(1, 1, Vec3::new(1.0, 0.0, 1.0)).expect("insert");
        index.insert(2, 2, Vec3::new(25.0, 0.0, 25.0)).expect("insert");
        index.insert(3, 3, Vec3::new(65.0, 0.0, 1.0)).expect("insert");

        let near = index
            .objects_near_position(Vec3::new(5.0, 0.0, 5.0))
            .expect("query");
        assert_eq!(near.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn objects_in_box_covers_every_overlapped_cell() {
        let mut index = planar_index(20.0);
        index.insert(1, 1, Vec3::new(0.0, 0.0, 5.0)).expect("insert");
        index.insert(2, 2, Vec3::new(0.0, 0.0, 75.0)).expect("insert");
        index.insert(3, 3, Vec3::new(-80.0, 0.0, 0.0)).expect("insert");

        let found = index.objects_in_box(Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 80.0));
        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![1, 2]);

        let outside = index.objects_in_box(
            Vec3::new(500.0, 0.0, 500.0),
            Vec3::new(600.0, 0.0, 600.0),
        );
        assert!(outside.is_empty());
    }
}
