// Fixed-resolution cell grid: the planner's search space and the engine's
// occupancy ledger.
//
// Stored as a flat `Vec<Cell>` indexed by `x + y * width`. Each cell carries
// its static part (terrain, obstacle) and its dynamic part (how many units
// stand in it, how many of those are mid-step, which unit has reserved it as
// its next step). A separate per-player threat layer holds the hostile
// influence the planner charges for.
//
// `structure_version` increments whenever the static part of any cell
// changes (wall built or destroyed, terrain edited). Paths remember the
// version they were planned against; a mismatch marks them stale at the next
// recompute check instead of invalidating them eagerly.
//
// Writes happen only from the engine's command and movement phases. The
// planning pass only holds `&CellGrid`, so every search in a frame sees the
// same grid.
//
// See also: `pathfinding.rs` which reads passability and costs from here,
// `sim.rs` for the movement pass that maintains occupancy.
//
// **Critical constraint: determinism.** Occupancy counters must be updated
// in the same order on every peer, which the ascending-id movement pass
// guarantees. Never mutate the grid from a planning or combat read path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::*;
use crate::unit::INFANTRY_SPOTS;

/// Largest roster a session accepts.
pub const MAX_PLAYERS: usize = 8;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub terrain: Terrain,
    pub obstacle: Option<Obstacle>,
    /// Ground units whose `cell` is this cell.
    pub occupants: u8,
    /// How many of `occupants` are infantry.
    pub infantry: u8,
    /// How many of `occupants` are currently in transit out of this cell.
    pub moving: u8,
    /// Unit that has claimed this cell as its next step.
    pub reserved_by: Option<UnitId>,
}

impl Cell {
    /// Whether another unit of the given footprint may enter right now.
    pub fn has_room_for(&self, infantry: bool) -> bool {
        if self.occupants == 0 {
            return true;
        }
        infantry && self.infantry == self.occupants && self.infantry < INFANTRY_SPOTS
    }

    /// Occupied, but only by units that are on their way out.
    pub fn is_temporarily_blocked(&self) -> bool {
        self.occupants > 0 && self.moving == self.occupants
    }
}

/// Result of damaging an obstacle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObstacleHit {
    /// Nothing destructible there.
    NoEffect,
    Damaged { remaining: u16 },
    Destroyed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellGrid {
    width: u32,
    height: u32,
    cells: Vec<Cell>,
    /// Hostile influence, `threat[player][index]` = summed influence of
    /// units owned by `player`. A planner for player P charges for every
    /// layer except P's own. Layers appear on first use.
    threat: BTreeMap<PlayerId, Vec<u16>>,
    structure_version: u64,
}

impl CellGrid {
    /// All-clear grid.
    pub fn new(width: u32, height: u32) -> Self {
        let total = width as usize * height as usize;
        Self {
            width,
            height,
            cells: vec![Cell::default(); total],
            threat: BTreeMap::new(),
            structure_version: 0,
        }
    }

    /// Grid from row-major `(terrain, obstacle)` pairs, as produced by
    /// `MapConfig::parse_cells`.
    pub fn from_cells(width: u32, height: u32, layout: &[(Terrain, Option<Obstacle>)]) -> Self {
        let mut grid = Self::new(width, height);
        for (cell, &(terrain, obstacle)) in grid.cells.iter_mut().zip(layout) {
            cell.terrain = terrain;
            cell.obstacle = obstacle;
        }
        grid
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    pub fn in_bounds(&self, c: CellCoord) -> bool {
        c.x >= 0 && c.y >= 0 && (c.x as u32) < self.width && (c.y as u32) < self.height
    }

    /// Flat index, or `None` out of bounds.
    pub fn index(&self, c: CellCoord) -> Option<usize> {
        self.in_bounds(c)
            .then(|| c.x as usize + c.y as usize * self.width as usize)
    }

    /// Inverse of `index`.
    pub fn coord_of(&self, index: usize) -> CellCoord {
        let w = self.width as usize;
        CellCoord::new((index % w) as i32, (index / w) as i32)
    }

    pub fn cell(&self, c: CellCoord) -> Option<&Cell> {
        self.index(c).map(|i| &self.cells[i])
    }

    pub fn cell_at(&self, index: usize) -> &Cell {
        &self.cells[index]
    }

    fn cell_mut(&mut self, c: CellCoord) -> Option<&mut Cell> {
        let i = self.index(c)?;
        Some(&mut self.cells[i])
    }

    /// Row-major iteration with coordinates.
    pub fn iter(&self) -> impl Iterator<Item = (CellCoord, &Cell)> {
        self.cells
            .iter()
            .enumerate()
            .map(|(i, cell)| (self.coord_of(i), cell))
    }

    // -- Static layer -------------------------------------------------------

    pub fn set_terrain(&mut self, c: CellCoord, terrain: Terrain) {
        if let Some(cell) = self.cell_mut(c)
            && cell.terrain != terrain
        {
            cell.terrain = terrain;
            self.structure_version += 1;
        }
    }

    /// Place an obstacle. Returns false if out of bounds or already blocked.
    pub fn place_obstacle(&mut self, c: CellCoord, obstacle: Obstacle) -> bool {
        match self.cell_mut(c) {
            Some(cell) if cell.obstacle.is_none() => {
                cell.obstacle = Some(obstacle);
                self.structure_version += 1;
                true
            }
            _ => false,
        }
    }

    pub fn remove_obstacle(&mut self, c: CellCoord) -> Option<Obstacle> {
        let removed = self.cell_mut(c)?.obstacle.take();
        if removed.is_some() {
            self.structure_version += 1;
        }
        removed
    }

    /// Damage a destructible obstacle. Destroying it bumps the structure
    /// version; merely damaging it does not.
    pub fn damage_obstacle(&mut self, c: CellCoord, damage: u16) -> ObstacleHit {
        let Some(cell) = self.cell_mut(c) else {
            return ObstacleHit::NoEffect;
        };
        match cell.obstacle {
            Some(Obstacle::Wall { hp }) if hp > damage => {
                let remaining = hp - damage;
                cell.obstacle = Some(Obstacle::Wall { hp: remaining });
                ObstacleHit::Damaged { remaining }
            }
            Some(Obstacle::Wall { .. }) => {
                cell.obstacle = None;
                self.structure_version += 1;
                ObstacleHit::Destroyed
            }
            _ => ObstacleHit::NoEffect,
        }
    }

    /// Terrain and obstacles allow this movement type, ignoring units.
    pub fn statically_passable(&self, c: CellCoord, movement: MovementType) -> bool {
        let Some(cell) = self.cell(c) else {
            return false;
        };
        if cell.terrain.base_cost(movement).is_none() {
            return false;
        }
        movement == MovementType::Air || cell.obstacle.is_none()
    }

    // -- Occupancy ----------------------------------------------------------

    pub fn occupy(&mut self, c: CellCoord, infantry: bool) {
        if let Some(cell) = self.cell_mut(c) {
            cell.occupants = cell.occupants.saturating_add(1);
            if infantry {
                cell.infantry = cell.infantry.saturating_add(1);
            }
        }
    }

    pub fn vacate(&mut self, c: CellCoord, infantry: bool) {
        if let Some(cell) = self.cell_mut(c) {
            cell.occupants = cell.occupants.saturating_sub(1);
            if infantry {
                cell.infantry = cell.infantry.saturating_sub(1);
            }
        }
    }

    pub fn mark_moving(&mut self, c: CellCoord, moving: bool) {
        if let Some(cell) = self.cell_mut(c) {
            cell.moving = if moving {
                cell.moving.saturating_add(1)
            } else {
                cell.moving.saturating_sub(1)
            };
        }
    }

    /// Claim `c` for `unit`. Fails if another unit already holds it.
    pub fn reserve(&mut self, c: CellCoord, unit: UnitId) -> bool {
        match self.cell_mut(c) {
            Some(cell) if cell.reserved_by.is_none_or(|holder| holder == unit) => {
                cell.reserved_by = Some(unit);
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, c: CellCoord, unit: UnitId) {
        if let Some(cell) = self.cell_mut(c)
            && cell.reserved_by == Some(unit)
        {
            cell.reserved_by = None;
        }
    }

    /// Infantry spot in `c` not used by any of `taken`.
    pub fn free_spot(taken: impl IntoIterator<Item = u8>) -> u8 {
        let mut used = [false; INFANTRY_SPOTS as usize];
        for s in taken {
            used[(s % INFANTRY_SPOTS) as usize] = true;
        }
        used.iter().position(|u| !u).unwrap_or(0) as u8
    }

    // -- Threat -------------------------------------------------------------

    pub fn clear_threat(&mut self) {
        for layer in self.threat.values_mut() {
            layer.fill(0);
        }
    }

    /// Radiate `strength` influence for `owner` in a square of `radius`
    /// around `center`, falling off by one per ring.
    pub fn add_threat(&mut self, center: CellCoord, owner: PlayerId, radius: u8, strength: u16) {
        let total = self.cells.len();
        let width = self.width;
        let height = self.height;
        let layer = self.threat.entry(owner).or_insert_with(|| vec![0; total]);
        let r = i32::from(radius);
        for dy in -r..=r {
            for dx in -r..=r {
                let (x, y) = (center.x + dx, center.y + dy);
                if x < 0 || y < 0 || x as u32 >= width || y as u32 >= height {
                    continue;
                }
                let i = x as usize + y as usize * width as usize;
                let ring = dx.unsigned_abs().max(dy.unsigned_abs()) as u16;
                layer[i] = layer[i].saturating_add(strength.saturating_sub(ring));
            }
        }
    }

    /// Influence hostile to `viewer` at a flat index.
    pub fn hostile_threat(&self, index: usize, viewer: PlayerId) -> u32 {
        self.threat
            .iter()
            .filter(|&(&owner, _)| owner != viewer)
            .map(|(_, layer)| u32::from(layer[index]))
            .sum()
    }
}
