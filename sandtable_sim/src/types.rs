// Core types shared across the simulation.
//
// Spatial types come in two resolutions. `CellCoord` addresses the fixed grid
// the planner searches; `LeptonPos` is an absolute sub-cell position in
// leptons (256 per cell edge) used for smooth movement and weapon ranges.
// Both are plain integers: floating point never touches simulation state.
//
// Entity ids are small integers handed out in ascending order and never
// reused, so `BTreeMap<UnitId, _>` iteration order is creation order on every
// peer.
//
// Axis convention: x grows east, y grows south. `Facing` is a 256-step
// compass with 0 = north, increasing clockwise.
//
// **Critical constraint: determinism.** Every type here must have a total,
// platform-independent order and representation. No floats, no pointers.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Spatial types
// ---------------------------------------------------------------------------

/// Sub-cell resolution: one cell edge is 256 leptons.
pub const LEPTONS_PER_CELL: i32 = 256;

/// Offset from a cell's corner to its center.
pub const HALF_CELL: i32 = LEPTONS_PER_CELL / 2;

/// Diagonal steps cost `cost * 3 / 2`. Integer stand-in for sqrt(2) that
/// keeps the octile heuristic admissible.
pub const DIAGONAL_NUM: u32 = 3;
pub const DIAGONAL_DEN: u32 = 2;

/// A cell in the planning grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
}

impl CellCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn step(self, dir: Direction) -> Self {
        let (dx, dy) = dir.offset();
        Self::new(self.x + dx, self.y + dy)
    }

    /// King-move distance: the number of 8-neighbour steps between cells on
    /// an empty grid.
    pub fn chebyshev_distance(self, other: Self) -> u32 {
        let dx = (self.x - other.x).unsigned_abs();
        let dy = (self.y - other.y).unsigned_abs();
        dx.max(dy)
    }

    /// Direction of the single step from `self` to an adjacent `other`.
    pub fn direction_to(self, other: Self) -> Option<Direction> {
        let d = (other.x - self.x, other.y - self.y);
        Direction::ALL.into_iter().find(|dir| dir.offset() == d)
    }

    /// Absolute position of this cell's center.
    pub fn center(self) -> LeptonPos {
        LeptonPos::new(
            self.x * LEPTONS_PER_CELL + HALF_CELL,
            self.y * LEPTONS_PER_CELL + HALF_CELL,
        )
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// An absolute position in leptons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeptonPos {
    pub x: i32,
    pub y: i32,
}

impl LeptonPos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The cell containing this position.
    pub fn cell(self) -> CellCoord {
        CellCoord::new(
            self.x.div_euclid(LEPTONS_PER_CELL),
            self.y.div_euclid(LEPTONS_PER_CELL),
        )
    }

    /// Squared euclidean distance. Compared against squared ranges so no
    /// square root is ever needed.
    pub fn distance_squared(self, other: Self) -> i64 {
        let dx = i64::from(self.x - other.x);
        let dy = i64::from(self.y - other.y);
        dx * dx + dy * dy
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

/// The eight grid directions, in the fixed order every neighbour scan uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::SouthEast,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
        Direction::NorthWest,
    ];

    pub const fn offset(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::NorthEast => (1, -1),
            Direction::East => (1, 0),
            Direction::SouthEast => (1, 1),
            Direction::South => (0, 1),
            Direction::SouthWest => (-1, 1),
            Direction::West => (-1, 0),
            Direction::NorthWest => (-1, -1),
        }
    }

    pub const fn is_diagonal(self) -> bool {
        matches!(
            self,
            Direction::NorthEast | Direction::SouthEast | Direction::SouthWest | Direction::NorthWest
        )
    }

    /// The compass facing that points along this direction.
    pub const fn facing(self) -> Facing {
        Facing(match self {
            Direction::North => 0,
            Direction::NorthEast => 32,
            Direction::East => 64,
            Direction::SouthEast => 96,
            Direction::South => 128,
            Direction::SouthWest => 160,
            Direction::West => 192,
            Direction::NorthWest => 224,
        })
    }
}

/// A 256-step compass heading. Arithmetic wraps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Facing(pub u8);

impl Facing {
    /// Rotate toward `target` by at most `rate` steps, along the shorter arc.
    /// Exactly opposite headings turn clockwise.
    pub fn turn_toward(self, target: Facing, rate: u8) -> Facing {
        let diff = target.0.wrapping_sub(self.0) as i8;
        let rate = i16::from(rate);
        let diff = i16::from(diff);
        if diff.abs() <= rate {
            target
        } else if diff > 0 || diff == -128 {
            Facing(self.0.wrapping_add(rate as u8))
        } else {
            Facing(self.0.wrapping_sub(rate as u8))
        }
    }
}

// ---------------------------------------------------------------------------
// Entity IDs
// ---------------------------------------------------------------------------

/// A participant in the session. The canonical event order sorts on this
/// first, so it must be the same number on every peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u8);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Arena key for a unit. Allocated ascending from 1, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub u32);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Terrain
// ---------------------------------------------------------------------------

/// How a unit physically moves. Selects which terrain is passable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MovementType {
    Foot,
    Track,
    Wheel,
    Float,
    Air,
}

/// Ground cover of a cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Terrain {
    #[default]
    Clear,
    Road,
    Rough,
    Water,
    Cliff,
}

impl Terrain {
    pub const ALL: [Terrain; 5] = [
        Terrain::Clear,
        Terrain::Road,
        Terrain::Rough,
        Terrain::Water,
        Terrain::Cliff,
    ];

    /// Stable index into per-terrain tables.
    pub const fn index(self) -> usize {
        match self {
            Terrain::Clear => 0,
            Terrain::Road => 1,
            Terrain::Rough => 2,
            Terrain::Water => 3,
            Terrain::Cliff => 4,
        }
    }

    /// Base step cost for a movement type, or `None` if impassable.
    pub const fn base_cost(self, movement: MovementType) -> Option<u32> {
        match (movement, self) {
            (MovementType::Air, _) => Some(10),
            (MovementType::Float, Terrain::Water) => Some(10),
            (MovementType::Float, _) => None,
            (_, Terrain::Water | Terrain::Cliff) => None,
            (_, Terrain::Clear) => Some(10),
            (MovementType::Foot, Terrain::Road) => Some(10),
            (_, Terrain::Road) => Some(8),
            (MovementType::Foot, Terrain::Rough) => Some(14),
            (MovementType::Track, Terrain::Rough) => Some(12),
            (MovementType::Wheel, Terrain::Rough) => Some(20),
        }
    }

    /// Map-string glyph, inverse of the parse in `config::MapConfig`.
    pub const fn glyph(self) -> char {
        match self {
            Terrain::Clear => '.',
            Terrain::Road => '=',
            Terrain::Rough => ',',
            Terrain::Water => '~',
            Terrain::Cliff => '^',
        }
    }
}

/// Something standing in a cell that blocks ground movement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Obstacle {
    /// Player-built or map wall. Destructible.
    Wall { hp: u16 },
    /// Natural rock. Permanent.
    Rock,
}

impl Obstacle {
    pub const fn is_destructible(self) -> bool {
        matches!(self, Obstacle::Wall { .. })
    }
}
