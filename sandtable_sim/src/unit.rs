// Units: the arena entries the engine advances every frame.
//
// A unit's *variant* (`UnitKind`) is a tagged enum carrying the small amount
// of state that only one variant has: an infantry sub-cell spot, an aircraft
// altitude, a vessel's submerged flag. Everything else is shared: the
// `MovementProfile`, the current `Path`, health, order and activity.
//
// What a unit can *do* is not implied by its variant. It is the explicit
// `CapabilitySet` copied from its template at spawn, and the engine checks
// capabilities before running the locomotion, combat and construction parts
// of a unit's update. An infantry template without `COMBAT` never fires, a
// vehicle template with `CONSTRUCTION` can build walls.
//
// See also: `sim.rs` for the per-frame update passes, `pathfinding.rs` for
// how `MovementProfile` feeds into step costs, `config.rs` for
// `UnitTemplate` which every unit is stamped from.
//
// **Critical constraint: determinism.** Units are only ever visited in
// ascending `UnitId` order. Nothing here may hold references to other units;
// cross-unit links (attack targets) are ids looked up through the arena.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::pathfinding::{MovementStrategy, PathFailure};
use crate::types::*;

/// Infantry share a cell four to a cell, one per quadrant.
pub const INFANTRY_SPOTS: u8 = 4;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Bit set of what a unit can do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilitySet(pub u8);

impl CapabilitySet {
    pub const NONE: Self = Self(0);
    pub const LOCOMOTION: Self = Self(1);
    pub const COMBAT: Self = Self(1 << 1);
    pub const CONSTRUCTION: Self = Self(1 << 2);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// Variant tag without per-variant state. Used by templates and commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnitKindTag {
    Infantry,
    Vehicle,
    Aircraft,
    Vessel,
}

impl UnitKindTag {
    pub const fn index(self) -> u8 {
        match self {
            UnitKindTag::Infantry => 0,
            UnitKindTag::Vehicle => 1,
            UnitKindTag::Aircraft => 2,
            UnitKindTag::Vessel => 3,
        }
    }
}

/// Per-variant unit state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    /// `spot` is the quadrant (0..4) of the current cell the soldier stands in.
    Infantry { spot: u8 },
    Vehicle,
    /// Aircraft ignore ground occupancy and never block cells.
    Aircraft { altitude: u8 },
    Vessel { submerged: bool },
}

impl UnitKind {
    pub fn from_tag(tag: UnitKindTag) -> Self {
        match tag {
            UnitKindTag::Infantry => UnitKind::Infantry { spot: 0 },
            UnitKindTag::Vehicle => UnitKind::Vehicle,
            UnitKindTag::Aircraft => UnitKind::Aircraft { altitude: 0 },
            UnitKindTag::Vessel => UnitKind::Vessel { submerged: false },
        }
    }

    pub fn tag(self) -> UnitKindTag {
        match self {
            UnitKind::Infantry { .. } => UnitKindTag::Infantry,
            UnitKind::Vehicle => UnitKindTag::Vehicle,
            UnitKind::Aircraft { .. } => UnitKindTag::Aircraft,
            UnitKind::Vessel { .. } => UnitKindTag::Vessel,
        }
    }

    /// Whether this unit counts toward cell occupancy.
    pub fn occupies_ground(self) -> bool {
        !matches!(self, UnitKind::Aircraft { .. })
    }

    pub fn is_infantry(self) -> bool {
        matches!(self, UnitKind::Infantry { .. })
    }
}

/// Lepton offset from cell center for an infantry quadrant.
pub fn spot_offset(spot: u8) -> (i32, i32) {
    const Q: i32 = LEPTONS_PER_CELL / 4;
    match spot % INFANTRY_SPOTS {
        0 => (-Q, -Q),
        1 => (Q, -Q),
        2 => (-Q, Q),
        _ => (Q, Q),
    }
}

// ---------------------------------------------------------------------------
// Movement
// ---------------------------------------------------------------------------

/// How a unit moves. Shared by every variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementProfile {
    pub movement: MovementType,
    /// Leptons travelled per frame along a straight step.
    pub speed: i32,
    /// Facing steps per frame.
    pub turn_rate: u8,
    /// Whether the unit parks on a sub-cell spot instead of the cell center.
    pub sub_cell: bool,
    /// Percentage multiplier on base terrain cost, indexed by
    /// `Terrain::index()`. 100 is neutral.
    pub terrain_affinity: [u16; 5],
}

impl MovementProfile {
    /// Terrain component of entering a cell of this terrain, or `None` if
    /// the terrain is impassable for this profile.
    pub fn terrain_cost(&self, terrain: Terrain) -> Option<u32> {
        let base = terrain.base_cost(self.movement)?;
        let pct = u32::from(self.terrain_affinity[terrain.index()]);
        Some((base * pct / 100).max(1))
    }

    /// Cheapest terrain cost this profile can ever pay. Scales the heuristic.
    pub fn min_terrain_cost(&self) -> u32 {
        Terrain::ALL
            .iter()
            .filter_map(|&t| self.terrain_cost(t))
            .min()
            .unwrap_or(1)
    }
}

/// A planned route. `steps` excludes the cell the unit is standing in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitPath {
    pub steps: VecDeque<CellCoord>,
    /// Cell the path was planned toward.
    pub goal: Option<CellCoord>,
    pub strategy: Option<MovementStrategy>,
    /// Grid structure version at planning time. A mismatch marks the path
    /// stale at the next recompute check.
    pub structure_version: u64,
    /// Set when something invalidated the path; cleared by replanning.
    pub stale: bool,
}

impl UnitPath {
    pub fn clear(&mut self) {
        *self = UnitPath::default();
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Orders and activity
// ---------------------------------------------------------------------------

/// What the owning player told the unit to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOrder {
    #[default]
    Idle,
    Move { destination: CellCoord },
    Attack { target: UnitId },
    Construct { site: CellCoord },
}

impl UnitOrder {
    /// Stable numeric tag for checksumming.
    pub fn tag(self) -> u8 {
        match self {
            UnitOrder::Idle => 0,
            UnitOrder::Move { .. } => 1,
            UnitOrder::Attack { .. } => 2,
            UnitOrder::Construct { .. } => 3,
        }
    }
}

/// What the unit is doing this frame, as a consequence of its order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    #[default]
    Idle,
    /// In transit toward the next path step.
    Moving,
    /// Next step is occupied; waiting for it to clear.
    Waiting,
    /// Knocking down a wall on the path.
    Demolishing { cell: CellCoord },
    Firing,
    Building,
    /// Last planning attempt failed; retries after the path delay.
    Stuck { reason: PathFailure },
}

/// Weapon stats copied from the template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weapon {
    pub damage: u16,
    /// Range in leptons, center to center.
    pub range: i32,
    pub cooldown_frames: u16,
    /// Damage jitter, drawn symmetric in `[-jitter, jitter]`.
    pub jitter: u16,
}

/// A unit in the arena.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub owner: PlayerId,
    /// Template name this unit was built from.
    pub template: String,
    pub kind: UnitKind,
    pub capabilities: CapabilitySet,
    pub profile: MovementProfile,
    pub weapon: Option<Weapon>,

    pub health: u16,
    pub max_health: u16,

    /// Exact position. Equals the occupied cell's parking point when at rest.
    pub position: LeptonPos,
    /// Cell the unit occupies. Updated when a step completes, not mid-step.
    pub cell: CellCoord,
    pub facing: Facing,

    pub order: UnitOrder,
    pub activity: Activity,
    pub path: UnitPath,

    /// Frames until the planner may run for this unit again.
    pub path_delay: u16,
    /// Consecutive frames spent waiting on an occupied step.
    pub blocked_frames: u16,
    pub weapon_cooldown: u16,
    pub build_progress: u16,
}

impl Unit {
    /// Where the unit parks inside `cell`: the center, or its sub-cell spot.
    pub fn parking_point(&self, cell: CellCoord) -> LeptonPos {
        match self.kind {
            UnitKind::Infantry { spot } if self.profile.sub_cell => {
                let (dx, dy) = spot_offset(spot);
                cell.center().offset(dx, dy)
            }
            _ => cell.center(),
        }
    }

    pub fn can(&self, capability: CapabilitySet) -> bool {
        self.capabilities.contains(capability)
    }

    /// Whether the unit is between two cells.
    pub fn in_transit(&self) -> bool {
        self.position != self.parking_point(self.cell)
    }

    /// Where the current order wants the unit to end up, if anywhere.
    pub fn wants_to_reach(&self) -> Option<CellCoord> {
        match self.order {
            UnitOrder::Move { destination } => Some(destination),
            UnitOrder::Construct { site } => Some(site),
            UnitOrder::Idle | UnitOrder::Attack { .. } => None,
        }
    }

    /// Drop the order and path after an unrecoverable per-unit fault.
    pub fn degrade_to_idle(&mut self) {
        self.order = UnitOrder::Idle;
        self.activity = Activity::Idle;
        self.path.clear();
        self.blocked_frames = 0;
        self.build_progress = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(movement: MovementType) -> MovementProfile {
        MovementProfile {
            movement,
            speed: 16,
            turn_rate: 32,
            sub_cell: false,
            terrain_affinity: [100; 5],
        }
    }

    #[test]
    fn capability_set_contains_subsets() {
        let both = CapabilitySet::LOCOMOTION.union(CapabilitySet::COMBAT);
        assert!(both.contains(CapabilitySet::COMBAT));
        assert!(both.contains(CapabilitySet::LOCOMOTION));
        assert!(!both.contains(CapabilitySet::CONSTRUCTION));
        assert!(both.contains(CapabilitySet::NONE));
    }

    #[test]
    fn affinity_scales_terrain_cost() {
        let mut p = profile(MovementType::Track);
        assert_eq!(p.terrain_cost(Terrain::Rough), Some(12));
        p.terrain_affinity[Terrain::Rough.index()] = 50;
        assert_eq!(p.terrain_cost(Terrain::Rough), Some(6));
        assert_eq!(p.terrain_cost(Terrain::Water), None);
        assert_eq!(p.min_terrain_cost(), 6);
    }

    #[test]
    fn infantry_spots_are_distinct_and_inside_cell() {
        let cell = CellCoord::new(2, 2);
        let mut points: Vec<LeptonPos> = (0..INFANTRY_SPOTS)
            .map(|s| {
                let (dx, dy) = spot_offset(s);
                cell.center().offset(dx, dy)
            })
            .collect();
        for p in &points {
            assert_eq!(p.cell(), cell);
        }
        points.sort();
        points.dedup();
        assert_eq!(points.len(), INFANTRY_SPOTS as usize);
    }

    #[test]
    fn only_aircraft_skip_occupancy() {
        for tag in [UnitKindTag::Infantry, UnitKindTag::Vehicle, UnitKindTag::Vessel] {
            assert!(UnitKind::from_tag(tag).occupies_ground());
        }
        assert!(!UnitKind::from_tag(UnitKindTag::Aircraft).occupies_ground());
    }
}
