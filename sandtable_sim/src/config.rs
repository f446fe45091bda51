// Data-driven session configuration.
//
// Every tunable the lockstep core reads lives in `SessionConfig`: the
// scheduling constants (latency window, checksum interval, stall timeout,
// abort ceiling), the planner's cost weights and strategy priority, the map,
// economy constants and the unit templates. It is loaded from JSON (the host
// sends it verbatim in `GameStart`) and validated before a session is built.
//
// All peers must run byte-identical configs. `config_hash()` hashes the
// canonical JSON with FNV-1a; peers send it in their handshake and the relay
// rejects a mismatch before the game starts. The seed is deliberately not
// part of the config: it is picked by the host at start time.
//
// See also: `sim.rs` which owns the config inside `SimState`,
// `pathfinding.rs` for `MovementStrategy` and how `CostWeights` combine,
// `scheduler.rs` for the stall and abort thresholds.
//
// **Critical constraint: determinism.** Config values feed directly into
// simulation logic. Only integer fields; the JSON field order is fixed by the
// struct layout so the hash is stable.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::StateHasher;
use crate::pathfinding::MovementStrategy;
use crate::types::*;
use crate::unit::{CapabilitySet, UnitKindTag, Weapon};

/// Largest supported map edge, in cells.
pub const MAX_MAP_EDGE: u32 = 1024;

/// Rejected configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: u64,
        value: u64,
    },
    #[error("abort ceiling {abort_ceiling} is below stall timeout {stall_timeout}")]
    AbortBeforeStall { stall_timeout: u64, abort_ceiling: u64 },
    #[error("strategy priority is empty")]
    NoStrategies,
    #[error("strategy {0:?} listed more than once")]
    DuplicateStrategy(MovementStrategy),
    #[error("map is {width}x{height}; edges must be 1..={MAX_MAP_EDGE}")]
    BadMapSize { width: u32, height: u32 },
    #[error("map row {row} has {len} cells, expected {width}")]
    BadMapRow { row: usize, len: usize, width: u32 },
    #[error("map has {rows} rows, expected {height}")]
    BadMapHeight { rows: usize, height: u32 },
    #[error("unknown map glyph {glyph:?} at ({x}, {y})")]
    BadGlyph { glyph: char, x: usize, y: usize },
    #[error("start cell {0} is outside the map")]
    StartOutOfBounds(CellCoord),
    #[error("template {name:?}: {problem}")]
    BadTemplate { name: String, problem: &'static str },
    #[error("roster has {count} participants; at most {max} may play")]
    TooManyPlayers { count: usize, max: usize },
    #[error("invalid config JSON: {0}")]
    Json(String),
}

// ---------------------------------------------------------------------------
// Pathing
// ---------------------------------------------------------------------------

/// Named, independently tunable path cost terms.
///
/// `step = terrain * terrain_cost + threat * hostile_influence
///         + congestion * congestion_count (+ demolition | push_wait)`,
/// with the whole step scaled by 3/2 for diagonal moves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostWeights {
    pub terrain: u32,
    pub threat: u32,
    pub congestion: u32,
    /// Flat extra cost of a wall cell under `DestroyObstacles`.
    pub demolition: u32,
    /// Flat extra cost of an occupied cell under `PushThrough`.
    pub push_wait: u32,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            terrain: 1,
            threat: 1,
            congestion: 4,
            demolition: 60,
            push_wait: 25,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathingConfig {
    pub weights: CostWeights,
    /// Tie-break order when strategies produce equal total cost. Only the
    /// strategies listed here are ever tried.
    pub strategy_priority: Vec<MovementStrategy>,
    /// Node expansions allowed per single-strategy search.
    pub max_expansions: u32,
    /// Planner calls allowed per frame across all units. Units past the
    /// budget wait for the next frame (ascending id order decides who).
    pub searches_per_frame: u32,
    /// Frames between successful replans for one unit.
    pub recompute_delay: u16,
    /// Frames before retrying after a failed plan.
    pub retry_delay: u16,
    /// Frames a unit waits on an occupied step before giving up on its path.
    pub blocked_patience: u16,
    /// Extra patience for units whose path was planned with `PushThrough`.
    pub push_patience: u16,
}

impl Default for PathingConfig {
    fn default() -> Self {
        Self {
            weights: CostWeights::default(),
            strategy_priority: vec![
                MovementStrategy::CheapestAvoidAll,
                MovementStrategy::PushThrough,
                MovementStrategy::DestroyObstacles,
            ],
            max_expansions: 4096,
            searches_per_frame: 16,
            recompute_delay: 8,
            retry_delay: 15,
            blocked_patience: 6,
            push_patience: 12,
        }
    }
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

/// Map layout. `rows` uses one glyph per cell:
/// `.` clear, `=` road, `,` rough, `~` water, `^` cliff, `#` wall, `*` rock.
/// Empty `rows` means an all-clear map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapConfig {
    pub width: u32,
    pub height: u32,
    pub rows: Vec<String>,
    /// Rally cell for each participant, by roster position.
    pub start_cells: Vec<CellCoord>,
}

impl MapConfig {
    /// An all-clear map with starting corners.
    pub fn open(width: u32, height: u32) -> Self {
        let (w, h) = (width as i32, height as i32);
        Self {
            width,
            height,
            rows: Vec::new(),
            start_cells: vec![
                CellCoord::new(1, 1),
                CellCoord::new(w - 2, h - 2),
                CellCoord::new(w - 2, 1),
                CellCoord::new(1, h - 2),
            ],
        }
    }

    /// Parse `rows` into terrain and obstacles, row-major.
    pub fn parse_cells(
        &self,
        wall_hp: u16,
    ) -> Result<Vec<(Terrain, Option<Obstacle>)>, ConfigError> {
        let total = self.width as usize * self.height as usize;
        if self.rows.is_empty() {
            return Ok(vec![(Terrain::Clear, None); total]);
        }
        if self.rows.len() != self.height as usize {
            return Err(ConfigError::BadMapHeight {
                rows: self.rows.len(),
                height: self.height,
            });
        }
        let mut cells = Vec::with_capacity(total);
        for (y, row) in self.rows.iter().enumerate() {
            let len = row.chars().count();
            if len != self.width as usize {
                return Err(ConfigError::BadMapRow {
                    row: y,
                    len,
                    width: self.width,
                });
            }
            for (x, glyph) in row.chars().enumerate() {
                let cell = match glyph {
                    '.' => (Terrain::Clear, None),
                    '=' => (Terrain::Road, None),
                    ',' => (Terrain::Rough, None),
                    '~' => (Terrain::Water, None),
                    '^' => (Terrain::Cliff, None),
                    '#' => (Terrain::Clear, Some(Obstacle::Wall { hp: wall_hp })),
                    '*' => (Terrain::Clear, Some(Obstacle::Rock)),
                    glyph => return Err(ConfigError::BadGlyph { glyph, x, y }),
                };
                cells.push(cell);
            }
        }
        Ok(cells)
    }
}

// ---------------------------------------------------------------------------
// Unit templates
// ---------------------------------------------------------------------------

/// Everything needed to stamp out a unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTemplate {
    pub kind: UnitKindTag,
    pub cost: u32,
    pub build_frames: u16,
    pub max_health: u16,
    pub movement: MovementType,
    pub speed: i32,
    pub turn_rate: u8,
    pub terrain_affinity: [u16; 5],
    pub capabilities: CapabilitySet,
    pub weapon: Option<Weapon>,
    /// Hostile influence radiated into the threat map, in cells.
    pub threat_radius: u8,
}

fn default_templates() -> BTreeMap<String, UnitTemplate> {
    let move_fight = CapabilitySet::LOCOMOTION.union(CapabilitySet::COMBAT);
    let mut t = BTreeMap::new();
    t.insert(
        "rifleman".to_string(),
        UnitTemplate {
            kind: UnitKindTag::Infantry,
            cost: 100,
            build_frames: 30,
            max_health: 50,
            movement: MovementType::Foot,
            speed: 16,
            turn_rate: 64,
            terrain_affinity: [100; 5],
            capabilities: move_fight,
            weapon: Some(Weapon {
                damage: 8,
                range: 3 * LEPTONS_PER_CELL,
                cooldown_frames: 15,
                jitter: 2,
            }),
            threat_radius: 3,
        },
    );
    t.insert(
        "engineer".to_string(),
        UnitTemplate {
            kind: UnitKindTag::Infantry,
            cost: 150,
            build_frames: 30,
            max_health: 40,
            movement: MovementType::Foot,
            speed: 16,
            turn_rate: 64,
            terrain_affinity: [100; 5],
            capabilities: CapabilitySet::LOCOMOTION.union(CapabilitySet::CONSTRUCTION),
            weapon: None,
            threat_radius: 0,
        },
    );
    t.insert(
        "tank".to_string(),
        UnitTemplate {
            kind: UnitKindTag::Vehicle,
            cost: 400,
            build_frames: 60,
            max_health: 200,
            movement: MovementType::Track,
            speed: 24,
            turn_rate: 16,
            terrain_affinity: [100; 5],
            capabilities: move_fight,
            weapon: Some(Weapon {
                damage: 30,
                range: 5 * LEPTONS_PER_CELL,
                cooldown_frames: 40,
                jitter: 5,
            }),
            threat_radius: 5,
        },
    );
    t.insert(
        "gunship".to_string(),
        UnitTemplate {
            kind: UnitKindTag::Aircraft,
            cost: 600,
            build_frames: 80,
            max_health: 120,
            movement: MovementType::Air,
            speed: 48,
            turn_rate: 24,
            terrain_affinity: [100; 5],
            capabilities: move_fight,
            weapon: Some(Weapon {
                damage: 20,
                range: 4 * LEPTONS_PER_CELL,
                cooldown_frames: 25,
                jitter: 4,
            }),
            threat_radius: 4,
        },
    );
    t.insert(
        "gunboat".to_string(),
        UnitTemplate {
            kind: UnitKindTag::Vessel,
            cost: 500,
            build_frames: 70,
            max_health: 160,
            movement: MovementType::Float,
            speed: 20,
            turn_rate: 12,
            terrain_affinity: [100; 5],
            capabilities: move_fight,
            weapon: Some(Weapon {
                damage: 25,
                range: 5 * LEPTONS_PER_CELL,
                cooldown_frames: 35,
                jitter: 5,
            }),
            threat_radius: 5,
        },
    );
    t
}

// ---------------------------------------------------------------------------
// Session config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Frames between a command being issued and it executing.
    pub latency_window: u64,
    /// Audit every this many frames.
    pub checksum_interval: u64,
    /// Waiting frames on one input before the scheduler reports a stall.
    pub stall_timeout: u64,
    /// Waiting frames after which the session is aborted.
    pub abort_ceiling: u64,
    pub pathing: PathingConfig,
    pub map: MapConfig,
    pub starting_credits: u32,
    pub wall_cost: u32,
    pub wall_hp: u16,
    pub wall_build_frames: u16,
    /// Percentage of a template's cost refunded on sale.
    pub sell_refund_percent: u32,
    pub templates: BTreeMap<String, UnitTemplate>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            latency_window: 2,
            checksum_interval: 50,
            stall_timeout: 30,
            abort_ceiling: 300,
            pathing: PathingConfig::default(),
            map: MapConfig::open(32, 32),
            starting_credits: 1000,
            wall_cost: 50,
            wall_hp: 200,
            wall_build_frames: 20,
            sell_refund_percent: 50,
            templates: default_templates(),
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// FNV-1a over the canonical JSON encoding.
    pub fn config_hash(&self) -> u64 {
        let mut hasher = StateHasher::new();
        // Serializing plain structs, ints and BTreeMaps cannot fail.
        if let Ok(bytes) = serde_json::to_vec(self) {
            hasher.write_bytes(&bytes);
        }
        hasher.finish()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("latency_window", self.latency_window, 1)?;
        at_least("checksum_interval", self.checksum_interval, 1)?;
        at_least("stall_timeout", self.stall_timeout, 1)?;
        if self.abort_ceiling < self.stall_timeout {
            return Err(ConfigError::AbortBeforeStall {
                stall_timeout: self.stall_timeout,
                abort_ceiling: self.abort_ceiling,
            });
        }
        at_least("max_expansions", u64::from(self.pathing.max_expansions), 1)?;
        at_least(
            "searches_per_frame",
            u64::from(self.pathing.searches_per_frame),
            1,
        )?;
        at_least("wall_hp", u64::from(self.wall_hp), 1)?;

        if self.pathing.strategy_priority.is_empty() {
            return Err(ConfigError::NoStrategies);
        }
        let mut seen = BTreeSet::new();
        for &s in &self.pathing.strategy_priority {
            if !seen.insert(s) {
                return Err(ConfigError::DuplicateStrategy(s));
            }
        }

        let map = &self.map;
        if !(1..=MAX_MAP_EDGE).contains(&map.width) || !(1..=MAX_MAP_EDGE).contains(&map.height) {
            return Err(ConfigError::BadMapSize {
                width: map.width,
                height: map.height,
            });
        }
        map.parse_cells(self.wall_hp)?;
        for &start in &map.start_cells {
            let inside = start.x >= 0
                && start.y >= 0
                && (start.x as u32) < map.width
                && (start.y as u32) < map.height;
            if !inside {
                return Err(ConfigError::StartOutOfBounds(start));
            }
        }

        for (name, t) in &self.templates {
            let bad = |problem| ConfigError::BadTemplate {
                name: name.clone(),
                problem,
            };
            if t.max_health == 0 {
                return Err(bad("max_health must be positive"));
            }
            if t.speed <= 0 || t.speed > LEPTONS_PER_CELL / 2 {
                return Err(bad("speed must be in 1..=128 leptons per frame"));
            }
            if t.turn_rate == 0 {
                return Err(bad("turn_rate must be positive"));
            }
            if t.terrain_affinity.contains(&0) {
                return Err(bad("terrain affinity must be positive"));
            }
            if t.capabilities.contains(CapabilitySet::COMBAT) && t.weapon.is_none() {
                return Err(bad("combat capability requires a weapon"));
            }
        }
        Ok(())
    }
}

fn at_least(field: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min {
        Err(ConfigError::TooSmall { field, min, value })
    } else {
        Ok(())
    }
}
