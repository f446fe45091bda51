// Core simulation state and frame loop.
//
// `SimState` is the single source of truth for the arena: the cell grid,
// every unit, every player's credits and production queue, the shared RNG,
// and the session config. The engine is a pure function of its inputs:
// `(state, frame's records) -> (state', events)`. It never reads a clock,
// never touches the network, and never looks at anything local to one peer.
//
// ## Frame structure
//
// `step_frame` executes exactly one frame, `self.frame`, and only accepts
// the record list the scheduler released for it:
//
//   a. Commands, in `(participant, sequence)` order. Invalid commands are
//      dropped with a `CommandRejected` event; they never abort the frame.
//   b. Autonomous updates, each pass over units in ascending id order:
//      1. Planning: stale-path detection, per-unit delay countdown, and at
//         most `searches_per_frame` A* searches. The grid is read-only for
//         the whole pass, so every search in a frame sees the same grid.
//      2. Movement: turning, lepton steps, cell reservation and occupancy
//         hand-over, demolition of walls on a destroy-obstacles path, and
//         patience when the next cell is occupied.
//      3. Combat: cooldowns, range checks, RNG-jittered damage. Deaths are
//         applied after the pass.
//      4. Construction: build progress; a finished wall bumps the grid's
//         structure version, which marks every older path stale.
//      5. Production: one queue per player, in ascending player id.
//      6. Threat map rebuild from the surviving combat units.
//
// A unit whose update fails (a path step that is not adjacent, a step off
// the grid) is degraded to idle with a `UnitDegraded` event. The rest of the
// frame proceeds.
//
// ## Movement model
//
// Positions are in leptons (256 per cell). A unit standing still sits at its
// parking point: the cell center, or for infantry one of four sub-cell
// spots. A ground unit starts a step by reserving the next cell; only then
// does it turn and travel. `cell` changes when the unit reaches the next
// parking point, at which moment occupancy moves with it and the
// reservation is released. Aircraft skip obstacles, occupancy and
// reservations entirely.
//
// See also: `scheduler.rs` which decides which records reach `step_frame`,
// `pathfinding.rs` for `plan_path`, `checksum.rs` for `state_checksum`,
// `event.rs` for the narrative events returned per frame.
//
// **Critical constraint: determinism.** Same config, seed, and record stream
// must give the same state on every peer. Integer math only, `BTreeMap`
// iteration only, RNG draws only in the fixed pass order above.

use std::collections::{BTreeMap, VecDeque};

use sandtable_prng::GameRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::checksum::state_checksum;
use crate::command::{EventRecord, SimAction};
use crate::config::{ConfigError, SessionConfig};
use crate::error::StepError;
use crate::event::{RejectReason, SimEvent, SimEventKind, UnitFault};
use crate::grid::{CellGrid, MAX_PLAYERS, ObstacleHit};
use crate::pathfinding::{MovementStrategy, PathFailure, PathRequest, plan_path};
use crate::snapshot::{PlayerView, UnitView, WorldSnapshot};
use crate::types::*;
use crate::unit::*;

/// Rings searched around a requested spawn cell for room.
const SPAWN_SEARCH_RADIUS: i32 = 4;

/// One entry in a player's production queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionItem {
    pub template: String,
    /// Frames left before the unit rolls out.
    pub remaining: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub credits: u32,
    pub production: VecDeque<ProductionItem>,
    /// Where produced units appear.
    pub rally: CellCoord,
}

/// The entire deterministic world.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimState {
    /// Next frame to execute. Frame 0 has not run yet.
    pub frame: u64,
    pub rng: GameRng,
    /// Session config (immutable after construction).
    pub config: SessionConfig,
    pub grid: CellGrid,
    /// Unit arena. Ids ascend and are never reused.
    pub units: BTreeMap<UnitId, Unit>,
    pub next_unit_id: u32,
    pub players: BTreeMap<PlayerId, PlayerState>,
}

/// What one frame produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameResult {
    pub frame: u64,
    pub events: Vec<SimEvent>,
}

impl SimState {
    /// Fresh arena for `participants`. Each participant's rally cell is the
    /// map start cell at its roster position.
    pub fn new(config: SessionConfig, participants: &[PlayerId], seed: u64) -> Result<Self, ConfigError> {
        if participants.len() > MAX_PLAYERS {
            return Err(ConfigError::TooManyPlayers {
                count: participants.len(),
                max: MAX_PLAYERS,
            });
        }
        config.validate()?;
        let layout = config.map.parse_cells(config.wall_hp)?;
        let grid = CellGrid::from_cells(config.map.width, config.map.height, &layout);
        let center = CellCoord::new(config.map.width as i32 / 2, config.map.height as i32 / 2);
        let starts = &config.map.start_cells;
        let players = participants
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let rally = if starts.is_empty() {
                    center
                } else {
                    starts[i % starts.len()]
                };
                (
                    p,
                    PlayerState {
                        credits: config.starting_credits,
                        production: VecDeque::new(),
                        rally,
                    },
                )
            })
            .collect();

        Ok(Self {
            frame: 0,
            rng: GameRng::new(seed),
            config,
            grid,
            units: BTreeMap::new(),
            next_unit_id: 1,
            players,
        })
    }

    /// Execute frame `self.frame` with exactly the records released for it.
    pub fn step_frame(&mut self, records: &[EventRecord]) -> Result<FrameResult, StepError> {
        let frame = self.frame;
        if let Some(r) = records.iter().find(|r| r.frame != frame) {
            return Err(StepError::WrongFrame {
                expected: frame,
                got: r.frame,
            });
        }
        if !records.windows(2).all(|w| w[0].order_key() < w[1].order_key()) {
            return Err(StepError::Unsorted { frame });
        }

        let mut kinds = Vec::new();
        for record in records {
            self.apply_command(record, &mut kinds);
        }
        self.update_units(&mut kinds);
        self.frame += 1;

        Ok(FrameResult {
            frame,
            events: kinds.into_iter().map(|kind| SimEvent { frame, kind }).collect(),
        })
    }

    pub fn checksum(&self) -> u64 {
        state_checksum(self)
    }

    /// Read-only copy of what a renderer needs after a frame.
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            frame: self.frame,
            width: self.grid.width(),
            height: self.grid.height(),
            obstacles: self
                .grid
                .iter()
                .filter_map(|(c, cell)| cell.obstacle.map(|o| (c, o)))
                .collect(),
            units: self
                .units
                .values()
                .map(|u| UnitView {
                    id: u.id,
                    owner: u.owner,
                    template: u.template.clone(),
                    kind: u.kind.tag(),
                    position: u.position,
                    cell: u.cell,
                    facing: u.facing,
                    health: u.health,
                    max_health: u.max_health,
                    activity: u.activity,
                })
                .collect(),
            players: self
                .players
                .iter()
                .map(|(&id, p)| PlayerView {
                    id,
                    credits: p.credits,
                    queued: p.production.iter().map(|i| i.template.clone()).collect(),
                    rally: p.rally,
                })
                .collect(),
        }
    }

    /// Serialize the whole state, for debugging and diffing divergent runs.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Perturb hashed state so this peer's next checksum disagrees. Only
    /// desync tests call this.
    pub fn corrupt_for_testing(&mut self) {
        match self.players.values_mut().next() {
            Some(player) => player.credits = player.credits.wrapping_add(1),
            None => {
                self.rng.next_u64();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn apply_command(&mut self, record: &EventRecord, events: &mut Vec<SimEventKind>) {
        if let Err(reason) = self.try_apply(record, events) {
            debug!(
                frame = self.frame,
                participant = %record.participant,
                sequence = record.sequence,
                ?reason,
                "command rejected"
            );
            events.push(SimEventKind::CommandRejected {
                player: record.participant,
                sequence: record.sequence,
                reason,
            });
        }
    }

    fn try_apply(&mut self, record: &EventRecord, events: &mut Vec<SimEventKind>) -> Result<(), RejectReason> {
        let player = record.participant;
        if !self.players.contains_key(&player) {
            return Err(RejectReason::NotOwner);
        }
        match &record.action {
            SimAction::Move { unit, destination } => {
                self.check_cell(*destination)?;
                let u = owned_unit(&mut self.units, player, *unit, CapabilitySet::LOCOMOTION)?;
                u.order = UnitOrder::Move {
                    destination: *destination,
                };
                redirect(u);
            }
            SimAction::Stop { unit } => {
                let u = owned_unit(&mut self.units, player, *unit, CapabilitySet::NONE)?;
                halt(&self.grid, u);
            }
            SimAction::Attack { unit, target } => {
                let target_owner = self
                    .units
                    .get(target)
                    .map(|t| t.owner)
                    .ok_or(RejectReason::InvalidTarget)?;
                if target_owner == player {
                    return Err(RejectReason::InvalidTarget);
                }
                let u = owned_unit(&mut self.units, player, *unit, CapabilitySet::COMBAT)?;
                if u.weapon.is_none() {
                    return Err(RejectReason::MissingCapability);
                }
                u.order = UnitOrder::Attack { target: *target };
                redirect(u);
            }
            SimAction::Construct { unit, site } => {
                self.check_cell(*site)?;
                if !self.grid.statically_passable(*site, MovementType::Foot) {
                    return Err(RejectReason::InvalidTarget);
                }
                let cost = self.config.wall_cost;
                if self.players.get(&player).is_none_or(|p| p.credits < cost) {
                    return Err(RejectReason::InsufficientCredits);
                }
                let u = owned_unit(&mut self.units, player, *unit, CapabilitySet::CONSTRUCTION)?;
                if u.cell == *site {
                    return Err(RejectReason::InvalidTarget);
                }
                u.order = UnitOrder::Construct { site: *site };
                redirect(u);
                // Charged up front; replacing the order does not refund it.
                if let Some(p) = self.players.get_mut(&player) {
                    p.credits -= cost;
                }
            }
            SimAction::Produce { template } => {
                let t = self
                    .config
                    .templates
                    .get(template)
                    .ok_or(RejectReason::UnknownTemplate)?;
                let (cost, frames) = (t.cost, t.build_frames);
                let p = self.players.get_mut(&player).ok_or(RejectReason::NotOwner)?;
                if p.credits < cost {
                    return Err(RejectReason::InsufficientCredits);
                }
                p.credits -= cost;
                p.production.push_back(ProductionItem {
                    template: template.clone(),
                    remaining: frames,
                });
                events.push(SimEventKind::ProductionQueued {
                    player,
                    template: template.clone(),
                });
            }
            SimAction::SetRally { cell } => {
                self.check_cell(*cell)?;
                if let Some(p) = self.players.get_mut(&player) {
                    p.rally = *cell;
                }
            }
            SimAction::Sell { unit } => {
                let template = owned_unit(&mut self.units, player, *unit, CapabilitySet::NONE)?
                    .template
                    .clone();
                let cost = self.config.templates.get(&template).map_or(0, |t| t.cost);
                let refund = cost * self.config.sell_refund_percent / 100;
                self.remove_unit(*unit);
                if let Some(p) = self.players.get_mut(&player) {
                    p.credits = p.credits.saturating_add(refund);
                }
                events.push(SimEventKind::UnitSold {
                    unit: *unit,
                    owner: player,
                    refund,
                });
            }
            SimAction::Spawn { template, cell } => {
                self.spawn_unit(player, template, *cell, events)?;
            }
        }
        Ok(())
    }

    fn check_cell(&self, c: CellCoord) -> Result<(), RejectReason> {
        if self.grid.in_bounds(c) {
            Ok(())
        } else {
            Err(RejectReason::OutOfBounds)
        }
    }

    // -----------------------------------------------------------------------
    // Unit lifecycle
    // -----------------------------------------------------------------------

    /// Stamp out a unit from a template at the nearest cell with room.
    pub fn spawn_unit(
        &mut self,
        owner: PlayerId,
        template_name: &str,
        near: CellCoord,
        events: &mut Vec<SimEventKind>,
    ) -> Result<UnitId, RejectReason> {
        let template = self
            .config
            .templates
            .get(template_name)
            .ok_or(RejectReason::UnknownTemplate)?
            .clone();
        self.check_cell(near)?;
        let infantry = template.kind == UnitKindTag::Infantry;
        let cell = self
            .find_spawn_cell(near, template.movement, infantry)
            .ok_or(RejectReason::InvalidTarget)?;

        let id = UnitId(self.next_unit_id);
        self.next_unit_id += 1;
        let mut kind = UnitKind::from_tag(template.kind);
        if let UnitKind::Infantry { spot } = &mut kind {
            *spot = self.free_spot_in(cell, id);
        }

        let mut unit = Unit {
            id,
            owner,
            template: template_name.to_string(),
            kind,
            capabilities: template.capabilities,
            profile: MovementProfile {
                movement: template.movement,
                speed: template.speed,
                turn_rate: template.turn_rate,
                sub_cell: infantry,
                terrain_affinity: template.terrain_affinity,
            },
            weapon: template.weapon,
            health: template.max_health,
            max_health: template.max_health,
            position: cell.center(),
            cell,
            facing: Facing::default(),
            order: UnitOrder::Idle,
            activity: Activity::Idle,
            path: UnitPath::default(),
            path_delay: 0,
            blocked_frames: 0,
            weapon_cooldown: 0,
            build_progress: 0,
        };
        unit.position = unit.parking_point(cell);
        if kind.occupies_ground() {
            self.grid.occupy(cell, infantry);
        }
        self.units.insert(id, unit);
        events.push(SimEventKind::UnitSpawned {
            unit: id,
            owner,
            template: template_name.to_string(),
            cell,
        });
        Ok(id)
    }

    /// Nearest cell to `near` (by ring, then row-major) this movement type
    /// can stand in right now.
    fn find_spawn_cell(&self, near: CellCoord, movement: MovementType, infantry: bool) -> Option<CellCoord> {
        for r in 0..=SPAWN_SEARCH_RADIUS {
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx.abs().max(dy.abs()) != r {
                        continue;
                    }
                    let c = CellCoord::new(near.x + dx, near.y + dy);
                    if !self.grid.statically_passable(c, movement) {
                        continue;
                    }
                    if movement == MovementType::Air {
                        return Some(c);
                    }
                    if self
                        .grid
                        .cell(c)
                        .is_some_and(|cell| cell.has_room_for(infantry) && cell.reserved_by.is_none())
                    {
                        return Some(c);
                    }
                }
            }
        }
        None
    }

    /// Sub-cell spot in `cell` not used by infantry standing in or entering it.
    fn free_spot_in(&self, cell: CellCoord, exclude: UnitId) -> u8 {
        let incoming = self.grid.cell(cell).and_then(|c| c.reserved_by);
        let taken = self
            .units
            .values()
            .filter(|u| u.id != exclude && (u.cell == cell || incoming == Some(u.id)))
            .filter_map(|u| match u.kind {
                UnitKind::Infantry { spot } => Some(spot),
                _ => None,
            });
        CellGrid::free_spot(taken)
    }

    /// Take a unit out of the arena, releasing its grid footprint.
    fn remove_unit(&mut self, id: UnitId) -> Option<Unit> {
        let unit = self.units.remove(&id)?;
        if unit.kind.occupies_ground() {
            abandon_step(&mut self.grid, &unit);
            self.grid.vacate(unit.cell, unit.kind.is_infantry());
        }
        Some(unit)
    }

    fn degrade(&mut self, id: UnitId, fault: UnitFault, events: &mut Vec<SimEventKind>) {
        if let Some(unit) = self.units.get_mut(&id) {
            warn!(frame = self.frame, unit = %id, ?fault, "unit update failed, degrading to idle");
            abandon_step(&mut self.grid, unit);
            unit.degrade_to_idle();
            events.push(SimEventKind::UnitDegraded { unit: id, fault });
        }
    }

    // -----------------------------------------------------------------------
    // Autonomous updates
    // -----------------------------------------------------------------------

    fn update_units(&mut self, events: &mut Vec<SimEventKind>) {
        let ids: Vec<UnitId> = self.units.keys().copied().collect();
        self.planning_pass(&ids, events);
        for &id in &ids {
            if let Err(fault) = self.move_unit(id, events) {
                self.degrade(id, fault, events);
            }
        }
        self.combat_pass(&ids, events);
        self.construction_pass(&ids, events);
        self.production_pass(events);
        self.rebuild_threat();
    }

    /// Cell the unit's order still needs it to walk toward, if any.
    fn movement_goal(&self, unit: &Unit) -> Option<CellCoord> {
        match unit.order {
            UnitOrder::Idle => None,
            UnitOrder::Move { destination } => (unit.cell != destination).then_some(destination),
            UnitOrder::Construct { site } => (unit.cell.chebyshev_distance(site) > 1).then_some(site),
            UnitOrder::Attack { target } => {
                let t = self.units.get(&target)?;
                (!in_range(unit, t)).then_some(t.cell)
            }
        }
    }

    fn planning_pass(&mut self, ids: &[UnitId], events: &mut Vec<SimEventKind>) {
        let version = self.grid.structure_version();
        let mut budget = self.config.pathing.searches_per_frame;

        for &id in ids {
            let Some(unit) = self.units.get(&id) else {
                continue;
            };
            let goal = self.movement_goal(unit);
            let mid_step = unit.in_transit() || step_reserved(&self.grid, unit);

            let Some(unit) = self.units.get_mut(&id) else {
                continue;
            };
            if !unit.path.is_empty() && unit.path.structure_version != version {
                unit.path.stale = true;
            }
            if unit.path_delay > 0 {
                unit.path_delay -= 1;
            }
            let Some(goal) = goal else {
                continue;
            };
            let up_to_date = unit.path.goal == Some(goal) && !unit.path.stale && !unit.path.is_empty();
            if up_to_date || unit.path_delay > 0 || mid_step || budget == 0 {
                continue;
            }
            budget -= 1;

            let result = {
                let u = &*unit;
                let req = PathRequest {
                    unit: u.id,
                    owner: u.owner,
                    start: u.cell,
                    goal,
                    profile: &u.profile,
                    infantry: u.kind.is_infantry(),
                    can_demolish: u.can(CapabilitySet::COMBAT) && u.weapon.is_some(),
                };
                plan_path(&self.grid, &self.config.pathing, &req)
            };

            match result {
                Ok(planned) => {
                    debug!(
                        frame = self.frame,
                        unit = %id,
                        %goal,
                        cost = planned.cost,
                        strategy = ?planned.strategy,
                        expansions = planned.expansions,
                        "path planned"
                    );
                    unit.path = UnitPath {
                        steps: planned.steps.into(),
                        goal: Some(goal),
                        strategy: Some(planned.strategy),
                        structure_version: version,
                        stale: false,
                    };
                    unit.path_delay = self.config.pathing.recompute_delay;
                    unit.blocked_frames = 0;
                    unit.activity = Activity::Moving;
                }
                Err(reason) => {
                    debug!(frame = self.frame, unit = %id, %goal, ?reason, "path failed");
                    unit.path = UnitPath {
                        goal: Some(goal),
                        structure_version: version,
                        stale: true,
                        ..UnitPath::default()
                    };
                    unit.path_delay = self.config.pathing.retry_delay;
                    unit.activity = Activity::Stuck { reason };
                    if reason == PathFailure::Unreachable {
                        unit.order = UnitOrder::Idle;
                    }
                    events.push(SimEventKind::PathFailed { unit: id, reason });
                }
            }
        }
    }

    fn move_unit(&mut self, id: UnitId, events: &mut Vec<SimEventKind>) -> Result<(), UnitFault> {
        let Some(unit) = self.units.get(&id) else {
            return Ok(());
        };
        let front = unit.path.steps.front().copied();
        let reserved = step_reserved(&self.grid, unit);
        let hold = match unit.order {
            UnitOrder::Attack { target } => self.units.get(&target).is_some_and(|t| in_range(unit, t)),
            UnitOrder::Construct { site } => front == Some(site),
            UnitOrder::Idle | UnitOrder::Move { .. } => false,
        };
        let incoming_spot = match (unit.kind, front) {
            (UnitKind::Infantry { .. }, Some(next)) if !reserved => Some(self.free_spot_in(next, id)),
            _ => None,
        };

        let Some(unit) = self.units.get_mut(&id) else {
            return Ok(());
        };
        let grid = &mut self.grid;
        if hold && !reserved {
            unit.path.steps.clear();
        }

        let Some(&next) = unit.path.steps.front() else {
            let park = unit.parking_point(unit.cell);
            if unit.position != park {
                unit.position = step_toward(unit.position, park, unit.profile.speed);
                return Ok(());
            }
            match unit.order {
                UnitOrder::Move { destination } if destination == unit.cell => {
                    unit.order = UnitOrder::Idle;
                    unit.activity = Activity::Idle;
                    events.push(SimEventKind::UnitArrived {
                        unit: id,
                        cell: unit.cell,
                    });
                }
                UnitOrder::Idle if matches!(unit.activity, Activity::Moving | Activity::Waiting) => {
                    unit.activity = Activity::Idle;
                }
                _ => {}
            }
            return Ok(());
        };

        if !grid.in_bounds(next) {
            return Err(UnitFault::OffGrid { cell: next });
        }
        let Some(dir) = unit.cell.direction_to(next) else {
            return Err(UnitFault::DisjointPath { at: unit.cell, next });
        };
        let ground = unit.kind.occupies_ground();
        let infantry = unit.kind.is_infantry();

        if ground && !reserved {
            let Some(cell) = grid.cell(next) else {
                return Err(UnitFault::OffGrid { cell: next });
            };
            if let Some(obstacle) = cell.obstacle {
                let may_demolish = unit.path.strategy == Some(MovementStrategy::DestroyObstacles)
                    && obstacle.is_destructible()
                    && unit.weapon.is_some();
                if !may_demolish {
                    unit.path.steps.clear();
                    unit.path.stale = true;
                    unit.path_delay = 0;
                    unit.activity = Activity::Waiting;
                    return Ok(());
                }
                unit.activity = Activity::Demolishing { cell: next };
                unit.facing = unit.facing.turn_toward(dir.facing(), unit.profile.turn_rate);
                if unit.facing == dir.facing()
                    && unit.weapon_cooldown == 0
                    && let Some(weapon) = unit.weapon
                {
                    unit.weapon_cooldown = weapon.cooldown_frames;
                    if grid.damage_obstacle(next, weapon.damage) == ObstacleHit::Destroyed {
                        events.push(SimEventKind::ObstacleDestroyed { cell: next, by: id });
                    }
                }
                return Ok(());
            }

            let room = cell.has_room_for(infantry) && cell.reserved_by.is_none_or(|holder| holder == id);
            if !room {
                unit.blocked_frames = unit.blocked_frames.saturating_add(1);
                unit.activity = Activity::Waiting;
                let patience = if unit.path.strategy == Some(MovementStrategy::PushThrough) {
                    self.config.pathing.push_patience
                } else {
                    self.config.pathing.blocked_patience
                };
                if unit.blocked_frames > patience {
                    unit.blocked_frames = 0;
                    unit.path.steps.clear();
                    unit.path.stale = true;
                    unit.path_delay = 0;
                }
                return Ok(());
            }

            grid.reserve(next, id);
            grid.mark_moving(unit.cell, true);
            unit.blocked_frames = 0;
        }
        if let (UnitKind::Infantry { spot }, Some(s)) = (&mut unit.kind, incoming_spot) {
            *spot = s;
        }

        let want = dir.facing();
        unit.activity = Activity::Moving;
        if unit.facing != want {
            unit.facing = unit.facing.turn_toward(want, unit.profile.turn_rate);
            if unit.facing != want {
                return Ok(());
            }
        }

        let target = unit.parking_point(next);
        let speed = if dir.is_diagonal() {
            unit.profile.speed * 7 / 10
        } else {
            unit.profile.speed
        };
        unit.position = step_toward(unit.position, target, speed.max(1));
        if unit.position != target {
            return Ok(());
        }

        // Step complete: occupancy follows the unit.
        let from = unit.cell;
        if ground {
            grid.mark_moving(from, false);
            grid.vacate(from, infantry);
            grid.occupy(next, infantry);
            grid.release(next, id);
        }
        unit.cell = next;
        unit.path.steps.pop_front();
        if unit.path.stale {
            unit.path.steps.clear();
        }
        if let UnitOrder::Move { destination } = unit.order
            && destination == next
        {
            unit.order = UnitOrder::Idle;
            unit.path.clear();
            events.push(SimEventKind::UnitArrived { unit: id, cell: next });
        }
        if unit.path.is_empty() {
            unit.activity = Activity::Idle;
        }
        Ok(())
    }

    fn combat_pass(&mut self, ids: &[UnitId], events: &mut Vec<SimEventKind>) {
        let mut killed: Vec<(UnitId, UnitId)> = Vec::new();

        for &id in ids {
            let Some(unit) = self.units.get_mut(&id) else {
                continue;
            };
            unit.weapon_cooldown = unit.weapon_cooldown.saturating_sub(1);
            if unit.health == 0 {
                continue;
            }
            let (UnitOrder::Attack { target }, Some(weapon)) = (unit.order, unit.weapon) else {
                continue;
            };
            let ready = unit.weapon_cooldown == 0;

            let Some(attacker) = self.units.get(&id) else {
                continue;
            };
            let victim = self.units.get(&target).filter(|t| t.health > 0);
            let Some(victim) = victim else {
                if let Some(unit) = self.units.get_mut(&id) {
                    halt(&self.grid, unit);
                }
                continue;
            };
            if !ready || !in_range(attacker, victim) {
                continue;
            }
            let aim = attacker.cell.direction_to(victim.cell).map(Direction::facing);

            let jitter = i32::from(weapon.jitter);
            let roll = if jitter > 0 {
                self.rng.range_i32_inclusive(-jitter, jitter)
            } else {
                0
            };
            let damage = (i32::from(weapon.damage) + roll).clamp(1, i32::from(u16::MAX)) as u16;

            if let Some(unit) = self.units.get_mut(&id) {
                unit.weapon_cooldown = weapon.cooldown_frames;
                unit.activity = Activity::Firing;
                if let Some(facing) = aim {
                    unit.facing = facing;
                }
            }
            if let Some(victim) = self.units.get_mut(&target) {
                victim.health = victim.health.saturating_sub(damage);
                if victim.health == 0 {
                    killed.push((target, id));
                }
            }
        }

        for (victim, killer) in killed {
            if let Some(unit) = self.remove_unit(victim) {
                debug!(frame = self.frame, unit = %victim, by = %killer, "unit destroyed");
                events.push(SimEventKind::UnitDestroyed {
                    unit: victim,
                    owner: unit.owner,
                    by: Some(killer),
                });
            }
        }
    }

    fn construction_pass(&mut self, ids: &[UnitId], events: &mut Vec<SimEventKind>) {
        let frames = self.config.wall_build_frames;
        for &id in ids {
            let Some(unit) = self.units.get(&id) else {
                continue;
            };
            let UnitOrder::Construct { site } = unit.order else {
                continue;
            };
            if unit.cell.chebyshev_distance(site) != 1 || !unit.path.is_empty() || unit.in_transit() {
                continue;
            }
            let Some(cell) = self.grid.cell(site) else {
                continue;
            };
            let blocked = cell.obstacle.is_some();
            let vacant = cell.occupants == 0 && cell.reserved_by.is_none();

            let Some(unit) = self.units.get_mut(&id) else {
                continue;
            };
            if blocked {
                halt(&self.grid, unit);
                continue;
            }
            unit.activity = Activity::Building;
            unit.build_progress = unit.build_progress.saturating_add(1).min(frames);
            if unit.build_progress < frames || !vacant {
                continue;
            }
            unit.order = UnitOrder::Idle;
            unit.activity = Activity::Idle;
            unit.build_progress = 0;
            self.grid.place_obstacle(
                site,
                Obstacle::Wall {
                    hp: self.config.wall_hp,
                },
            );
            events.push(SimEventKind::WallBuilt { cell: site, by: id });
        }
    }

    fn production_pass(&mut self, events: &mut Vec<SimEventKind>) {
        let players: Vec<PlayerId> = self.players.keys().copied().collect();
        for player in players {
            let Some(state) = self.players.get_mut(&player) else {
                continue;
            };
            let rally = state.rally;
            let Some(item) = state.production.front_mut() else {
                continue;
            };
            item.remaining = item.remaining.saturating_sub(1);
            if item.remaining > 0 {
                continue;
            }
            let template = item.template.clone();
            match self.spawn_unit(player, &template, rally, events) {
                Ok(unit) => {
                    if let Some(state) = self.players.get_mut(&player) {
                        state.production.pop_front();
                    }
                    events.push(SimEventKind::ProductionComplete { player, unit });
                }
                // Rally area full; the finished unit waits in the queue.
                Err(reason) => debug!(frame = self.frame, %player, ?reason, "production blocked"),
            }
        }
    }

    fn rebuild_threat(&mut self) {
        self.grid.clear_threat();
        for unit in self.units.values() {
            if !unit.can(CapabilitySet::COMBAT) {
                continue;
            }
            let radius = self
                .config
                .templates
                .get(&unit.template)
                .map_or(0, |t| t.threat_radius);
            if radius > 0 {
                self.grid
                    .add_threat(unit.cell, unit.owner, radius, u16::from(radius) + 1);
            }
        }
    }
}

fn owned_unit(
    units: &mut BTreeMap<UnitId, Unit>,
    player: PlayerId,
    id: UnitId,
    capability: CapabilitySet,
) -> Result<&mut Unit, RejectReason> {
    let unit = units.get_mut(&id).ok_or(RejectReason::NoSuchUnit)?;
    if unit.owner != player {
        return Err(RejectReason::NotOwner);
    }
    if !unit.can(capability) {
        return Err(RejectReason::MissingCapability);
    }
    Ok(unit)
}

/// New order: replan at the next opportunity, finishing any step underway.
fn redirect(unit: &mut Unit) {
    unit.path.stale = true;
    unit.path_delay = 0;
    unit.blocked_frames = 0;
    unit.build_progress = 0;
}

/// Drop the order. A step already claimed is finished so occupancy stays
/// consistent.
fn halt(grid: &CellGrid, unit: &mut Unit) {
    let keep = if step_reserved(grid, unit) {
        unit.path.steps.front().copied()
    } else {
        None
    };
    unit.order = UnitOrder::Idle;
    unit.path.clear();
    unit.path.steps.extend(keep);
    unit.blocked_frames = 0;
    unit.build_progress = 0;
    if keep.is_none() {
        unit.activity = Activity::Idle;
    }
}

/// Whether the unit holds the reservation on its next path step.
fn step_reserved(grid: &CellGrid, unit: &Unit) -> bool {
    unit.path
        .steps
        .front()
        .and_then(|&c| grid.cell(c))
        .is_some_and(|cell| cell.reserved_by == Some(unit.id))
}

/// Give back a claimed step without taking it.
fn abandon_step(grid: &mut CellGrid, unit: &Unit) {
    if let Some(&next) = unit.path.steps.front()
        && step_reserved(grid, unit)
    {
        grid.release(next, unit.id);
        grid.mark_moving(unit.cell, false);
    }
}

fn in_range(attacker: &Unit, target: &Unit) -> bool {
    attacker.weapon.is_some_and(|w| {
        let range = i64::from(w.range);
        attacker.position.distance_squared(target.position) <= range * range
    })
}

/// Move up to `speed` leptons along each axis toward `target`.
fn step_toward(from: LeptonPos, target: LeptonPos, speed: i32) -> LeptonPos {
    LeptonPos::new(
        from.x + (target.x - from.x).clamp(-speed, speed),
        from.y + (target.y - from.y).clamp(-speed, speed),
    )
}
