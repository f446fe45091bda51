// A* path planning over the cell grid, with movement strategies.
//
// A search runs under one `MovementStrategy`, which decides what counts as
// passable:
// - `CheapestAvoidAll`: obstacles and occupied cells are impassable.
// - `DestroyObstacles`: destructible walls are passable at the flat
//   `demolition` cost (the unit shoots its way through on arrival).
// - `PushThrough`: cells whose occupants are all mid-step are passable at
//   the flat `push_wait` cost (the unit waits for them to move on).
// A cell held by a parked unit is impassable under every strategy.
//
// `plan_path` runs every strategy that applies to the unit, in the
// configured priority order, and keeps the cheapest result. A later strategy
// only wins with a strictly lower cost, so equal costs go to the
// higher-priority strategy.
//
// Step cost for entering a cell:
//   weights.terrain * terrain_cost(profile, terrain)
//   + weights.threat * hostile influence
//   + weights.congestion * (occupants + foreign reservation)
//   + demolition | push_wait, when the strategy allowed the cell
// and diagonal steps pay 3/2 of that. The heuristic is octile distance at
// the profile's cheapest terrain, so it never overestimates and the first
// time the goal is popped the path is optimal for the strategy.
//
// Scores, parents and the closed set are `Vec`s indexed by flat cell index,
// allocated per search. The open set is a `BinaryHeap` with reversed
// ordering (min-heap) keyed by `(f, h, cell index)`, which is a total order,
// so ties resolve identically everywhere.
//
// Every search is bounded by `max_expansions` pops; exceeding it yields
// `PathFailure::Timeout`. A search that exhausts the open set fails with
// `BlockedTemporary` if some neighbour was rejected only because moving
// units stood in it, otherwise `Unreachable`.
//
// See also: `grid.rs` for passability and threat, `unit.rs` for
// `MovementProfile`, `sim.rs` for the planning pass that throttles calls.
//
// **Critical constraint: determinism.** Integer costs only, neighbours in
// `Direction::ALL` order, no hashing. The planner reads `&CellGrid` and never
// mutates it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PathingConfig;
use crate::grid::CellGrid;
use crate::types::*;
use crate::unit::MovementProfile;

/// Rule set for what a search may pass through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MovementStrategy {
    CheapestAvoidAll,
    DestroyObstacles,
    PushThrough,
}

/// Why no path was produced. Absorbed at the unit level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum PathFailure {
    #[error("destination unreachable")]
    Unreachable,
    #[error("search exceeded the expansion cap")]
    Timeout,
    #[error("route blocked by units")]
    BlockedTemporary,
}

/// One unit's planning request.
#[derive(Clone, Debug)]
pub struct PathRequest<'a> {
    pub unit: UnitId,
    pub owner: PlayerId,
    pub start: CellCoord,
    pub goal: CellCoord,
    pub profile: &'a MovementProfile,
    /// Infantry may share cells with other infantry.
    pub infantry: bool,
    /// Whether the unit can shoot walls down (needs the combat capability).
    pub can_demolish: bool,
}

impl PathRequest<'_> {
    fn airborne(&self) -> bool {
        self.profile.movement == MovementType::Air
    }
}

/// A successful plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedPath {
    /// Cells to enter, in order. Excludes the start cell.
    pub steps: Vec<CellCoord>,
    pub cost: u32,
    pub strategy: MovementStrategy,
    pub expansions: u32,
}

/// Strategies that can apply to this request, in priority order.
pub fn applicable_strategies(config: &PathingConfig, req: &PathRequest<'_>) -> Vec<MovementStrategy> {
    config
        .strategy_priority
        .iter()
        .copied()
        .filter(|s| match s {
            // Aircraft ignore obstacles and occupancy; the alternatives
            // would only duplicate the first search.
            MovementStrategy::CheapestAvoidAll => true,
            MovementStrategy::DestroyObstacles => !req.airborne() && req.can_demolish,
            MovementStrategy::PushThrough => !req.airborne(),
        })
        .collect()
}

/// Plan under every applicable strategy and keep the cheapest.
pub fn plan_path(
    grid: &CellGrid,
    config: &PathingConfig,
    req: &PathRequest<'_>,
) -> Result<PlannedPath, PathFailure> {
    let mut best: Option<PlannedPath> = None;
    let mut failure: Option<PathFailure> = None;
    let strategies = applicable_strategies(config, req);
    if strategies.is_empty() {
        // Priority list without CheapestAvoidAll and nothing else applies.
        return Err(PathFailure::Unreachable);
    }
    for strategy in strategies {
        match search(grid, config, req, strategy) {
            Ok(path) => {
                if best.as_ref().is_none_or(|b| path.cost < b.cost) {
                    best = Some(path);
                }
            }
            Err(f) => failure = Some(worse_failure(failure, f)),
        }
    }
    best.ok_or(failure.unwrap_or(PathFailure::Unreachable))
}

/// Blocked-temporary is the most hopeful failure (retry soon), so it wins
/// over timeout, which wins over unreachable.
fn worse_failure(current: Option<PathFailure>, new: PathFailure) -> PathFailure {
    fn rank(f: PathFailure) -> u8 {
        match f {
            PathFailure::BlockedTemporary => 2,
            PathFailure::Timeout => 1,
            PathFailure::Unreachable => 0,
        }
    }
    match current {
        Some(c) if rank(c) >= rank(new) => c,
        _ => new,
    }
}

/// A* under a single strategy.
pub fn search(
    grid: &CellGrid,
    config: &PathingConfig,
    req: &PathRequest<'_>,
    strategy: MovementStrategy,
) -> Result<PlannedPath, PathFailure> {
    run_search(grid, config, req, strategy, true)
}

/// Entry in the open set (min-heap via reversed ordering).
#[derive(PartialEq, Eq)]
struct OpenEntry {
    f: u32,
    h: u32,
    index: u32,
}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: smallest (f, h, index) is the heap maximum.
        other
            .f
            .cmp(&self.f)
            .then_with(|| other.h.cmp(&self.h))
            .then_with(|| other.index.cmp(&self.index))
    }
}

const NO_PARENT: u32 = u32::MAX;

fn run_search(
    grid: &CellGrid,
    config: &PathingConfig,
    req: &PathRequest<'_>,
    strategy: MovementStrategy,
    use_heuristic: bool,
) -> Result<PlannedPath, PathFailure> {
    let (Some(start_idx), Some(goal_idx)) = (grid.index(req.start), grid.index(req.goal)) else {
        return Err(PathFailure::Unreachable);
    };
    if start_idx == goal_idx {
        return Ok(PlannedPath {
            steps: Vec::new(),
            cost: 0,
            strategy,
            expansions: 0,
        });
    }
    if !goal_statically_reachable(grid, req, strategy) {
        return Err(PathFailure::Unreachable);
    }

    let weights = &config.weights;
    let straight = weights.terrain.saturating_mul(req.profile.min_terrain_cost());
    let diagonal = straight * DIAGONAL_NUM / DIAGONAL_DEN;
    let heuristic = |c: CellCoord| -> u32 {
        if !use_heuristic {
            return 0;
        }
        let dx = (c.x - req.goal.x).unsigned_abs();
        let dy = (c.y - req.goal.y).unsigned_abs();
        let (lo, hi) = if dx < dy { (dx, dy) } else { (dy, dx) };
        straight.saturating_mul(hi - lo).saturating_add(diagonal.saturating_mul(lo))
    };

    let n = grid.len();
    let mut g = vec![u32::MAX; n];
    let mut parent = vec![NO_PARENT; n];
    let mut closed = vec![false; n];
    let mut open = BinaryHeap::new();
    let mut blocked_by_units = false;
    let mut expansions = 0u32;

    g[start_idx] = 0;
    let h0 = heuristic(req.start);
    open.push(OpenEntry {
        f: h0,
        h: h0,
        index: start_idx as u32,
    });

    while let Some(OpenEntry { index, .. }) = open.pop() {
        let current = index as usize;
        if closed[current] {
            continue;
        }
        if current == goal_idx {
            return Ok(PlannedPath {
                steps: reconstruct(grid, &parent, start_idx, goal_idx),
                cost: g[goal_idx],
                strategy,
                expansions,
            });
        }
        if expansions >= config.max_expansions {
            return Err(PathFailure::Timeout);
        }
        expansions += 1;
        closed[current] = true;

        let here = grid.coord_of(current);
        for dir in Direction::ALL {
            let next = here.step(dir);
            let Some(next_idx) = grid.index(next) else {
                continue;
            };
            if closed[next_idx] {
                continue;
            }
            let Some(step) = step_cost(grid, config, req, strategy, here, dir, next_idx, &mut blocked_by_units)
            else {
                continue;
            };
            let tentative = g[current].saturating_add(step);
            if tentative < g[next_idx] {
                g[next_idx] = tentative;
                parent[next_idx] = current as u32;
                let h = heuristic(next);
                open.push(OpenEntry {
                    f: tentative.saturating_add(h),
                    h,
                    index: next_idx as u32,
                });
            }
        }
    }

    Err(if blocked_by_units {
        PathFailure::BlockedTemporary
    } else {
        PathFailure::Unreachable
    })
}

/// Reject goals no amount of searching can enter.
fn goal_statically_reachable(grid: &CellGrid, req: &PathRequest<'_>, strategy: MovementStrategy) -> bool {
    let Some(cell) = grid.cell(req.goal) else {
        return false;
    };
    if req.profile.terrain_cost(cell.terrain).is_none() {
        return false;
    }
    match cell.obstacle {
        None => true,
        Some(_) if req.airborne() => true,
        Some(obstacle) => strategy == MovementStrategy::DestroyObstacles && obstacle.is_destructible(),
    }
}

/// Cost of stepping from `from` in `dir` into the cell at `next_idx`, or
/// `None` if the strategy forbids it. Sets `blocked_by_units` when the only
/// reason for refusing was units that are on their way out.
#[allow(clippy::too_many_arguments)]
fn step_cost(
    grid: &CellGrid,
    config: &PathingConfig,
    req: &PathRequest<'_>,
    strategy: MovementStrategy,
    from: CellCoord,
    dir: Direction,
    next_idx: usize,
    blocked_by_units: &mut bool,
) -> Option<u32> {
    let weights = &config.weights;
    let cell = grid.cell_at(next_idx);
    let terrain = req.profile.terrain_cost(cell.terrain)?;
    let mut extra = 0u32;
    let mut congestion = 0u32;

    if !req.airborne() {
        if dir.is_diagonal() {
            // No squeezing between two blocked orthogonal neighbours' corners.
            let (dx, dy) = dir.offset();
            let side_a = CellCoord::new(from.x + dx, from.y);
            let side_b = CellCoord::new(from.x, from.y + dy);
            if !grid.statically_passable(side_a, req.profile.movement)
                || !grid.statically_passable(side_b, req.profile.movement)
            {
                return None;
            }
        }
        if let Some(obstacle) = cell.obstacle {
            if strategy == MovementStrategy::DestroyObstacles && obstacle.is_destructible() {
                extra = extra.saturating_add(weights.demolition);
            } else {
                return None;
            }
        }
        if !cell.has_room_for(req.infantry) {
            if !cell.is_temporarily_blocked() {
                return None;
            }
            if strategy == MovementStrategy::PushThrough {
                extra = extra.saturating_add(weights.push_wait);
            } else {
                *blocked_by_units = true;
                return None;
            }
        }
        congestion += u32::from(cell.occupants);
        if cell.reserved_by.is_some_and(|holder| holder != req.unit) {
            congestion += 1;
        }
    }

    let threat = grid.hostile_threat(next_idx, req.owner);
    let step = weights
        .terrain
        .saturating_mul(terrain)
        .saturating_add(weights.threat.saturating_mul(threat))
        .saturating_add(weights.congestion.saturating_mul(congestion))
        .saturating_add(extra);
    Some(if dir.is_diagonal() {
        step.saturating_mul(DIAGONAL_NUM) / DIAGONAL_DEN
    } else {
        step
    })
}

fn reconstruct(grid: &CellGrid, parent: &[u32], start: usize, goal: usize) -> Vec<CellCoord> {
    let mut steps = Vec::new();
    let mut at = goal;
    while at != start {
        steps.push(grid.coord_of(at));
        at = parent[at] as usize;
    }
    steps.reverse();
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn foot() -> MovementProfile {
        MovementProfile {
            movement: MovementType::Foot,
            speed: 16,
            turn_rate: 32,
            sub_cell: false,
            terrain_affinity: [100; 5],
        }
    }

    fn request(profile: &MovementProfile, start: CellCoord, goal: CellCoord) -> PathRequest<'_> {
        PathRequest {
            unit: UnitId(1),
            owner: PlayerId(0),
            start,
            goal,
            profile,
            infantry: false,
            can_demolish: true,
        }
    }

    fn assert_walkable(grid: &CellGrid, start: CellCoord, steps: &[CellCoord]) {
        let mut at = start;
        for &s in steps {
            assert_eq!(at.chebyshev_distance(s), 1, "non-adjacent step {at} -> {s}");
            assert!(grid.in_bounds(s));
            at = s;
        }
    }

    #[test]
    fn straight_line_on_open_grid() {
        let grid = CellGrid::new(8, 8);
        let p = foot();
        let path = plan_path(
            &grid,
            &PathingConfig::default(),
            &request(&p, CellCoord::new(0, 0), CellCoord::new(5, 0)),
        )
        .unwrap();
        assert_eq!(path.steps.len(), 5);
        assert_eq!(path.cost, 50);
        assert_eq!(path.strategy, MovementStrategy::CheapestAvoidAll);
    }

    #[test]
    fn diagonal_costs_three_halves() {
        let grid = CellGrid::new(8, 8);
        let p = foot();
        let path = plan_path(
            &grid,
            &PathingConfig::default(),
            &request(&p, CellCoord::new(0, 0), CellCoord::new(5, 5)),
        )
        .unwrap();
        assert_eq!(path.steps.len(), 5);
        assert_eq!(path.cost, 75);
        assert_eq!(path.steps.last(), Some(&CellCoord::new(5, 5)));
    }

    #[test]
    fn wall_on_diagonal_is_avoided() {
        let mut grid = CellGrid::new(8, 8);
        grid.place_obstacle(CellCoord::new(3, 3), Obstacle::Wall { hp: 100 });
        let p = foot();
        let config = PathingConfig {
            strategy_priority: vec![MovementStrategy::CheapestAvoidAll],
            ..PathingConfig::default()
        };
        let path = plan_path(&grid, &config, &request(&p, CellCoord::new(0, 0), CellCoord::new(5, 5))).unwrap();
        assert!(!path.steps.contains(&CellCoord::new(3, 3)));
        assert_walkable(&grid, CellCoord::new(0, 0), &path.steps);
        assert_eq!(path.steps.last(), Some(&CellCoord::new(5, 5)));
    }

    #[test]
    fn sealed_goal_is_unreachable_without_demolition() {
        let mut grid = CellGrid::new(7, 7);
        for dir in Direction::ALL {
            grid.place_obstacle(CellCoord::new(3, 3).step(dir), Obstacle::Wall { hp: 50 });
        }
        let p = foot();
        let config = PathingConfig {
            strategy_priority: vec![MovementStrategy::CheapestAvoidAll, MovementStrategy::PushThrough],
            ..PathingConfig::default()
        };
        let req = request(&p, CellCoord::new(0, 0), CellCoord::new(3, 3));
        assert_eq!(plan_path(&grid, &config, &req), Err(PathFailure::Unreachable));

        let with_demolition = PathingConfig::default();
        let path = plan_path(&grid, &with_demolition, &req).unwrap();
        assert_eq!(path.strategy, MovementStrategy::DestroyObstacles);
        assert!(path.cost >= with_demolition.weights.demolition);
    }

    #[test]
    fn demolition_not_offered_to_unarmed_units() {
        let p = foot();
        let mut req = request(&p, CellCoord::new(0, 0), CellCoord::new(1, 1));
        req.can_demolish = false;
        let strategies = applicable_strategies(&PathingConfig::default(), &req);
        assert!(!strategies.contains(&MovementStrategy::DestroyObstacles));
    }

    #[test]
    fn rock_goal_is_unreachable_under_every_strategy() {
        let mut grid = CellGrid::new(4, 4);
        grid.place_obstacle(CellCoord::new(2, 2), Obstacle::Rock);
        let p = foot();
        let req = request(&p, CellCoord::new(0, 0), CellCoord::new(2, 2));
        assert_eq!(
            plan_path(&grid, &PathingConfig::default(), &req),
            Err(PathFailure::Unreachable)
        );
    }

    #[test]
    fn corridor_with_parked_unit_is_unreachable() {
        // Single-row corridor with a parked tank in the middle.
        let mut grid = CellGrid::new(5, 1);
        grid.occupy(CellCoord::new(2, 0), false);
        let p = foot();
        let req = request(&p, CellCoord::new(0, 0), CellCoord::new(4, 0));
        let config = PathingConfig::default();
        for strategy in [
            MovementStrategy::CheapestAvoidAll,
            MovementStrategy::DestroyObstacles,
            MovementStrategy::PushThrough,
        ] {
            assert_eq!(
                search(&grid, &config, &req, strategy),
                Err(PathFailure::Unreachable),
                "{strategy:?}"
            );
        }
        assert_eq!(plan_path(&grid, &config, &req), Err(PathFailure::Unreachable));
    }

    #[test]
    fn parked_unit_is_routed_around_even_when_pushing() {
        let mut grid = CellGrid::new(5, 3);
        grid.occupy(CellCoord::new(2, 1), false);
        let p = foot();
        let req = request(&p, CellCoord::new(0, 1), CellCoord::new(4, 1));
        let path = search(&grid, &PathingConfig::default(), &req, MovementStrategy::PushThrough).unwrap();
        assert!(!path.steps.contains(&CellCoord::new(2, 1)), "{:?}", path.steps);
        assert_eq!(path.steps.last(), Some(&CellCoord::new(4, 1)));
    }

    #[test]
    fn corridor_with_moving_unit_is_temporary() {
        // Same corridor, but the tank is mid-step.
        let mut grid = CellGrid::new(5, 1);
        grid.occupy(CellCoord::new(2, 0), false);
        grid.mark_moving(CellCoord::new(2, 0), true);
        let p = foot();
        let avoid_only = PathingConfig {
            strategy_priority: vec![MovementStrategy::CheapestAvoidAll],
            ..PathingConfig::default()
        };
        let req = request(&p, CellCoord::new(0, 0), CellCoord::new(4, 0));
        assert_eq!(plan_path(&grid, &avoid_only, &req), Err(PathFailure::BlockedTemporary));

        // Push-through accepts the wait cost.
        let path = plan_path(&grid, &PathingConfig::default(), &req).unwrap();
        assert_eq!(path.strategy, MovementStrategy::PushThrough);
        let config = PathingConfig::default();
        let expected = 40 + config.weights.push_wait + config.weights.congestion;
        assert_eq!(path.cost, expected);
    }

    #[test]
    fn equal_costs_go_to_priority_order() {
        // Nothing in the way: every strategy finds the same cost.
        let grid = CellGrid::new(6, 6);
        let p = foot();
        let req = request(&p, CellCoord::new(0, 0), CellCoord::new(4, 2));
        let mut config = PathingConfig::default();
        config.strategy_priority = vec![
            MovementStrategy::PushThrough,
            MovementStrategy::CheapestAvoidAll,
            MovementStrategy::DestroyObstacles,
        ];
        assert_eq!(plan_path(&grid, &config, &req).unwrap().strategy, MovementStrategy::PushThrough);
        config.strategy_priority.swap(0, 1);
        assert_eq!(
            plan_path(&grid, &config, &req).unwrap().strategy,
            MovementStrategy::CheapestAvoidAll
        );
    }

    #[test]
    fn expansion_cap_yields_timeout() {
        let grid = CellGrid::new(64, 64);
        let p = foot();
        let config = PathingConfig {
            max_expansions: 10,
            ..PathingConfig::default()
        };
        let req = request(&p, CellCoord::new(0, 0), CellCoord::new(63, 40));
        assert_eq!(plan_path(&grid, &config, &req), Err(PathFailure::Timeout));
    }

    #[test]
    fn threat_bends_the_route() {
        let mut grid = CellGrid::new(9, 5);
        // Enemy influence sits on the straight line along y = 2.
        grid.add_threat(CellCoord::new(4, 2), PlayerId(1), 1, 40);
        let p = foot();
        let req = request(&p, CellCoord::new(0, 2), CellCoord::new(8, 2));
        let path = plan_path(&grid, &PathingConfig::default(), &req).unwrap();
        assert!(
            !path.steps.contains(&CellCoord::new(4, 2)),
            "route should skirt the threat: {:?}",
            path.steps
        );
        let mut calm = PathingConfig::default();
        calm.weights.threat = 0;
        let straight = plan_path(&grid, &calm, &req).unwrap();
        assert!(straight.steps.contains(&CellCoord::new(4, 2)));
    }

    #[test]
    fn no_corner_cutting_past_walls() {
        let mut grid = CellGrid::new(3, 3);
        grid.place_obstacle(CellCoord::new(1, 0), Obstacle::Rock);
        let p = foot();
        let req = request(&p, CellCoord::new(0, 0), CellCoord::new(1, 1));
        let path = plan_path(&grid, &PathingConfig::default(), &req).unwrap();
        assert_eq!(path.steps, vec![CellCoord::new(0, 1), CellCoord::new(1, 1)]);
    }

    #[test]
    fn aircraft_fly_over_everything() {
        let mut grid = CellGrid::new(5, 1);
        grid.place_obstacle(CellCoord::new(1, 0), Obstacle::Rock);
        grid.set_terrain(CellCoord::new(2, 0), Terrain::Water);
        grid.occupy(CellCoord::new(3, 0), false);
        let mut p = foot();
        p.movement = MovementType::Air;
        let req = request(&p, CellCoord::new(0, 0), CellCoord::new(4, 0));
        let path = plan_path(&grid, &PathingConfig::default(), &req).unwrap();
        assert_eq!(path.steps.len(), 4);
        assert_eq!(path.strategy, MovementStrategy::CheapestAvoidAll);
    }

    #[test]
    fn identical_inputs_identical_paths() {
        let mut grid = CellGrid::new(16, 16);
        for y in 2..14 {
            grid.place_obstacle(CellCoord::new(8, y), Obstacle::Wall { hp: 10 });
        }
        let p = foot();
        let req = request(&p, CellCoord::new(1, 8), CellCoord::new(14, 8));
        let a = plan_path(&grid, &PathingConfig::default(), &req).unwrap();
        let b = plan_path(&grid.clone(), &PathingConfig::default(), &req).unwrap();
        assert_eq!(a, b);
    }

    fn grid_from_mask(width: u32, mask: &[bool]) -> CellGrid {
        let height = mask.len() as u32 / width;
        let mut grid = CellGrid::new(width, height);
        for (i, &wall) in mask.iter().enumerate() {
            if wall {
                grid.place_obstacle(grid.coord_of(i), Obstacle::Rock);
            }
        }
        grid
    }

    proptest! {
        #[test]
        fn astar_matches_dijkstra_cost(
            mask in proptest::collection::vec(proptest::bool::weighted(0.25), 100),
            start in 0usize..100,
            goal in 0usize..100,
        ) {
            let mut mask = mask;
            mask[start] = false;
            mask[goal] = false;
            let grid = grid_from_mask(10, &mask);
            let p = foot();
            let req = request(&p, grid.coord_of(start), grid.coord_of(goal));
            let config = PathingConfig::default();
            let astar = run_search(&grid, &config, &req, MovementStrategy::CheapestAvoidAll, true);
            let dijkstra = run_search(&grid, &config, &req, MovementStrategy::CheapestAvoidAll, false);
            match (astar, dijkstra) {
                (Ok(a), Ok(d)) => {
                    prop_assert_eq!(a.cost, d.cost);
                    let mut at = req.start;
                    for s in &a.steps {
                        prop_assert_eq!(at.chebyshev_distance(*s), 1);
                        prop_assert!(grid.statically_passable(*s, MovementType::Foot));
                        at = *s;
                    }
                    prop_assert_eq!(at, req.goal);
                }
                (Err(a), Err(d)) => prop_assert_eq!(a, d),
                (a, d) => prop_assert!(false, "A* {:?} vs Dijkstra {:?}", a, d),
            }
        }

        #[test]
        fn expansions_never_exceed_cap(
            cap in 1u32..60,
            gx in 0i32..20,
            gy in 0i32..20,
        ) {
            let grid = CellGrid::new(20, 20);
            let p = foot();
            let config = PathingConfig { max_expansions: cap, ..PathingConfig::default() };
            let req = request(&p, CellCoord::new(0, 0), CellCoord::new(gx, gy));
            match search(&grid, &config, &req, MovementStrategy::CheapestAvoidAll) {
                Ok(path) => prop_assert!(path.expansions <= cap),
                Err(f) => prop_assert_eq!(f, PathFailure::Timeout),
            }
        }
    }
}
