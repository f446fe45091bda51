//! Criterion benchmarks for the path planner and the frame stepper.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use sandtable_sim::command::{EventRecord, SimAction};
use sandtable_sim::config::{MapConfig, PathingConfig, SessionConfig};
use sandtable_sim::grid::CellGrid;
use sandtable_sim::pathfinding::{PathRequest, plan_path};
use sandtable_sim::sim::SimState;
use sandtable_sim::types::{CellCoord, MovementType, Obstacle, PlayerId, UnitId};
use sandtable_sim::unit::MovementProfile;

/// 96x96 grid with a deterministic scatter of rocks and wall segments.
fn cluttered_grid() -> CellGrid {
    let mut grid = CellGrid::new(96, 96);
    for i in 0u64..1400 {
        let x = (i.wrapping_mul(6364136223846793007) >> 33) % 96;
        let y = (i.wrapping_mul(1442695040888963407) >> 33) % 96;
        let c = CellCoord::new(x as i32, y as i32);
        if c == CellCoord::new(1, 1) || c == CellCoord::new(94, 94) {
            continue;
        }
        let obstacle = if i % 3 == 0 {
            Obstacle::Wall { hp: 200 }
        } else {
            Obstacle::Rock
        };
        grid.place_obstacle(c, obstacle);
    }
    grid
}

fn bench_plan_corner_to_corner(c: &mut Criterion) {
    let grid = cluttered_grid();
    let config = PathingConfig::default();
    let profile = MovementProfile {
        movement: MovementType::Track,
        speed: 24,
        turn_rate: 16,
        sub_cell: false,
        terrain_affinity: [100; 5],
    };
    let req = PathRequest {
        unit: UnitId(1),
        owner: PlayerId(0),
        start: CellCoord::new(1, 1),
        goal: CellCoord::new(94, 94),
        profile: &profile,
        infantry: false,
        can_demolish: true,
    };

    c.bench_function("plan_path_96x96_all_strategies", |b| {
        b.iter(|| black_box(plan_path(&grid, &config, &req)));
    });
}

/// Forty tanks crossing an open map, stepped frame by frame.
fn bench_step_frames(c: &mut Criterion) {
    let config = SessionConfig {
        map: MapConfig::open(64, 64),
        ..SessionConfig::default()
    };
    let players = [PlayerId(0), PlayerId(1)];
    let mut base = SimState::new(config, &players, 42).expect("valid config");

    let mut records = Vec::new();
    for i in 0..40u64 {
        let owner = players[(i % 2) as usize];
        let x = (i % 20) as i32 * 3 + 1;
        let y = if owner == PlayerId(0) { 2 } else { 61 };
        records.push(EventRecord {
            participant: owner,
            frame: 0,
            sequence: i,
            action: SimAction::Spawn {
                template: "tank".into(),
                cell: CellCoord::new(x, y),
            },
        });
    }
    records.sort_by_key(EventRecord::order_key);
    base.step_frame(&records).expect("frame 0");

    let mut orders = Vec::new();
    for (seq, unit) in base.units.values().enumerate() {
        let y = if unit.owner == PlayerId(0) { 61 } else { 2 };
        orders.push(EventRecord {
            participant: unit.owner,
            frame: 1,
            sequence: 100 + seq as u64,
            action: SimAction::Move {
                unit: unit.id,
                destination: CellCoord::new(unit.cell.x, y),
            },
        });
    }
    orders.sort_by_key(EventRecord::order_key);
    base.step_frame(&orders).expect("frame 1");

    c.bench_function("step_100_frames_40_units", |b| {
        b.iter(|| {
            let mut sim = base.clone();
            for _ in 0..100 {
                black_box(sim.step_frame(&[]).expect("empty frame"));
            }
            black_box(sim.checksum())
        });
    });
}

criterion_group!(benches, bench_plan_corner_to_corner, bench_step_frames);
criterion_main!(benches);
