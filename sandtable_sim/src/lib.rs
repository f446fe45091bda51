// sandtable_sim: pure Rust lockstep RTS core.
//
// Everything a peer needs to run a deterministic real-time-strategy match
// except the network: world state, the frame stepper, the path planner, the
// lockstep scheduler, and the integrity auditor. No sockets, no clocks, no
// threads; the relay crate moves bytes and a driver calls
// `LockstepSession::update()` once per frame interval.
//
// Module overview:
// - `types.rs`:       Cell/lepton coordinates, facing, ids, terrain, obstacles.
// - `config.rs`:      SessionConfig, PathingConfig, MapConfig, unit templates.
// - `unit.rs`:        Unit, UnitKind, orders, capabilities.
// - `grid.rs`:        CellGrid: terrain, obstacles, occupancy, reservations.
// - `pathfinding.rs`: Weighted A* with movement strategies and degradation.
// - `command.rs`:     SimAction, EventRecord, CommandSerializer, payload codec.
// - `event.rs`:       Narrative SimEvents emitted by each frame.
// - `scheduler.rs`:   LockstepScheduler: frame gating, stalls, departures.
// - `sim.rs`:         SimState and `step_frame`.
// - `checksum.rs`:    State checksum and IntegrityAuditor.
// - `snapshot.rs`:    Read-only WorldSnapshot for presentation.
// - `session.rs`:     LockstepSession: one peer's glue over all of the above.
// - `error.rs`:       StepError and SessionError.
// - `prng`:           Re-exported from `sandtable_prng` (xoshiro256++).
//
// **Critical constraint: determinism.** `step_frame` is a pure function of
// `(state, records)`. All randomness comes from the seeded `GameRng`. No
// `HashMap`, no system time, no floats in simulation state. Use `BTreeMap`
// for ordered collections.

pub mod checksum;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod grid;
pub mod pathfinding;
pub use sandtable_prng as prng;
pub mod scheduler;
pub mod session;
pub mod sim;
pub mod snapshot;
pub mod types;
pub mod unit;
