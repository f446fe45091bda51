// Narrative simulation events: the UI-facing record of what happened.
//
// The engine returns a `Vec<SimEvent>` from every frame. Events are output
// only; nothing in the simulation reads them back, and they are not part of
// the checksum. A renderer or event log consumes them alongside the
// read-only world snapshot.
//
// See also: `sim.rs` where each event is emitted.
//
// **Critical constraint: determinism.** Events are produced in engine order,
// so two peers emit the same list for the same frame. That makes them handy
// for diffing divergent runs, but they must never feed back into state.

use serde::{Deserialize, Serialize};

use crate::pathfinding::PathFailure;
use crate::types::*;

/// Something that happened during a frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimEvent {
    pub frame: u64,
    pub kind: SimEventKind,
}

/// Why a command was ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    NoSuchUnit,
    NotOwner,
    UnknownTemplate,
    InsufficientCredits,
    OutOfBounds,
    MissingCapability,
    InvalidTarget,
}

/// Why a unit's update was abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitFault {
    /// Next path step is not adjacent to the unit's cell.
    DisjointPath { at: CellCoord, next: CellCoord },
    /// Path leads off the grid.
    OffGrid { cell: CellCoord },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimEventKind {
    UnitSpawned {
        unit: UnitId,
        owner: PlayerId,
        template: String,
        cell: CellCoord,
    },
    UnitDestroyed {
        unit: UnitId,
        owner: PlayerId,
        by: Option<UnitId>,
    },
    UnitSold {
        unit: UnitId,
        owner: PlayerId,
        refund: u32,
    },
    UnitArrived {
        unit: UnitId,
        cell: CellCoord,
    },
    PathFailed {
        unit: UnitId,
        reason: PathFailure,
    },
    /// A unit's update failed and it was reset to idle.
    UnitDegraded {
        unit: UnitId,
        fault: UnitFault,
    },
    ObstacleDestroyed {
        cell: CellCoord,
        by: UnitId,
    },
    WallBuilt {
        cell: CellCoord,
        by: UnitId,
    },
    ProductionQueued {
        player: PlayerId,
        template: String,
    },
    ProductionComplete {
        player: PlayerId,
        unit: UnitId,
    },
    CommandRejected {
        player: PlayerId,
        sequence: u64,
        reason: RejectReason,
    },
}
