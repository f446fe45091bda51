// Read-only world snapshot for the rendering/UI boundary.
//
// Built by `SimState::snapshot()` after a frame executes. It is a plain
// owned copy, so a presentation layer can hold it across frames or ship it
// to another thread without borrowing the engine. Nothing flows back: the
// only way to change the world is an event record through the scheduler.
//
// See also: `sim.rs` for `SimState::snapshot`.

use serde::{Deserialize, Serialize};

use crate::types::*;
use crate::unit::{Activity, UnitKindTag};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    /// Next frame the engine will execute.
    pub frame: u64,
    pub width: u32,
    pub height: u32,
    pub obstacles: Vec<(CellCoord, Obstacle)>,
    /// Ascending id order.
    pub units: Vec<UnitView>,
    pub players: Vec<PlayerView>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitView {
    pub id: UnitId,
    pub owner: PlayerId,
    pub template: String,
    pub kind: UnitKindTag,
    pub position: LeptonPos,
    pub cell: CellCoord,
    pub facing: Facing,
    pub health: u16,
    pub max_health: u16,
    pub activity: Activity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerView {
    pub id: PlayerId,
    pub credits: u32,
    pub queued: Vec<String>,
    pub rally: CellCoord,
}

impl WorldSnapshot {
    pub fn unit(&self, id: UnitId) -> Option<&UnitView> {
        self.units
            .binary_search_by_key(&id, |u| u.id)
            .ok()
            .map(|i| &self.units[i])
    }

    /// Units owned by `player`, in id order.
    pub fn units_of(&self, player: PlayerId) -> impl Iterator<Item = &UnitView> {
        self.units.iter().filter(move |u| u.owner == player)
    }
}
