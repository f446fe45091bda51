// Event records and the command serializer.
//
// Every mutation a player (or a scripted trigger) wants to make enters the
// simulation as an `EventRecord`: who issued it, which frame it executes on,
// its per-participant sequence number, and the `SimAction` itself. Records
// are immutable once created and uniquely identified by
// `(participant, sequence)`, which is also the canonical order the
// scheduler sorts a frame's records into.
//
// `CommandSerializer` is the only place records are minted. It stamps each
// action with the next sequence number and a target frame of
// `current_frame + latency_window`, giving the network time to deliver the
// record to every peer before anyone needs it. The serializer never touches
// world state.
//
// On the wire a record travels as a `WireCommand`: the numeric
// `CommandType`, the sequence, and the JSON-encoded action. The participant
// and frame come from the enclosing `FrameInput`.
//
// See also: `scheduler.rs` which orders records per frame, `sim.rs` for
// `SimState::apply_command` which executes them.
//
// **Critical constraint: determinism.** Records are the sole external input
// to the simulation. The numeric command types are part of the wire format;
// never renumber them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::*;

/// A canonical, immutable command bound to a frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub participant: PlayerId,
    pub frame: u64,
    pub sequence: u64,
    pub action: SimAction,
}

impl EventRecord {
    pub fn command_type(&self) -> CommandType {
        self.action.command_type()
    }

    /// Canonical total order within a frame.
    pub fn order_key(&self) -> (PlayerId, u64) {
        (self.participant, self.sequence)
    }
}

/// What a command does.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimAction {
    Move { unit: UnitId, destination: CellCoord },
    Stop { unit: UnitId },
    Attack { unit: UnitId, target: UnitId },
    /// Walk next to `site` and build a wall on it.
    Construct { unit: UnitId, site: CellCoord },
    /// Queue a unit from the named template at the player's rally cell.
    Produce { template: String },
    SetRally { cell: CellCoord },
    Sell { unit: UnitId },
    /// Place a unit immediately, free of charge. Scenario and trigger
    /// scripts use this; it still goes through the scheduler like any other
    /// record.
    Spawn { template: String, cell: CellCoord },
}

/// Numeric tag of a `SimAction` variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum CommandType {
    Move = 1,
    Stop = 2,
    Attack = 3,
    Construct = 4,
    Produce = 5,
    SetRally = 6,
    Sell = 7,
    Spawn = 8,
}

impl CommandType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            1 => CommandType::Move,
            2 => CommandType::Stop,
            3 => CommandType::Attack,
            4 => CommandType::Construct,
            5 => CommandType::Produce,
            6 => CommandType::SetRally,
            7 => CommandType::Sell,
            8 => CommandType::Spawn,
            _ => return None,
        })
    }
}

impl SimAction {
    pub fn command_type(&self) -> CommandType {
        match self {
            SimAction::Move { .. } => CommandType::Move,
            SimAction::Stop { .. } => CommandType::Stop,
            SimAction::Attack { .. } => CommandType::Attack,
            SimAction::Construct { .. } => CommandType::Construct,
            SimAction::Produce { .. } => CommandType::Produce,
            SimAction::SetRally { .. } => CommandType::SetRally,
            SimAction::Sell { .. } => CommandType::Sell,
            SimAction::Spawn { .. } => CommandType::Spawn,
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandDecodeError {
    #[error("unknown command type {0}")]
    UnknownType(u16),
    #[error("payload does not decode: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("payload is a {actual:?} but was tagged {declared:?}")]
    TypeMismatch {
        declared: CommandType,
        actual: CommandType,
    },
}

/// Serialize an action into a wire payload.
pub fn encode_action(action: &SimAction) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(action)
}

/// Decode a wire payload, checking it against its declared type.
pub fn decode_action(command_type: u16, payload: &[u8]) -> Result<SimAction, CommandDecodeError> {
    let declared = CommandType::from_u16(command_type).ok_or(CommandDecodeError::UnknownType(command_type))?;
    let action: SimAction = serde_json::from_slice(payload)?;
    let actual = action.command_type();
    if actual != declared {
        return Err(CommandDecodeError::TypeMismatch { declared, actual });
    }
    Ok(action)
}

/// Mints event records for one participant.
#[derive(Clone, Debug)]
pub struct CommandSerializer {
    participant: PlayerId,
    latency_window: u64,
    next_sequence: u64,
}

impl CommandSerializer {
    pub fn new(participant: PlayerId, latency_window: u64) -> Self {
        Self {
            participant,
            latency_window,
            next_sequence: 0,
        }
    }

    pub fn participant(&self) -> PlayerId {
        self.participant
    }

    pub fn latency_window(&self) -> u64 {
        self.latency_window
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Frame that an action issued during `current_frame` executes on.
    pub fn target_frame(&self, current_frame: u64) -> u64 {
        current_frame + self.latency_window
    }

    /// Wrap `action` in a record for `current_frame + latency_window`.
    pub fn issue(&mut self, action: SimAction, current_frame: u64) -> EventRecord {
        let record = EventRecord {
            participant: self.participant,
            frame: self.target_frame(current_frame),
            sequence: self.next_sequence,
            action,
        };
        self.next_sequence += 1;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializer_stamps_sequence_and_latency() {
        let mut ser = CommandSerializer::new(PlayerId(1), 2);
        let a = ser.issue(SimAction::Stop { unit: UnitId(4) }, 10);
        let b = ser.issue(SimAction::Stop { unit: UnitId(5) }, 10);
        let c = ser.issue(SimAction::Stop { unit: UnitId(6) }, 11);
        assert_eq!((a.frame, a.sequence), (12, 0));
        assert_eq!((b.frame, b.sequence), (12, 1));
        assert_eq!((c.frame, c.sequence), (13, 2));
        assert!(a.order_key() < b.order_key());
        assert_eq!(a.participant, PlayerId(1));
    }

    #[test]
    fn every_command_type_roundtrips_through_u16() {
        for raw in 1..=8u16 {
            let ty = CommandType::from_u16(raw).unwrap();
            assert_eq!(ty as u16, raw);
        }
        assert_eq!(CommandType::from_u16(0), None);
        assert_eq!(CommandType::from_u16(9), None);
    }

    #[test]
    fn payload_decodes_against_declared_type() {
        let action = SimAction::Move {
            unit: UnitId(3),
            destination: CellCoord::new(5, 5),
        };
        let payload = encode_action(&action).unwrap();
        assert_eq!(decode_action(CommandType::Move as u16, &payload).unwrap(), action);
        assert!(matches!(
            decode_action(CommandType::Sell as u16, &payload),
            Err(CommandDecodeError::TypeMismatch {
                declared: CommandType::Sell,
                actual: CommandType::Move
            })
        ));
        assert!(matches!(
            decode_action(77, &payload),
            Err(CommandDecodeError::UnknownType(77))
        ));
        assert!(matches!(
            decode_action(CommandType::Move as u16, b"{not json"),
            Err(CommandDecodeError::Payload(_))
        ));
    }

    #[test]
    fn record_bincode_size_is_small() {
        // Records are buffered per frame for every participant; keep them
        // compact when serialized densely.
        let record = EventRecord {
            participant: PlayerId(0),
            frame: 12,
            sequence: 0,
            action: SimAction::Move {
                unit: UnitId(1),
                destination: CellCoord::new(5, 5),
            },
        };
        let bytes = bincode::serialize(&record).unwrap();
        assert!(bytes.len() < 48, "record is {} bytes", bytes.len());
        let back: EventRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, record);
    }
}
