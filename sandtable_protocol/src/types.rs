// Core ID types for the lockstep wire protocol.
//
// Lightweight newtypes shared by `message.rs`, the link layer (`link.rs`) and
// the relay's session management (`sandtable_relay::session`). These are
// relay-scoped identifiers; the simulation has its own `PlayerId` and the
// peer glue converts between the two.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay-assigned participant ID. Also the primary key of the canonical
/// event order, so it must be identical on every peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub u32);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Simulation frame number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameNumber(pub u64);

/// Per-participant monotonic command sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionSequence(pub u64);

/// Per-hop packet counter used by the link layer for exactly-once delivery.
/// Unrelated to `ActionSequence`: a packet may carry chat, checksums, or an
/// empty frame marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkSequence(pub u64);
