// sandtable_protocol: wire protocol shared by lockstep peers and the relay.
//
// This crate defines what travels between processes and how it is protected
// in transit. It has no dependency on the simulation crate: command payloads
// are opaque bytes, so the relay can forward them without understanding them.
//
// Module overview:
// - `types.rs`:   ID newtypes: `ParticipantId`, `FrameNumber`,
//                 `ActionSequence`, `LinkSequence`.
// - `message.rs`: `ClientMessage` / `ServerMessage` and the `WireCommand` and
//                 `PlayerInfo` structs they carry.
// - `codec.rs`:   Packet layout: header, optional zstd body compression, CRC32
//                 trailer over header and body.
// - `link.rs`:    Per-hop sequencing for exactly-once, in-order delivery:
//                 duplicate drop, reorder buffering, nack-driven resend.
// - `framing.rs`: 4-byte length framing for stream transports.
// - `error.rs`:   `CodecError` and `ProtocolError`.
//
// Layering, outermost first: framing (TCP only) -> packet codec -> link
// sequencing -> JSON message. The in-memory transport starts at the codec.
//
// **Critical constraint: determinism.** Nothing in this crate touches
// simulation state, but delivery order does: each participant's frame inputs
// must arrive exactly once and in the order that participant sent them. The
// link layer is what guarantees that; do not deliver around it.

pub mod codec;
pub mod error;
pub mod framing;
pub mod link;
pub mod message;
pub mod types;

pub use codec::{Packet, PacketKind, decode_packet, encode_packet};
pub use error::{CodecError, ProtocolError};
pub use framing::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use link::{LinkEvent, LinkReceiver, LinkSender, encode_nack};
pub use message::{ClientMessage, PROTOCOL_VERSION, PlayerInfo, ServerMessage, WireCommand};
pub use types::{ActionSequence, FrameNumber, LinkSequence, ParticipantId};
