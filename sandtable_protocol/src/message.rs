// Protocol messages for peer-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by a peer to the relay.
// - `ServerMessage`: sent by the relay to a peer.
//
// Lockstep traffic is `FrameInput`: one message per participant per frame,
// carrying that participant's commands for the frame. An empty `commands`
// list is the explicit "no command this frame" marker the scheduler needs
// before it can release the frame, so a peer sends exactly one `FrameInput`
// for every frame even when idle.
//
// Command payloads are opaque bytes tagged with a numeric `command_type`; the
// relay never inspects them, which keeps this crate independent of the sim.

use serde::{Deserialize, Serialize};

use crate::types::{ActionSequence, FrameNumber, ParticipantId};

/// Bumped whenever a message shape changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent by a peer to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join a session (handshake). Must be the first message on a link.
    Hello {
        protocol_version: u32,
        player_name: String,
        sim_version_hash: u64,
        config_hash: u64,
        session_password: Option<String>,
    },
    /// Host triggers game start (lobby -> playing).
    StartGame { seed: u64, config_json: String },
    /// This participant's complete input for one frame.
    FrameInput {
        frame: FrameNumber,
        commands: Vec<WireCommand>,
    },
    /// World checksum after completing `frame`.
    Checksum { frame: FrameNumber, checksum: u64 },
    /// Chat message.
    Chat { text: String },
    /// Leaving gracefully.
    Goodbye,
}

/// Messages sent by the relay to a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted.
    Welcome {
        participant: ParticipantId,
        session_name: String,
        players: Vec<PlayerInfo>,
    },
    /// Handshake rejected. The relay closes the link afterwards.
    Rejected { reason: String },
    /// A participant connected.
    PlayerJoined { player: PlayerInfo },
    /// A participant disconnected.
    PlayerLeft {
        participant: ParticipantId,
        name: String,
    },
    /// All peers should set up their sim from this seed and config.
    /// `participants` is the fixed roster, ascending.
    GameStart {
        seed: u64,
        config_json: String,
        config_hash: u64,
        participants: Vec<ParticipantId>,
    },
    /// Another participant's input for one frame, forwarded verbatim.
    FrameInput {
        participant: ParticipantId,
        frame: FrameNumber,
        commands: Vec<WireCommand>,
    },
    /// Another participant's checksum, forwarded for peer-side auditing.
    Checksum {
        participant: ParticipantId,
        frame: FrameNumber,
        checksum: u64,
    },
    /// The relay saw disagreeing checksums for `frame`.
    DesyncDetected {
        frame: FrameNumber,
        diverging: Vec<ParticipantId>,
    },
    /// Chat from another participant.
    ChatBroadcast {
        from: ParticipantId,
        name: String,
        text: String,
    },
}

/// One serialized command within a `FrameInput`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCommand {
    pub sequence: ActionSequence,
    pub command_type: u16,
    pub payload: Vec<u8>,
}

/// Public identity of a connected participant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: ParticipantId,
    pub name: String,
}
