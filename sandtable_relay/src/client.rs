// Peer-side connection to the relay.
//
// `NetClient` wraps one `EventChannel` and speaks the client half of the
// protocol. `join()` performs the Hello handshake on the calling thread and
// blocks (bounded by `HANDSHAKE_TIMEOUT`) until `Welcome` or `Rejected`;
// everything after that is non-blocking: `send_*` writes immediately and
// `poll()` drains whatever the relay has delivered so far.
//
// It is generic over the transport so in-process tests can run the exact
// same code over `MemoryTransport`; `connect()` is the TCP convenience.
//
// The client knows nothing about the simulation. Frame inputs travel as
// `WireCommand`s whose payloads the peer glue encodes and decodes.
//
// See also: `session.rs` for the relay half, and the `multiplayer_tests`
// crate's `TestPeer`, which owns a `NetClient` alongside a lockstep session.

use std::net::ToSocketAddrs;
use std::time::Duration;

use sandtable_protocol::{ClientMessage, FrameNumber, PROTOCOL_VERSION, ParticipantId, PlayerInfo, ServerMessage, WireCommand};
use thiserror::Error;
use tracing::debug;

use crate::channel::{ChannelError, EventChannel};
use crate::transport::{TcpTransport, Transport, TransportError};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("rejected by relay: {0}")]
    Rejected(String),
    #[error("no reply to Hello within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("unexpected handshake reply: {0}")]
    Unexpected(String),
}

/// Handshake parameters for one participant.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub player_name: String,
    pub sim_version_hash: u64,
    pub config_hash: u64,
    pub password: Option<String>,
}

/// What the relay said in `Welcome`.
#[derive(Clone, Debug, PartialEq)]
pub struct WelcomeInfo {
    pub participant: ParticipantId,
    pub session_name: String,
    pub players: Vec<PlayerInfo>,
}

pub struct NetClient<T: Transport = TcpTransport> {
    channel: EventChannel<T>,
    participant: ParticipantId,
}

impl NetClient<TcpTransport> {
    /// Connect over TCP and join.
    pub fn connect(addr: impl ToSocketAddrs, identity: &ClientIdentity) -> Result<(Self, WelcomeInfo), ClientError> {
        let transport = TcpTransport::connect(addr)?;
        Self::join(EventChannel::new(transport), identity)
    }
}

impl<T: Transport> NetClient<T> {
    /// Send Hello on `channel` and wait for the verdict.
    pub fn join(mut channel: EventChannel<T>, identity: &ClientIdentity) -> Result<(Self, WelcomeInfo), ClientError> {
        channel.send(&ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            player_name: identity.player_name.clone(),
            sim_version_hash: identity.sim_version_hash,
            config_hash: identity.config_hash,
            session_password: identity.password.clone(),
        })?;

        let reply: Option<ServerMessage> = channel.recv_timeout(HANDSHAKE_TIMEOUT)?;
        let welcome = match reply {
            Some(ServerMessage::Welcome {
                participant,
                session_name,
                players,
            }) => WelcomeInfo {
                participant,
                session_name,
                players,
            },
            Some(ServerMessage::Rejected { reason }) => return Err(ClientError::Rejected(reason)),
            Some(other) => return Err(ClientError::Unexpected(format!("{other:?}"))),
            None => return Err(ClientError::HandshakeTimeout(HANDSHAKE_TIMEOUT)),
        };
        debug!(participant = %welcome.participant, session = %welcome.session_name, "joined relay");

        Ok((
            Self {
                channel,
                participant: welcome.participant,
            },
            welcome,
        ))
    }

    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    pub fn channel(&self) -> &EventChannel<T> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut EventChannel<T> {
        &mut self.channel
    }

    /// Host only; the relay ignores it from anyone else.
    pub fn send_start_game(&mut self, seed: u64, config_json: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::StartGame {
            seed,
            config_json: config_json.into(),
        })
    }

    /// This participant's complete input for `frame`. Empty means no
    /// command this frame, and still has to be sent.
    pub fn send_frame_input(&mut self, frame: u64, commands: Vec<WireCommand>) -> Result<(), ClientError> {
        self.send(&ClientMessage::FrameInput {
            frame: FrameNumber(frame),
            commands,
        })
    }

    pub fn send_checksum(&mut self, frame: u64, checksum: u64) -> Result<(), ClientError> {
        self.send(&ClientMessage::Checksum {
            frame: FrameNumber(frame),
            checksum,
        })
    }

    pub fn send_chat(&mut self, text: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::Chat { text: text.into() })
    }

    /// Say goodbye and close. Errors are irrelevant at this point.
    pub fn disconnect(&mut self) {
        let _ = self.channel.send(&ClientMessage::Goodbye);
        self.channel.close();
    }

    /// Everything the relay has delivered so far. Never blocks.
    pub fn poll(&mut self) -> Result<Vec<ServerMessage>, ClientError> {
        Ok(self.channel.poll()?)
    }

    fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        self.channel.send(message)?;
        Ok(())
    }
}
