// Test-only lockstep peer for multiplayer integration tests.
//
// `TestPeer` wraps a real `NetClient` (from `sandtable_relay::client`) and a
// real `LockstepSession` (from `sandtable_sim::session`) and shuttles
// between them: session outbox -> `FrameInput` / `Checksum` messages, and
// relay messages -> `receive_input` / `receive_checksum` /
// `remove_participant`. That translation (records to `WireCommand`s and
// back, relay ids to sim ids) is the peer glue any real client would need.
//
// The only test-specific code is the blocking polling wrappers. Networking,
// scheduling and simulation run through the same code paths as a live
// peer.
//
// See also: `tests/full_pipeline.rs` and `tests/scenarios.rs`.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use sandtable_protocol::{ActionSequence, FrameNumber, ParticipantId, ServerMessage, WireCommand};
use sandtable_relay::client::{ClientIdentity, NetClient};
use sandtable_sim::command::{EventRecord, SimAction, decode_action, encode_action};
use sandtable_sim::config::SessionConfig;
use sandtable_sim::error::SessionError;
use sandtable_sim::session::{LockstepSession, Outgoing};
use sandtable_sim::sim::FrameResult;
use sandtable_sim::types::PlayerId;
use tracing::debug;

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// Sleep between poll attempts when nothing moved.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Stand-in for a build hash; every peer in these tests runs the same code.
pub const SIM_VERSION_HASH: u64 = 0x5A4D_7AB1;

/// Relay ids are the lowest free slot below the relay's player cap, so
/// they always fit.
pub fn player_id(p: ParticipantId) -> PlayerId {
    PlayerId(u8::try_from(p.0).expect("participant id fits in u8"))
}

/// Encode one record for a `FrameInput`.
pub fn to_wire(record: &EventRecord) -> WireCommand {
    WireCommand {
        sequence: ActionSequence(record.sequence),
        command_type: record.command_type() as u16,
        payload: encode_action(&record.action).expect("actions always serialize"),
    }
}

/// Decode a forwarded `FrameInput` back into records.
pub fn from_wire(participant: ParticipantId, frame: FrameNumber, commands: &[WireCommand]) -> Vec<EventRecord> {
    commands
        .iter()
        .map(|c| EventRecord {
            participant: player_id(participant),
            frame: frame.0,
            sequence: c.sequence.0,
            action: decode_action(c.command_type, &c.payload).expect("peer sent a valid command"),
        })
        .collect()
}

/// A lockstep peer connected to a relay.
pub struct TestPeer {
    client: NetClient,
    pub participant: ParticipantId,
    pub session: Option<LockstepSession>,
    /// `DesyncDetected` broadcasts from the relay: (frame, diverging).
    pub relay_desyncs: Vec<(u64, Vec<ParticipantId>)>,
    /// Participants the relay reported as gone.
    pub departed: Vec<ParticipantId>,
    /// Narrative events from every frame executed so far.
    pub frames: Vec<FrameResult>,
}

impl TestPeer {
    /// Connect and join. The config hash goes into the handshake so the
    /// relay can reject mismatched peers.
    pub fn connect(addr: SocketAddr, name: &str, config: &SessionConfig) -> Self {
        let identity = ClientIdentity {
            player_name: name.into(),
            sim_version_hash: SIM_VERSION_HASH,
            config_hash: config.config_hash(),
            password: None,
        };
        let (client, welcome) = NetClient::connect(addr, &identity).expect("TestPeer::connect failed");
        Self {
            client,
            participant: welcome.participant,
            session: None,
            relay_desyncs: Vec::new(),
            departed: Vec::new(),
            frames: Vec::new(),
        }
    }

    pub fn local(&self) -> PlayerId {
        player_id(self.participant)
    }

    pub fn session(&self) -> &LockstepSession {
        self.session.as_ref().expect("game not started")
    }

    pub fn session_mut(&mut self) -> &mut LockstepSession {
        self.session.as_mut().expect("game not started")
    }

    /// Next frame this peer will execute.
    pub fn frame(&self) -> u64 {
        self.session().current_frame()
    }

    /// Host only.
    pub fn send_start_game(&mut self, seed: u64, config: &SessionConfig) {
        let json = config.to_json().expect("config serializes");
        self.client.send_start_game(seed, &json).expect("send_start_game failed");
    }

    /// Block until `GameStart`, then build and start the lockstep session.
    /// Traffic that arrived behind `GameStart` is handed to the session.
    pub fn poll_until_game_start(&mut self) {
        let deadline = Instant::now() + POLL_TIMEOUT;
        while Instant::now() < deadline {
            let mut messages = self.client.poll().expect("relay link failed").into_iter();
            if let Some(ServerMessage::GameStart {
                seed,
                config_json,
                config_hash,
                participants,
            }) = messages.find(|m| matches!(m, ServerMessage::GameStart { .. }))
            {
                let config = SessionConfig::from_json(&config_json).expect("valid config");
                let roster: Vec<PlayerId> = participants.into_iter().map(player_id).collect();
                let mut session = LockstepSession::new(self.local(), &roster, config, seed).expect("session setup");
                session.verify_remote_config(config_hash).expect("config agreed at handshake");
                session.start().expect("start");
                self.session = Some(session);
                self.flush();
                for rest in messages {
                    self.dispatch(rest);
                }
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
        panic!("timed out waiting for GameStart");
    }

    /// Queue an action; it executes `latency_window` frames from now.
    pub fn issue(&mut self, action: SimAction) -> EventRecord {
        self.session_mut().issue(action)
    }

    /// Send everything the session queued for the other peers.
    pub fn flush(&mut self) {
        let outgoing = self.session_mut().drain_outbox();
        for msg in outgoing {
            let sent = match msg {
                Outgoing::FrameInput { frame, records } => {
                    let commands = records.iter().map(to_wire).collect();
                    self.client.send_frame_input(frame, commands)
                }
                Outgoing::Checksum { frame, checksum } => self.client.send_checksum(frame, checksum),
            };
            sent.expect("send to relay failed");
        }
    }

    /// Hand every relay message to the session. Returns how many arrived.
    pub fn pump(&mut self) -> usize {
        let messages = self.client.poll().expect("relay link failed");
        let count = messages.len();
        for msg in messages {
            self.dispatch(msg);
        }
        count
    }

    fn dispatch(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::FrameInput {
                participant,
                frame,
                commands,
            } => {
                let records = from_wire(participant, frame, &commands);
                self.session_mut()
                    .receive_input(player_id(participant), frame.0, records)
                    .expect("scheduler accepted input");
            }
            ServerMessage::Checksum {
                participant,
                frame,
                checksum,
            } => {
                self.session_mut()
                    .receive_checksum(player_id(participant), frame.0, checksum);
            }
            ServerMessage::PlayerLeft { participant, .. } => {
                self.departed.push(participant);
                if let Some(session) = self.session.as_mut() {
                    session.remove_participant(player_id(participant));
                }
            }
            ServerMessage::DesyncDetected { frame, diverging } => {
                self.relay_desyncs.push((frame.0, diverging));
            }
            other => debug!(?other, "ignored relay message"),
        }
    }

    /// One driver iteration: receive, advance at most one frame, send.
    pub fn step(&mut self) -> Result<bool, SessionError> {
        self.pump();
        let result = self.session_mut().update();
        self.flush();
        match result? {
            Some(frame) => {
                self.frames.push(frame);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Send Goodbye and close the connection.
    pub fn disconnect(&mut self) {
        if self.session.is_some() {
            self.flush();
        }
        self.client.disconnect();
    }
}

/// Drive every peer until each has executed up to `frame` (exclusive), i.e.
/// `current_frame() == frame`. Peers already there are only pumped.
pub fn run_until(peers: &mut [&mut TestPeer], frame: u64) {
    let deadline = Instant::now() + POLL_TIMEOUT;
    loop {
        let mut moved = false;
        for peer in peers.iter_mut() {
            if peer.frame() < frame {
                moved |= peer.step().expect("session failed");
            } else {
                peer.pump();
            }
        }
        if peers.iter().all(|p| p.frame() >= frame) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out driving peers to frame {frame}");
        if !moved {
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Drive peers, tolerating session errors, until `done` holds for all.
pub fn run_while(peers: &mut [&mut TestPeer], what: &str, done: impl Fn(&TestPeer) -> bool) {
    let deadline = Instant::now() + POLL_TIMEOUT;
    while !peers.iter().all(|p| done(&**p)) {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        let mut moved = false;
        for peer in peers.iter_mut() {
            moved |= matches!(peer.step(), Ok(true));
        }
        if !moved {
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Config for networked tests: generous stall limits, since the driver
/// loops far faster than a real frame cadence.
pub fn network_config() -> SessionConfig {
    SessionConfig {
        stall_timeout: 1_000_000,
        abort_ceiling: 10_000_000,
        ..SessionConfig::default()
    }
}
