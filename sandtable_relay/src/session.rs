// Relay-side session: lobby, roster, forwarding, and checksum comparison.
//
// `RelaySession` is the structure `server.rs` drives from its single
// thread. It owns one `EventChannel` per admitted participant and never
// runs the simulation: frame inputs and checksums are forwarded verbatim to
// every other participant, whose own schedulers and auditors do the real
// work. No internal locking; every call comes from the server loop.
//
// Responsibilities:
// - Handshake checks on `Hello`: protocol version, password, capacity,
//   lobby still open, and matching sim-version and config hashes (the first
//   participant sets the reference).
// - Ids: each joiner takes the lowest id not currently held, so ids stay
//   below `MAX_PLAYERS` however much the lobby churns.
// - Lobby: the first participant is the host. Only the host may send
//   `StartGame`, which freezes the roster and broadcasts `GameStart`.
// - Forwarding: `FrameInput` and `Checksum` from one participant go to all
//   others, in the order received. Per-sender order is all lockstep needs;
//   each channel preserves it.
// - Relay-side desync detection: once every connected participant has
//   reported a checksum for a frame, disagreement is broadcast as
//   `DesyncDetected`, naming the minority. Ties blame everyone outside the
//   group holding the lowest id, the same rule the peers' auditors use.
//   Judged frames are dropped; reports at or below the judged watermark
//   are ignored.
// - Departures: a failed channel or `Goodbye` removes the participant and
//   broadcasts `PlayerLeft`. Peers turn that into a scheduler departure.
//
// Send failures never recurse into removal; the failed id is queued and
// reaped at the end of `pump()`.
//
// See also: `server.rs` (TCP accept loop), `channel.rs`,
// `sandtable_sim::session` for the peer side of every message here.

use std::collections::{BTreeMap, BTreeSet};

use sandtable_protocol::{ClientMessage, FrameNumber, PROTOCOL_VERSION, ParticipantId, PlayerInfo, ServerMessage};
use tracing::{debug, info, warn};

use crate::channel::EventChannel;
use crate::transport::Transport;

/// Hard ceiling on `max_players`. Matches the largest roster the
/// simulation accepts.
pub const MAX_PLAYERS: u32 = 8;

/// Fields of a `Hello`, pulled out so admission does not need to re-match.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinRequest {
    pub protocol_version: u32,
    pub player_name: String,
    pub sim_version_hash: u64,
    pub config_hash: u64,
    pub session_password: Option<String>,
}

impl JoinRequest {
    pub fn from_message(message: ClientMessage) -> Option<Self> {
        match message {
            ClientMessage::Hello {
                protocol_version,
                player_name,
                sim_version_hash,
                config_hash,
                session_password,
            } => Some(Self {
                protocol_version,
                player_name,
                sim_version_hash,
                config_hash,
                session_password,
            }),
            _ => None,
        }
    }
}

struct Member<T: Transport> {
    name: String,
    channel: EventChannel<T>,
}

pub struct RelaySession<T: Transport> {
    pub name: String,
    password: Option<String>,
    max_players: u32,
    host: Option<ParticipantId>,
    members: BTreeMap<ParticipantId, Member<T>>,

    sim_version_hash: Option<u64>,
    config_hash: Option<u64>,
    started: bool,

    /// Unjudged checksum reports, by frame.
    checksums: BTreeMap<u64, BTreeMap<ParticipantId, u64>>,
    /// Highest frame judged so far.
    judged_through: Option<u64>,

    /// Members whose channel failed during a send; reaped by `pump`.
    failed: BTreeSet<ParticipantId>,
}

impl<T: Transport> RelaySession<T> {
    /// `max_players` is clamped to `MAX_PLAYERS`.
    pub fn new(name: String, password: Option<String>, max_players: u32) -> Self {
        if max_players > MAX_PLAYERS {
            warn!(max_players, cap = MAX_PLAYERS, "max_players clamped");
        }
        Self {
            name,
            password,
            max_players: max_players.min(MAX_PLAYERS),
            host: None,
            members: BTreeMap::new(),
            sim_version_hash: None,
            config_hash: None,
            started: false,
            checksums: BTreeMap::new(),
            judged_through: None,
            failed: BTreeSet::new(),
        }
    }

    pub fn player_count(&self) -> usize {
        self.members.len()
    }

    pub fn host(&self) -> Option<ParticipantId> {
        self.host
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn player_list(&self) -> Vec<PlayerInfo> {
        self.members
            .iter()
            .map(|(&id, m)| PlayerInfo {
                id,
                name: m.name.clone(),
            })
            .collect()
    }

    /// Admit a participant, or reply `Rejected` on its channel and drop it.
    pub fn add_player(&mut self, request: JoinRequest, mut channel: EventChannel<T>) -> Result<ParticipantId, String> {
        let id = match self.check_admission(&request) {
            Ok(id) => id,
            Err(reason) => {
                info!(name = %request.player_name, %reason, "rejecting join");
                let _ = channel.send(&ServerMessage::Rejected { reason: reason.clone() });
                channel.close();
                return Err(reason);
            }
        };
        if self.sim_version_hash.is_none() {
            self.sim_version_hash = Some(request.sim_version_hash);
            self.config_hash = Some(request.config_hash);
        }

        if self.host.is_none() {
            self.host = Some(id);
        }

        let info = PlayerInfo {
            id,
            name: request.player_name.clone(),
        };
        self.broadcast(&ServerMessage::PlayerJoined { player: info.clone() });

        let mut players = self.player_list();
        players.push(info);
        self.members.insert(
            id,
            Member {
                name: request.player_name,
                channel,
            },
        );
        self.send_to(
            id,
            &ServerMessage::Welcome {
                participant: id,
                session_name: self.name.clone(),
                players,
            },
        );
        info!(participant = %id, players = self.members.len(), "participant joined");
        Ok(id)
    }

    /// The id the joiner would get, or why it may not join.
    fn check_admission(&self, request: &JoinRequest) -> Result<ParticipantId, String> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "protocol version {} not supported (relay speaks {PROTOCOL_VERSION})",
                request.protocol_version
            ));
        }
        if self.password.is_some() && request.session_password != self.password {
            return Err("incorrect password".into());
        }
        if self.members.len() as u32 >= self.max_players {
            return Err("session is full".into());
        }
        if self.started {
            return Err("game already started".into());
        }
        if self.sim_version_hash.is_some_and(|h| h != request.sim_version_hash) {
            return Err("sim version mismatch".into());
        }
        if self.config_hash.is_some_and(|h| h != request.config_hash) {
            return Err("config hash mismatch".into());
        }
        (0..self.max_players)
            .map(ParticipantId)
            .find(|id| !self.members.contains_key(id))
            .ok_or_else(|| "session is full".into())
    }

    /// Remove a participant and tell everyone else.
    pub fn remove_player(&mut self, id: ParticipantId) {
        let Some(mut member) = self.members.remove(&id) else {
            return;
        };
        member.channel.close();
        info!(participant = %id, name = %member.name, "participant left");
        self.broadcast(&ServerMessage::PlayerLeft {
            participant: id,
            name: member.name,
        });

        if self.host == Some(id) {
            self.host = self.members.keys().next().copied();
        }
        if self.members.is_empty() {
            // Nobody left to match against; the next joiner sets the bar.
            self.sim_version_hash = None;
            self.config_hash = None;
        }

        for slot in self.checksums.values_mut() {
            slot.remove(&id);
        }
        let frames: Vec<u64> = self.checksums.keys().copied().collect();
        for frame in frames {
            self.judge(frame);
        }
    }

    /// Poll every member's channel and handle what arrived. Members whose
    /// channel failed are removed. Returns the number of messages handled.
    pub fn pump(&mut self) -> usize {
        let mut inbound: Vec<(ParticipantId, ClientMessage)> = Vec::new();
        for (&id, member) in &mut self.members {
            match member.channel.poll::<ClientMessage>() {
                Ok(messages) => inbound.extend(messages.into_iter().map(|m| (id, m))),
                Err(e) => {
                    debug!(participant = %id, error = %e, "channel failed");
                    self.failed.insert(id);
                }
            }
        }
        let handled = inbound.len();
        for (id, message) in inbound {
            if self.members.contains_key(&id) {
                self.handle(id, message);
            }
        }
        self.reap();
        handled
    }

    fn reap(&mut self) {
        while let Some(id) = self.failed.pop_first() {
            self.remove_player(id);
        }
    }

    /// Dispatch one message from an admitted participant.
    pub fn handle(&mut self, from: ParticipantId, message: ClientMessage) {
        match message {
            ClientMessage::StartGame { seed, config_json } => self.start_game(from, seed, config_json),
            ClientMessage::FrameInput { frame, commands } => {
                if !self.started {
                    warn!(participant = %from, frame = frame.0, "frame input before start dropped");
                    return;
                }
                self.broadcast_except(
                    from,
                    &ServerMessage::FrameInput {
                        participant: from,
                        frame,
                        commands,
                    },
                );
            }
            ClientMessage::Checksum { frame, checksum } => {
                self.broadcast_except(
                    from,
                    &ServerMessage::Checksum {
                        participant: from,
                        frame,
                        checksum,
                    },
                );
                self.record_checksum(from, frame.0, checksum);
            }
            ClientMessage::Chat { text } => {
                let name = self.members.get(&from).map(|m| m.name.clone()).unwrap_or_default();
                self.broadcast(&ServerMessage::ChatBroadcast { from, name, text });
            }
            ClientMessage::Goodbye => self.remove_player(from),
            ClientMessage::Hello { .. } => {
                warn!(participant = %from, "duplicate Hello ignored");
            }
        }
    }

    fn start_game(&mut self, from: ParticipantId, seed: u64, config_json: String) {
        if self.host != Some(from) || self.started {
            warn!(participant = %from, "StartGame ignored");
            return;
        }
        self.started = true;
        let participants: Vec<ParticipantId> = self.members.keys().copied().collect();
        info!(seed, players = participants.len(), "game started");
        self.broadcast(&ServerMessage::GameStart {
            seed,
            config_json,
            config_hash: self.config_hash.unwrap_or_default(),
            participants,
        });
    }

    /// Record a checksum and judge the frame once everyone connected has
    /// reported. The first value per participant per frame sticks.
    pub fn record_checksum(&mut self, from: ParticipantId, frame: u64, checksum: u64) {
        if self.judged_through.is_some_and(|done| frame <= done) {
            return;
        }
        self.checksums.entry(frame).or_default().entry(from).or_insert(checksum);
        self.judge(frame);
    }

    fn judge(&mut self, frame: u64) {
        let Some(slot) = self.checksums.get(&frame) else {
            return;
        };
        if self.members.len() < 2 || !self.members.keys().all(|id| slot.contains_key(id)) {
            return;
        }
        let diverging = diverging(slot);
        self.judged_through = Some(self.judged_through.map_or(frame, |done| done.max(frame)));
        self.checksums.retain(|&f, _| f > frame);
        if !diverging.is_empty() {
            warn!(frame, ?diverging, "desync detected");
            self.broadcast(&ServerMessage::DesyncDetected {
                frame: FrameNumber(frame),
                diverging,
            });
        }
    }

    fn send_to(&mut self, id: ParticipantId, message: &ServerMessage) {
        if let Some(member) = self.members.get_mut(&id)
            && let Err(e) = member.channel.send(message)
        {
            debug!(participant = %id, error = %e, "send failed");
            self.failed.insert(id);
        }
    }

    fn broadcast(&mut self, message: &ServerMessage) {
        let ids: Vec<ParticipantId> = self.members.keys().copied().collect();
        for id in ids {
            self.send_to(id, message);
        }
    }

    fn broadcast_except(&mut self, except: ParticipantId, message: &ServerMessage) {
        let ids: Vec<ParticipantId> = self.members.keys().copied().filter(|&id| id != except).collect();
        for id in ids {
            self.send_to(id, message);
        }
    }
}

/// Participants outside the reference group. The reference is the largest
/// group of equal checksums; ties go to the group with the lowest id.
fn diverging(slot: &BTreeMap<ParticipantId, u64>) -> Vec<ParticipantId> {
    let mut groups: BTreeMap<u64, Vec<ParticipantId>> = BTreeMap::new();
    for (&id, &sum) in slot {
        groups.entry(sum).or_default().push(id);
    }
    let reference = groups
        .iter()
        .max_by(|(_, a), (_, b)| a.len().cmp(&b.len()).then(b[0].cmp(&a[0])))
        .map(|(&sum, _)| sum);
    slot.iter()
        .filter(|&(_, &sum)| Some(sum) != reference)
        .map(|(&id, _)| id)
        .collect()
}
