// Lockstep session: one peer's view of a running game.
//
// Glues the command serializer, scheduler, engine, and integrity auditor
// together without doing any I/O. The network layer feeds it remote frame
// inputs and checksums, and drains `Outgoing` messages to send; a driver
// calls `update()` once per frame interval.
//
// ## Local input sealing
//
// Actions issued while the engine sits at frame `c` target frame
// `c + latency_window`. Local input for a frame is sealed (handed to the
// scheduler and queued for broadcast) exactly once, right after the engine
// executes the frame before it becomes reachable:
//
//   start():               seal frames 0 .. L-1 (empty)
//   after executing c-1:   seal frame c-1+L with everything issued at c-1
//
// So every frame gets exactly one input per participant, and an empty seal
// doubles as the explicit "no command this frame" marker.
//
// ## Audits
//
// After executing a frame, if the new frame counter `n` satisfies
// `n % checksum_interval == 0`, the session checksums the world, records it
// locally, and queues it for broadcast. A desync is fatal: once reported the
// session refuses to advance, and the report stays visible.
//
// Selection is local-only UI state and deliberately lives here, outside the
// engine and the checksum.
//
// See also: `scheduler.rs`, `sim.rs`, `checksum.rs`, and the relay crate's
// `NetClient` for the transport side.
//
// **Critical constraint: determinism.** Nothing here may reach into the
// engine except through records released by the scheduler.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::checksum::{DesyncReport, IntegrityAuditor};
use crate::command::{CommandSerializer, EventRecord, SimAction};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::scheduler::{LockstepScheduler, SchedulerNotice, SchedulerState};
use crate::sim::{FrameResult, SimState};
use crate::types::{PlayerId, UnitId};

/// Something the network layer must send to every other participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outgoing {
    FrameInput { frame: u64, records: Vec<EventRecord> },
    Checksum { frame: u64, checksum: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created but `start()` not yet called.
    Lobby,
    Running,
    Stalled { frame: u64, waiting_on: Vec<PlayerId> },
    Desynced(DesyncReport),
    Aborted { frame: u64, waiting_on: Vec<PlayerId> },
}

#[derive(Debug)]
pub struct LockstepSession {
    local: PlayerId,
    config_hash: u64,
    serializer: CommandSerializer,
    scheduler: LockstepScheduler,
    sim: SimState,
    auditor: IntegrityAuditor,
    /// Issued local records not yet sealed into a frame input.
    pending: Vec<EventRecord>,
    outbox: Vec<Outgoing>,
    started: bool,
    desync: Option<DesyncReport>,
    selection: BTreeSet<UnitId>,
}

impl LockstepSession {
    pub fn new(
        local: PlayerId,
        participants: &[PlayerId],
        config: SessionConfig,
        seed: u64,
    ) -> Result<Self, SessionError> {
        let roster: BTreeSet<PlayerId> = participants.iter().copied().collect();
        if !roster.contains(&local) {
            return Err(SessionError::UnknownParticipant(local));
        }
        let roster: Vec<PlayerId> = roster.into_iter().collect();
        let config_hash = config.config_hash();
        let serializer = CommandSerializer::new(local, config.latency_window);
        let mut scheduler =
            LockstepScheduler::new(roster.iter().copied(), config.stall_timeout, config.abort_ceiling);
        scheduler.set_notifier(move |notice| log_notice(local, notice));
        let auditor = IntegrityAuditor::new(config.checksum_interval, roster.iter().copied());
        let sim = SimState::new(config, &roster, seed)?;

        Ok(Self {
            local,
            config_hash,
            serializer,
            scheduler,
            sim,
            auditor,
            pending: Vec::new(),
            outbox: Vec::new(),
            started: false,
            desync: None,
            selection: BTreeSet::new(),
        })
    }

    pub fn local(&self) -> PlayerId {
        self.local
    }

    pub fn sim(&self) -> &SimState {
        &self.sim
    }

    /// Test hook: mutable engine access for corruption scenarios.
    pub fn sim_mut_for_testing(&mut self) -> &mut SimState {
        &mut self.sim
    }

    pub fn scheduler(&self) -> &LockstepScheduler {
        &self.scheduler
    }

    pub fn auditor(&self) -> &IntegrityAuditor {
        &self.auditor
    }

    pub fn config_hash(&self) -> u64 {
        self.config_hash
    }

    /// Next frame the engine will execute.
    pub fn current_frame(&self) -> u64 {
        self.sim.frame
    }

    pub fn desync(&self) -> Option<&DesyncReport> {
        self.desync.as_ref()
    }

    pub fn status(&self) -> SessionStatus {
        if let Some(report) = &self.desync {
            return SessionStatus::Desynced(report.clone());
        }
        if !self.started {
            return SessionStatus::Lobby;
        }
        match self.scheduler.state() {
            SchedulerState::Stalled { frame, waiting_on } => SessionStatus::Stalled {
                frame: *frame,
                waiting_on: waiting_on.clone(),
            },
            SchedulerState::SessionAborted { frame, waiting_on } => SessionStatus::Aborted {
                frame: *frame,
                waiting_on: waiting_on.clone(),
            },
            SchedulerState::WaitingForFrame(_) | SchedulerState::FrameReady(_) => SessionStatus::Running,
        }
    }

    /// Reject a peer whose config differs from ours.
    pub fn verify_remote_config(&self, remote: u64) -> Result<(), SessionError> {
        if remote == self.config_hash {
            Ok(())
        } else {
            Err(SessionError::ConfigMismatch {
                local: self.config_hash,
                remote,
            })
        }
    }

    /// Seal the empty lead-in frames covered by the latency window.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        info!(
            participant = %self.local,
            latency_window = self.serializer.latency_window(),
            config_hash = format_args!("{:#018x}", self.config_hash),
            "lockstep session started"
        );
        for frame in 0..self.serializer.latency_window() {
            self.seal(frame)?;
        }
        Ok(())
    }

    /// Queue a local action. It executes at `current_frame + latency_window`
    /// on every peer. Scripted triggers use this same entry point.
    pub fn issue(&mut self, action: SimAction) -> EventRecord {
        let record = self.serializer.issue(action, self.sim.frame);
        debug!(
            participant = %self.local,
            frame = record.frame,
            sequence = record.sequence,
            "issued command"
        );
        self.pending.push(record.clone());
        record
    }

    /// A remote participant's complete input for `frame`.
    pub fn receive_input(
        &mut self,
        participant: PlayerId,
        frame: u64,
        records: Vec<EventRecord>,
    ) -> Result<(), SessionError> {
        self.scheduler.submit(participant, frame, records)?;
        Ok(())
    }

    /// A remote participant's checksum for an audit frame.
    pub fn receive_checksum(&mut self, participant: PlayerId, frame: u64, checksum: u64) {
        if let Some(report) = self.auditor.record(frame, participant, checksum) {
            self.flag_desync(report);
        }
    }

    /// `participant` left; stop waiting on its input and checksums.
    pub fn remove_participant(&mut self, participant: PlayerId) -> Option<u64> {
        let from = self.scheduler.remove_participant(participant)?;
        for report in self.auditor.remove_participant(participant) {
            self.flag_desync(report);
        }
        Some(from)
    }

    /// Advance by at most one frame. Returns the executed frame's result, or
    /// `None` if the scheduler is still waiting (which counts toward the
    /// stall timeout).
    pub fn update(&mut self) -> Result<Option<FrameResult>, SessionError> {
        if !self.started {
            return Err(SessionError::NotStarted);
        }
        if let Some(report) = &self.desync {
            return Err(SessionError::Desync(report.clone()));
        }

        let Some(batch) = self.scheduler.poll() else {
            if let SchedulerState::SessionAborted { frame, waiting_on } = self.scheduler.tick() {
                return Err(SessionError::Aborted {
                    frame: *frame,
                    waiting_on: waiting_on.clone(),
                });
            }
            return Ok(None);
        };

        let result = self.sim.step_frame(&batch.records)?;
        let now = self.sim.frame;

        if self.auditor.should_audit(now) {
            let checksum = self.sim.checksum();
            debug!(participant = %self.local, frame = now, checksum, "audit");
            self.outbox.push(Outgoing::Checksum { frame: now, checksum });
            if let Some(report) = self.auditor.record(now, self.local, checksum) {
                self.flag_desync(report);
            }
        }

        self.seal(batch.frame + self.serializer.latency_window())?;
        Ok(Some(result))
    }

    /// Messages to broadcast, in the order they were produced.
    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_notices(&mut self) -> Vec<SchedulerNotice> {
        self.scheduler.drain_notices()
    }

    // -- Local UI state -----------------------------------------------------

    pub fn select(&mut self, units: impl IntoIterator<Item = UnitId>) {
        self.selection = units.into_iter().collect();
    }

    pub fn selection(&self) -> &BTreeSet<UnitId> {
        &self.selection
    }

    // -- Internals ----------------------------------------------------------

    fn seal(&mut self, frame: u64) -> Result<(), SessionError> {
        let (records, later): (Vec<EventRecord>, Vec<EventRecord>) =
            std::mem::take(&mut self.pending).into_iter().partition(|r| r.frame == frame);
        self.pending = later;
        self.scheduler.submit(self.local, frame, records.clone())?;
        self.outbox.push(Outgoing::FrameInput { frame, records });
        Ok(())
    }

    fn flag_desync(&mut self, report: DesyncReport) {
        warn!(
            participant = %self.local,
            frame = report.frame,
            diverging = ?report.diverging,
            "desync detected"
        );
        if self.desync.is_none() {
            self.desync = Some(report);
        }
    }
}

fn log_notice(local: PlayerId, notice: &SchedulerNotice) {
    match notice {
        SchedulerNotice::WaitingOn { frame, participant } => {
            warn!(%local, frame, %participant, "waiting on participant");
        }
        SchedulerNotice::Resumed { frame } => info!(%local, frame, "resumed"),
        SchedulerNotice::ParticipantLeft { participant, from_frame } => {
            info!(%local, %participant, from_frame, "participant left");
        }
        SchedulerNotice::Aborted { frame, waiting_on } => {
            warn!(%local, frame, ?waiting_on, "session aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::types::CellCoord;

    const A: PlayerId = PlayerId(0);
    const B: PlayerId = PlayerId(1);

    fn config() -> SessionConfig {
        SessionConfig {
            map: MapConfig::open(16, 16),
            checksum_interval: 10,
            stall_timeout: 3,
            abort_ceiling: 6,
            ..SessionConfig::default()
        }
    }

    fn pair() -> Vec<LockstepSession> {
        let mut peers: Vec<_> = [A, B]
            .into_iter()
            .map(|p| LockstepSession::new(p, &[A, B], config(), 7).unwrap())
            .collect();
        for peer in &mut peers {
            peer.start().unwrap();
        }
        peers
    }

    /// Deliver every peer's outbox to every other peer.
    fn exchange(peers: &mut [LockstepSession]) {
        let mail: Vec<(PlayerId, Vec<Outgoing>)> =
            peers.iter_mut().map(|p| (p.local(), p.drain_outbox())).collect();
        for (from, messages) in mail {
            for peer in peers.iter_mut().filter(|p| p.local() != from) {
                for msg in &messages {
                    match msg.clone() {
                        Outgoing::FrameInput { frame, records } => {
                            peer.receive_input(from, frame, records).unwrap();
                        }
                        Outgoing::Checksum { frame, checksum } => {
                            peer.receive_checksum(from, frame, checksum);
                        }
                    }
                }
            }
        }
    }

    fn tick_all(peers: &mut [LockstepSession]) {
        exchange(peers);
        for peer in peers.iter_mut() {
            peer.update().unwrap();
        }
    }

    #[test]
    fn issued_action_executes_after_latency_window() {
        let mut peers = pair();
        let record = peers[0].issue(SimAction::Spawn {
            template: "tank".into(),
            cell: CellCoord::new(5, 5),
        });
        assert_eq!(record.frame, 2);
        for _ in 0..2 {
            tick_all(&mut peers);
            assert!(peers[0].sim().units.is_empty());
        }
        tick_all(&mut peers);
        assert_eq!(peers[0].sim().units.len(), 1);
        assert_eq!(peers[1].sim().units.len(), 1);
    }

    #[test]
    fn peers_stay_identical() {
        let mut peers = pair();
        peers[0].issue(SimAction::Spawn {
            template: "rifleman".into(),
            cell: CellCoord::new(2, 2),
        });
        peers[1].issue(SimAction::Spawn {
            template: "tank".into(),
            cell: CellCoord::new(12, 12),
        });
        for _ in 0..5 {
            tick_all(&mut peers);
        }
        peers[0].issue(SimAction::Attack {
            unit: UnitId(1),
            target: UnitId(2),
        });
        peers[1].issue(SimAction::Attack {
            unit: UnitId(2),
            target: UnitId(1),
        });
        for _ in 0..60 {
            tick_all(&mut peers);
        }
        assert_eq!(peers[0].current_frame(), peers[1].current_frame());
        assert_eq!(peers[0].sim(), peers[1].sim());
        assert!(peers.iter().all(|p| p.desync().is_none()));
        assert!(peers[0].auditor().recorded(50, B).is_some());
    }

    #[test]
    fn no_frame_without_remote_input() {
        let mut peers = pair();
        // Only the local lead-in is known; B has sent nothing.
        assert!(peers[0].update().unwrap().is_none());
        assert_eq!(peers[0].current_frame(), 0);
    }

    #[test]
    fn silent_peer_stalls_then_aborts() {
        let mut a = LockstepSession::new(A, &[A, B], config(), 7).unwrap();
        a.start().unwrap();
        for _ in 0..2 {
            a.update().unwrap();
        }
        assert_eq!(a.status(), SessionStatus::Running);
        a.update().unwrap();
        assert_eq!(
            a.status(),
            SessionStatus::Stalled {
                frame: 0,
                waiting_on: vec![B]
            }
        );
        for _ in 0..3 {
            a.update().unwrap();
        }
        assert!(matches!(a.update(), Err(SessionError::Aborted { frame: 0, .. })));
        assert!(matches!(a.status(), SessionStatus::Aborted { .. }));
    }

    #[test]
    fn corrupted_peer_is_named_at_next_audit() {
        let mut peers = pair();
        for _ in 0..12 {
            tick_all(&mut peers);
        }
        peers[1].sim_mut_for_testing().corrupt_for_testing();
        let mut failed = false;
        for _ in 0..20 {
            exchange(&mut peers);
            for peer in peers.iter_mut() {
                if peer.update().is_err() {
                    failed = true;
                }
            }
        }
        assert!(failed);
        for peer in &peers {
            let report = peer.desync().unwrap();
            assert_eq!(report.frame, 20);
            assert_eq!(report.diverging, vec![B]);
        }
    }

    #[test]
    fn departed_peer_no_longer_blocks() {
        let mut peers = pair();
        for _ in 0..3 {
            tick_all(&mut peers);
        }
        exchange(&mut peers);
        let mut a = peers.remove(0);
        a.remove_participant(B);
        for _ in 0..10 {
            a.update().unwrap();
            a.drain_outbox();
        }
        assert!(a.current_frame() >= 10);
        assert_eq!(a.status(), SessionStatus::Running);
    }

    #[test]
    fn config_mismatch_is_rejected() {
        let a = LockstepSession::new(A, &[A, B], config(), 7).unwrap();
        let other = SessionConfig {
            latency_window: 5,
            ..config()
        };
        assert!(a.verify_remote_config(a.config_hash()).is_ok());
        assert!(matches!(
            a.verify_remote_config(other.config_hash()),
            Err(SessionError::ConfigMismatch { .. })
        ));
    }

    #[test]
    fn selection_is_not_part_of_the_checksum() {
        let mut peers = pair();
        peers[0].issue(SimAction::Spawn {
            template: "tank".into(),
            cell: CellCoord::new(3, 3),
        });
        for _ in 0..4 {
            tick_all(&mut peers);
        }
        peers[0].select([UnitId(1)]);
        assert_eq!(peers[0].selection().len(), 1);
        assert_eq!(peers[0].sim().checksum(), peers[1].sim().checksum());
    }

    #[test]
    fn update_before_start_is_an_error() {
        let mut a = LockstepSession::new(A, &[A, B], config(), 7).unwrap();
        assert_eq!(a.status(), SessionStatus::Lobby);
        assert!(matches!(a.update(), Err(SessionError::NotStarted)));
        assert!(matches!(
            LockstepSession::new(PlayerId(5), &[A, B], config(), 7),
            Err(SessionError::UnknownParticipant(PlayerId(5)))
        ));
    }
}
