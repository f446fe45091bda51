// Lockstep scheduler: decides when a frame may execute.
//
// Every active participant owes exactly one input per frame: its records for
// that frame, or an empty list meaning "no command this frame". The
// scheduler buffers inputs as they arrive (in any cross-participant order)
// and releases frame N only once every participant still active at N has
// supplied its input. The released batch is sorted by
// `(participant, sequence)`, so every peer hands the engine the exact same
// list.
//
// State machine:
//
//   WaitingForFrame(N) --all inputs for N--> FrameReady(N) --dispatch--> WaitingForFrame(N+1)
//   WaitingForFrame(N) --waited >= stall_timeout--> Stalled
//   Stalled --missing inputs arrive--> WaitingForFrame(N)
//   Stalled --waited > abort_ceiling--> SessionAborted (terminal)
//
// Waiting is counted in `tick()` calls, which the session makes once per
// frame interval whenever `poll()` had nothing to release. `tick()` checks
// readiness before counting, so input that lands exactly on the stall
// boundary resolves to WaitingForFrame rather than Stalled.
//
// Participants that leave mid-session stop owing input from a deterministic
// frame: one past the last frame they delivered input for. Every peer has
// received the same inputs from the leaver before the departure notice (the
// relay forwards in order), so every peer computes the same frame.
//
// Nothing here blocks. State changes are reported both through an optional
// notification callback and a drainable notice list.
//
// See also: `session.rs` which drives `poll`/`tick` and feeds batches to the
// engine, `command.rs` for `EventRecord`.
//
// **Critical constraint: determinism.** The released batch for a frame must
// be identical on every peer. Only ordered collections, and no record is
// ever released outside the frame it names.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::command::EventRecord;
use crate::types::PlayerId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    WaitingForFrame(u64),
    /// Transient: observable only from inside `poll`.
    FrameReady(u64),
    Stalled {
        frame: u64,
        waiting_on: Vec<PlayerId>,
    },
    SessionAborted {
        frame: u64,
        waiting_on: Vec<PlayerId>,
    },
}

/// Reported state changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulerNotice {
    /// Stalled on `participant`'s input for `frame`.
    WaitingOn { frame: u64, participant: PlayerId },
    /// A stall cleared.
    Resumed { frame: u64 },
    ParticipantLeft { participant: PlayerId, from_frame: u64 },
    Aborted { frame: u64, waiting_on: Vec<PlayerId> },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("{0} is not part of this session")]
    UnknownParticipant(PlayerId),
    #[error("{participant} sent input for frame {frame}, but frame {next} is already next")]
    AlreadyDispatched { participant: PlayerId, frame: u64, next: u64 },
    #[error("{participant} sent input for frame {frame} twice or out of order")]
    DuplicateInput { participant: PlayerId, frame: u64 },
    #[error("record ({participant}, {sequence}) does not belong to {expected} at frame {frame}")]
    MismatchedRecord {
        expected: PlayerId,
        frame: u64,
        participant: PlayerId,
        sequence: u64,
    },
    #[error("{participant} sequence went from {last} to {got}")]
    SequenceRegression { participant: PlayerId, last: u64, got: u64 },
    #[error("{participant} left before frame {frame}")]
    Departed { participant: PlayerId, frame: u64 },
    #[error("session aborted")]
    Aborted,
}

/// The ordered records for one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameBatch {
    pub frame: u64,
    pub records: Vec<EventRecord>,
}

type Notifier = Box<dyn FnMut(&SchedulerNotice) + Send>;

pub struct LockstepScheduler {
    state: SchedulerState,
    next_frame: u64,
    roster: BTreeSet<PlayerId>,
    /// Frame from which a departed participant no longer owes input.
    departed: BTreeMap<PlayerId, u64>,
    /// Buffered inputs: frame -> participant -> records.
    inputs: BTreeMap<u64, BTreeMap<PlayerId, Vec<EventRecord>>>,
    last_input_frame: BTreeMap<PlayerId, u64>,
    last_sequence: BTreeMap<PlayerId, u64>,
    waited: u64,
    stall_timeout: u64,
    abort_ceiling: u64,
    notices: Vec<SchedulerNotice>,
    notifier: Option<Notifier>,
}

impl fmt::Debug for LockstepScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockstepScheduler")
            .field("state", &self.state)
            .field("next_frame", &self.next_frame)
            .field("roster", &self.roster)
            .field("departed", &self.departed)
            .field("buffered_frames", &self.inputs.len())
            .field("waited", &self.waited)
            .finish()
    }
}

impl LockstepScheduler {
    pub fn new(
        participants: impl IntoIterator<Item = PlayerId>,
        stall_timeout: u64,
        abort_ceiling: u64,
    ) -> Self {
        Self {
            state: SchedulerState::WaitingForFrame(0),
            next_frame: 0,
            roster: participants.into_iter().collect(),
            departed: BTreeMap::new(),
            inputs: BTreeMap::new(),
            last_input_frame: BTreeMap::new(),
            last_sequence: BTreeMap::new(),
            waited: 0,
            stall_timeout,
            abort_ceiling,
            notices: Vec::new(),
            notifier: None,
        }
    }

    /// Install a callback invoked synchronously for every notice.
    pub fn set_notifier(&mut self, notifier: impl FnMut(&SchedulerNotice) + Send + 'static) {
        self.notifier = Some(Box::new(notifier));
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// The frame the scheduler will release next.
    pub fn next_frame(&self) -> u64 {
        self.next_frame
    }

    /// Frames waited on the current frame so far.
    pub fn waited(&self) -> u64 {
        self.waited
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.state, SchedulerState::SessionAborted { .. })
    }

    /// Participants that owe input for `frame`.
    pub fn required(&self, frame: u64) -> impl Iterator<Item = PlayerId> + '_ {
        self.roster
            .iter()
            .copied()
            .filter(move |p| self.departed.get(p).is_none_or(|&from| frame < from))
    }

    /// Participants that owe input for `frame` and have not supplied it.
    pub fn missing(&self, frame: u64) -> Vec<PlayerId> {
        let got = self.inputs.get(&frame);
        self.required(frame)
            .filter(|p| got.is_none_or(|m| !m.contains_key(p)))
            .collect()
    }

    fn is_ready(&self, frame: u64) -> bool {
        self.missing(frame).is_empty()
    }

    pub fn drain_notices(&mut self) -> Vec<SchedulerNotice> {
        std::mem::take(&mut self.notices)
    }

    fn notify(&mut self, notice: SchedulerNotice) {
        debug!(?notice, "scheduler notice");
        if let Some(cb) = self.notifier.as_mut() {
            cb(&notice);
        }
        self.notices.push(notice);
    }

    /// Buffer `participant`'s complete input for `frame`. An empty `records`
    /// is the explicit no-command marker.
    pub fn submit(
        &mut self,
        participant: PlayerId,
        frame: u64,
        records: Vec<EventRecord>,
    ) -> Result<(), ScheduleError> {
        if self.is_aborted() {
            return Err(ScheduleError::Aborted);
        }
        if !self.roster.contains(&participant) {
            return Err(ScheduleError::UnknownParticipant(participant));
        }
        if let Some(&from) = self.departed.get(&participant)
            && frame >= from
        {
            return Err(ScheduleError::Departed { participant, frame });
        }
        if frame < self.next_frame {
            return Err(ScheduleError::AlreadyDispatched {
                participant,
                frame,
                next: self.next_frame,
            });
        }
        if self.last_input_frame.get(&participant).is_some_and(|&last| frame <= last) {
            return Err(ScheduleError::DuplicateInput { participant, frame });
        }

        let mut last_seq = self.last_sequence.get(&participant).copied();
        for r in &records {
            if r.participant != participant || r.frame != frame {
                return Err(ScheduleError::MismatchedRecord {
                    expected: participant,
                    frame,
                    participant: r.participant,
                    sequence: r.sequence,
                });
            }
            if let Some(last) = last_seq
                && r.sequence <= last
            {
                return Err(ScheduleError::SequenceRegression {
                    participant,
                    last,
                    got: r.sequence,
                });
            }
            last_seq = Some(r.sequence);
        }
        if let Some(seq) = last_seq {
            self.last_sequence.insert(participant, seq);
        }
        self.last_input_frame.insert(participant, frame);
        self.inputs.entry(frame).or_default().insert(participant, records);

        self.refresh_stall();
        Ok(())
    }

    /// Stop expecting input from `participant` after the last frame it
    /// delivered. Returns the first frame it no longer owes.
    pub fn remove_participant(&mut self, participant: PlayerId) -> Option<u64> {
        if !self.roster.contains(&participant) || self.departed.contains_key(&participant) {
            return None;
        }
        let from = self
            .last_input_frame
            .get(&participant)
            .map_or(self.next_frame, |&last| (last + 1).max(self.next_frame));
        self.departed.insert(participant, from);
        self.notify(SchedulerNotice::ParticipantLeft {
            participant,
            from_frame: from,
        });
        self.refresh_stall();
        Some(from)
    }

    /// Release the next frame if every required input is present.
    pub fn poll(&mut self) -> Option<FrameBatch> {
        if self.is_aborted() {
            return None;
        }
        let frame = self.next_frame;
        if !self.is_ready(frame) {
            return None;
        }
        let was_stalled = matches!(self.state, SchedulerState::Stalled { .. });
        self.state = SchedulerState::FrameReady(frame);

        let mut records: Vec<EventRecord> = self
            .inputs
            .remove(&frame)
            .unwrap_or_default()
            .into_values()
            .flatten()
            .collect();
        records.sort_by_key(EventRecord::order_key);

        self.next_frame += 1;
        self.waited = 0;
        self.state = SchedulerState::WaitingForFrame(self.next_frame);
        if was_stalled {
            self.notify(SchedulerNotice::Resumed { frame });
        }
        Some(FrameBatch { frame, records })
    }

    /// Account for one frame interval spent without a releasable frame.
    pub fn tick(&mut self) -> &SchedulerState {
        if self.is_aborted() {
            return &self.state;
        }
        let frame = self.next_frame;
        if self.is_ready(frame) {
            self.refresh_stall();
            return &self.state;
        }

        self.waited += 1;
        let missing = self.missing(frame);
        if self.waited > self.abort_ceiling {
            self.state = SchedulerState::SessionAborted {
                frame,
                waiting_on: missing.clone(),
            };
            self.notify(SchedulerNotice::Aborted {
                frame,
                waiting_on: missing,
            });
        } else if self.waited >= self.stall_timeout {
            let newly_missing: Vec<PlayerId> = match &self.state {
                SchedulerState::Stalled { waiting_on, .. } => {
                    missing.iter().copied().filter(|p| !waiting_on.contains(p)).collect()
                }
                _ => missing.clone(),
            };
            self.state = SchedulerState::Stalled {
                frame,
                waiting_on: missing,
            };
            for participant in newly_missing {
                self.notify(SchedulerNotice::WaitingOn { frame, participant });
            }
        }
        &self.state
    }

    /// Re-evaluate a stall after new input or a departure.
    fn refresh_stall(&mut self) {
        let SchedulerState::Stalled { frame, .. } = self.state else {
            return;
        };
        let missing = self.missing(frame);
        if missing.is_empty() {
            self.state = SchedulerState::WaitingForFrame(frame);
            self.notify(SchedulerNotice::Resumed { frame });
        } else {
            self.state = SchedulerState::Stalled {
                frame,
                waiting_on: missing,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::command::SimAction;
    use crate::types::UnitId;
    use proptest::prelude::*;

    const A: PlayerId = PlayerId(0);
    const B: PlayerId = PlayerId(1);

    fn record(p: PlayerId, frame: u64, seq: u64) -> EventRecord {
        EventRecord {
            participant: p,
            frame,
            sequence: seq,
            action: SimAction::Stop { unit: UnitId(1) },
        }
    }

    fn two_player(stall: u64, abort: u64) -> LockstepScheduler {
        LockstepScheduler::new([A, B], stall, abort)
    }

    #[test]
    fn frame_waits_for_every_participant() {
        let mut s = two_player(5, 10);
        s.submit(A, 0, vec![]).unwrap();
        assert_eq!(s.poll(), None);
        assert_eq!(s.missing(0), vec![B]);
        s.submit(B, 0, vec![]).unwrap();
        let batch = s.poll().unwrap();
        assert_eq!(batch.frame, 0);
        assert!(batch.records.is_empty());
        assert_eq!(s.state(), &SchedulerState::WaitingForFrame(1));
    }

    #[test]
    fn batch_is_sorted_regardless_of_arrival() {
        let mut s = two_player(5, 10);
        s.submit(B, 0, vec![record(B, 0, 0), record(B, 0, 1)]).unwrap();
        s.submit(A, 0, vec![record(A, 0, 3)]).unwrap();
        let keys: Vec<_> = s.poll().unwrap().records.iter().map(EventRecord::order_key).collect();
        assert_eq!(keys, vec![(A, 3), (B, 0), (B, 1)]);
    }

    #[test]
    fn future_input_is_buffered_not_released_early() {
        let mut s = two_player(5, 10);
        s.submit(A, 1, vec![record(A, 1, 0)]).unwrap();
        s.submit(B, 1, vec![]).unwrap();
        assert_eq!(s.poll(), None, "frame 0 is still owed");
        s.submit(A, 0, vec![]).unwrap_err(); // A already moved past frame 0
    }

    #[test]
    fn stall_at_exactly_the_timeout() {
        let mut s = two_player(5, 10);
        s.submit(A, 0, vec![]).unwrap();
        for i in 1..5 {
            assert_eq!(s.tick(), &SchedulerState::WaitingForFrame(0), "tick {i}");
        }
        assert_eq!(
            s.tick(),
            &SchedulerState::Stalled {
                frame: 0,
                waiting_on: vec![B]
            }
        );
        assert_eq!(
            s.drain_notices(),
            vec![SchedulerNotice::WaitingOn {
                frame: 0,
                participant: B
            }]
        );
    }

    #[test]
    fn arrival_on_the_boundary_tick_resolves_to_waiting() {
        let mut s = two_player(5, 10);
        s.submit(A, 0, vec![]).unwrap();
        for _ in 1..5 {
            s.tick();
        }
        s.submit(B, 0, vec![]).unwrap();
        assert_eq!(s.tick(), &SchedulerState::WaitingForFrame(0));
        assert!(s.drain_notices().is_empty());
        assert!(s.poll().is_some());
    }

    #[test]
    fn stalled_resumes_on_receipt() {
        let mut s = two_player(2, 10);
        s.submit(A, 0, vec![]).unwrap();
        s.tick();
        s.tick();
        assert!(matches!(s.state(), SchedulerState::Stalled { .. }));
        s.drain_notices();
        s.submit(B, 0, vec![]).unwrap();
        assert_eq!(s.state(), &SchedulerState::WaitingForFrame(0));
        assert_eq!(s.drain_notices(), vec![SchedulerNotice::Resumed { frame: 0 }]);
        assert_eq!(s.poll().unwrap().frame, 0);
    }

    #[test]
    fn abort_only_beyond_the_ceiling() {
        let mut s = two_player(5, 10);
        for _ in 0..10 {
            s.tick();
        }
        assert!(matches!(s.state(), SchedulerState::Stalled { .. }));
        assert_eq!(
            s.tick(),
            &SchedulerState::SessionAborted {
                frame: 0,
                waiting_on: vec![A, B]
            }
        );
        // Terminal.
        assert_eq!(s.submit(A, 0, vec![]), Err(ScheduleError::Aborted));
        assert_eq!(s.poll(), None);
    }

    #[test]
    fn waiting_counter_resets_after_dispatch() {
        let mut s = two_player(3, 10);
        s.submit(A, 0, vec![]).unwrap();
        s.tick();
        s.tick();
        s.submit(B, 0, vec![]).unwrap();
        s.poll().unwrap();
        assert_eq!(s.waited(), 0);
        s.tick();
        s.tick();
        assert_eq!(s.state(), &SchedulerState::WaitingForFrame(1));
    }

    #[test]
    fn departed_participant_stops_owing_input() {
        let mut s = two_player(5, 10);
        s.submit(A, 0, vec![]).unwrap();
        s.submit(B, 0, vec![]).unwrap();
        s.submit(B, 1, vec![record(B, 1, 0)]).unwrap();
        assert_eq!(s.remove_participant(B), Some(2));
        s.submit(A, 1, vec![]).unwrap();
        s.submit(A, 2, vec![]).unwrap();

        assert_eq!(s.poll().unwrap().frame, 0);
        let f1 = s.poll().unwrap();
        assert_eq!(f1.records.len(), 1, "input delivered before leaving still counts");
        assert_eq!(s.poll().unwrap().frame, 2);
        assert_eq!(s.submit(B, 3, vec![]), Err(ScheduleError::Departed { participant: B, frame: 3 }));
    }

    #[test]
    fn departure_clears_a_stall() {
        let mut s = two_player(1, 10);
        s.submit(A, 0, vec![]).unwrap();
        s.tick();
        assert!(matches!(s.state(), SchedulerState::Stalled { .. }));
        s.remove_participant(B);
        assert_eq!(s.state(), &SchedulerState::WaitingForFrame(0));
        assert!(s.poll().is_some());
    }

    #[test]
    fn malformed_input_is_rejected() {
        let mut s = two_player(5, 10);
        assert_eq!(
            s.submit(PlayerId(9), 0, vec![]),
            Err(ScheduleError::UnknownParticipant(PlayerId(9)))
        );
        assert!(matches!(
            s.submit(A, 0, vec![record(B, 0, 0)]),
            Err(ScheduleError::MismatchedRecord { .. })
        ));
        assert!(matches!(
            s.submit(A, 0, vec![record(A, 1, 0)]),
            Err(ScheduleError::MismatchedRecord { .. })
        ));
        s.submit(A, 0, vec![record(A, 0, 5)]).unwrap();
        assert_eq!(
            s.submit(A, 1, vec![record(A, 1, 5)]),
            Err(ScheduleError::SequenceRegression {
                participant: A,
                last: 5,
                got: 5
            })
        );
        assert_eq!(
            s.submit(A, 0, vec![]),
            Err(ScheduleError::DuplicateInput { participant: A, frame: 0 })
        );
    }

    #[test]
    fn notifier_sees_every_notice() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut s = two_player(1, 2);
        s.set_notifier(move |n| sink.lock().unwrap().push(n.clone()));
        s.tick();
        s.tick();
        s.tick();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3, "two waiting-on notices then abort: {seen:?}");
        assert!(matches!(seen[2], SchedulerNotice::Aborted { frame: 0, .. }));
    }

    proptest! {
        #[test]
        fn release_order_ignores_arrival_order(
            a_count in 0u64..5,
            b_count in 0u64..5,
            c_count in 0u64..5,
            arrival in Just(vec![0usize, 1, 2]).prop_shuffle(),
        ) {
            let players = [PlayerId(0), PlayerId(1), PlayerId(2)];
            let counts = [a_count, b_count, c_count];
            let mut s = LockstepScheduler::new(players, 5, 10);
            for &i in &arrival {
                let recs = (0..counts[i]).map(|q| record(players[i], 0, q)).collect();
                s.submit(players[i], 0, recs).unwrap();
            }
            let batch = s.poll().unwrap();
            let keys: Vec<_> = batch.records.iter().map(EventRecord::order_key).collect();
            let mut sorted = keys.clone();
            sorted.sort();
            prop_assert_eq!(&keys, &sorted);
            prop_assert_eq!(keys.len() as u64, a_count + b_count + c_count);
        }
    }
}
