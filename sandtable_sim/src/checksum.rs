// World-state checksum and the integrity auditor.
//
// `StateHasher` is a streaming FNV-1a 64-bit hasher. Every multi-byte value
// is fed little-endian so the result is the same on every platform.
// `state_checksum` walks the deterministic world state in a fixed order:
// frame counter, RNG state, every unit (ascending id), every player
// (ascending id), then the static layer of the grid. Occupancy counters and
// reservations are derived from unit state and are left out; so is anything
// local to one peer (selection, pending outbox, logs).
//
// `IntegrityAuditor` records one checksum per participant per audit frame
// (`frame % checksum_interval == 0`, frame > 0) and compares them once every
// expected participant has reported. Any disagreement produces a
// `DesyncReport` naming the diverging participants. The majority value is
// taken as the reference; on a tie the group containing the lowest
// participant id is the reference. Reports are never retracted and a
// recorded checksum is never overwritten. Once a frame is judged its
// checksums move to a short history and later reports for it, or for any
// earlier frame, are ignored.
//
// See also: `sim.rs` for `SimState`, `session.rs` which calls the auditor
// after each audited frame and exchanges checksums over the channel.
//
// **Critical constraint: determinism.** The checksum must depend only on
// simulation state. Never hash anything keyed by address, time, or hash-map
// iteration order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::sim::SimState;
use crate::types::{Obstacle, PlayerId};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Streaming FNV-1a (64-bit).
#[derive(Clone, Debug)]
pub struct StateHasher {
    hash: u64,
}

impl Default for StateHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHasher {
    pub fn new() -> Self {
        Self { hash: FNV_OFFSET }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.hash = (self.hash ^ u64::from(v)).wrapping_mul(FNV_PRIME);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_u8(b);
        }
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn finish(&self) -> u64 {
        self.hash
    }
}

/// Canonical checksum of the deterministic world state.
pub fn state_checksum(sim: &SimState) -> u64 {
    let mut h = StateHasher::new();
    h.write_u64(sim.frame);
    for word in sim.rng.state_words() {
        h.write_u64(word);
    }
    h.write_u64(sim.rng.draws());
    h.write_u32(sim.next_unit_id);

    h.write_u32(sim.units.len() as u32);
    for unit in sim.units.values() {
        h.write_u32(unit.id.0);
        h.write_u8(unit.owner.0);
        h.write_u8(unit.kind.tag().index());
        h.write_u16(unit.health);
        h.write_i32(unit.position.x);
        h.write_i32(unit.position.y);
        h.write_i32(unit.cell.x);
        h.write_i32(unit.cell.y);
        h.write_u8(unit.facing.0);
        h.write_u8(unit.order.tag());
        h.write_u32(unit.path.steps.len() as u32);
        h.write_u16(unit.path_delay);
        h.write_u16(unit.weapon_cooldown);
        h.write_u16(unit.build_progress);
    }

    h.write_u32(sim.players.len() as u32);
    for (id, player) in &sim.players {
        h.write_u8(id.0);
        h.write_u32(player.credits);
        h.write_i32(player.rally.x);
        h.write_i32(player.rally.y);
        h.write_u32(player.production.len() as u32);
        for item in &player.production {
            h.write_bytes(item.template.as_bytes());
            h.write_u16(item.remaining);
        }
    }

    h.write_u64(sim.grid.structure_version());
    for (_, cell) in sim.grid.iter() {
        h.write_u8(cell.terrain.index() as u8);
        match cell.obstacle {
            None => h.write_u8(0),
            Some(Obstacle::Rock) => h.write_u8(1),
            Some(Obstacle::Wall { hp }) => {
                h.write_u8(2);
                h.write_u16(hp);
            }
        }
    }
    h.finish()
}

// ---------------------------------------------------------------------------
// Auditor
// ---------------------------------------------------------------------------

/// Two or more participants disagreed about the state at `frame`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesyncReport {
    pub frame: u64,
    pub checksums: BTreeMap<PlayerId, u64>,
    /// Participants whose checksum differs from the reference value.
    pub diverging: Vec<PlayerId>,
}

/// Decide which participants diverge from the reference checksum. Empty when
/// everyone agrees.
pub fn find_diverging(checksums: &BTreeMap<PlayerId, u64>) -> Vec<PlayerId> {
    let mut groups: BTreeMap<u64, Vec<PlayerId>> = BTreeMap::new();
    for (&p, &sum) in checksums {
        groups.entry(sum).or_default().push(p);
    }
    if groups.len() <= 1 {
        return Vec::new();
    }
    // Largest group wins; ties go to the group holding the lowest id.
    // Members are pushed in ascending order, so `members[0]` is the lowest.
    let reference = groups
        .iter()
        .max_by(|(_, a), (_, b)| a.len().cmp(&b.len()).then(b[0].cmp(&a[0])))
        .map(|(&sum, _)| sum);
    checksums
        .iter()
        .filter(|&(_, &sum)| Some(sum) != reference)
        .map(|(&p, _)| p)
        .collect()
}

/// Judged frames whose checksums stay readable through `recorded`.
const JUDGED_HISTORY: usize = 8;

#[derive(Clone, Debug)]
pub struct IntegrityAuditor {
    interval: u64,
    expected: BTreeSet<PlayerId>,
    /// Frames still waiting on at least one participant.
    pending: BTreeMap<u64, BTreeMap<PlayerId, u64>>,
    /// Most recently judged frames, oldest first.
    judged: VecDeque<(u64, BTreeMap<PlayerId, u64>)>,
    judged_through: Option<u64>,
    reports: Vec<DesyncReport>,
}

impl IntegrityAuditor {
    pub fn new(interval: u64, participants: impl IntoIterator<Item = PlayerId>) -> Self {
        Self {
            interval: interval.max(1),
            expected: participants.into_iter().collect(),
            pending: BTreeMap::new(),
            judged: VecDeque::new(),
            judged_through: None,
            reports: Vec::new(),
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Whether the state after executing up to `frame` is audited.
    pub fn should_audit(&self, frame: u64) -> bool {
        frame > 0 && frame.is_multiple_of(self.interval)
    }

    /// Checksum recorded for `participant` at `frame`, while the frame is
    /// pending or among the last few judged.
    pub fn recorded(&self, frame: u64, participant: PlayerId) -> Option<u64> {
        let slot = match self.pending.get(&frame) {
            Some(slot) => slot,
            None => self.judged.iter().find(|(f, _)| *f == frame).map(|(_, slot)| slot)?,
        };
        slot.get(&participant).copied()
    }

    /// Frames still waiting on a participant.
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    pub fn reports(&self) -> &[DesyncReport] {
        &self.reports
    }

    /// Record `participant`'s checksum for `frame`. A second value for the
    /// same slot is ignored. Returns a report if this completes a frame whose
    /// checksums disagree.
    pub fn record(&mut self, frame: u64, participant: PlayerId, checksum: u64) -> Option<DesyncReport> {
        if self.judged_through.is_some_and(|done| frame <= done) {
            debug!(frame, %participant, "checksum for an already judged frame ignored");
            return None;
        }
        let slot = self.pending.entry(frame).or_default();
        match slot.get(&participant) {
            Some(&existing) if existing != checksum => {
                warn!(frame, %participant, existing, checksum, "conflicting checksum ignored");
                return None;
            }
            Some(_) => return None,
            None => {
                slot.insert(participant, checksum);
            }
        }
        self.evaluate(frame)
    }

    /// Stop waiting for `participant`; frames it never reported are judged
    /// on the remaining participants.
    pub fn remove_participant(&mut self, participant: PlayerId) -> Vec<DesyncReport> {
        self.expected.remove(&participant);
        let frames: Vec<u64> = self.pending.keys().copied().collect();
        frames.into_iter().filter_map(|f| self.evaluate(f)).collect()
    }

    fn evaluate(&mut self, frame: u64) -> Option<DesyncReport> {
        let slot = self.pending.get(&frame)?;
        if !self.expected.iter().all(|p| slot.contains_key(p)) {
            return None;
        }
        let slot = self.pending.remove(&frame)?;
        // Every participant reports in frame order, so nothing below a
        // complete frame can still complete.
        self.pending.retain(|&f, _| f > frame);
        self.judged_through = Some(self.judged_through.map_or(frame, |done| done.max(frame)));

        let diverging = find_diverging(&slot);
        let report = (!diverging.is_empty()).then(|| DesyncReport {
            frame,
            checksums: slot.clone(),
            diverging,
        });
        self.judged.push_back((frame, slot));
        if self.judged.len() > JUDGED_HISTORY {
            self.judged.pop_front();
        }
        if let Some(report) = &report {
            self.reports.push(report.clone());
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PlayerId = PlayerId(0);
    const B: PlayerId = PlayerId(1);
    const C: PlayerId = PlayerId(2);

    #[test]
    fn fnv_matches_reference_vectors() {
        let h = StateHasher::new();
        assert_eq!(h.finish(), 0xcbf2_9ce4_8422_2325);
        let mut h = StateHasher::new();
        h.write_bytes(b"a");
        assert_eq!(h.finish(), 0xaf63_dc4c_8601_ec8c);
        let mut h = StateHasher::new();
        h.write_bytes(b"foobar");
        assert_eq!(h.finish(), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn audit_frames_skip_zero() {
        let auditor = IntegrityAuditor::new(50, [A, B]);
        assert!(!auditor.should_audit(0));
        assert!(!auditor.should_audit(49));
        assert!(auditor.should_audit(50));
        assert!(auditor.should_audit(100));
    }

    #[test]
    fn agreement_produces_no_report() {
        let mut auditor = IntegrityAuditor::new(50, [A, B]);
        assert_eq!(auditor.record(50, A, 7), None);
        assert_eq!(auditor.record(50, B, 7), None);
        assert!(auditor.reports().is_empty());
    }

    #[test]
    fn two_way_split_blames_the_higher_id() {
        let mut auditor = IntegrityAuditor::new(50, [A, B]);
        auditor.record(100, B, 9);
        let report = auditor.record(100, A, 7).unwrap();
        assert_eq!(report.frame, 100);
        assert_eq!(report.diverging, vec![B]);
    }

    #[test]
    fn majority_is_the_reference() {
        let mut auditor = IntegrityAuditor::new(50, [A, B, C]);
        auditor.record(50, A, 1);
        auditor.record(50, B, 2);
        let report = auditor.record(50, C, 2).unwrap();
        assert_eq!(report.diverging, vec![A]);
    }

    #[test]
    fn recorded_checksum_is_never_overwritten() {
        let mut auditor = IntegrityAuditor::new(50, [A, B]);
        auditor.record(50, A, 1);
        auditor.record(50, A, 2);
        assert_eq!(auditor.recorded(50, A), Some(1));
        assert_eq!(auditor.record(50, B, 1), None);
    }

    #[test]
    fn departure_releases_a_waiting_frame() {
        let mut auditor = IntegrityAuditor::new(50, [A, B, C]);
        auditor.record(50, A, 1);
        auditor.record(50, B, 2);
        let reports = auditor.remove_participant(C);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].diverging, vec![B]);
    }

    #[test]
    fn judged_frames_are_pruned() {
        let mut auditor = IntegrityAuditor::new(10, [A, B]);
        for frame in (10..=1000).step_by(10) {
            auditor.record(frame, A, frame);
            auditor.record(frame, B, frame);
        }
        assert_eq!(auditor.pending_frames(), 0);
        assert_eq!(auditor.judged.len(), JUDGED_HISTORY);
        assert_eq!(auditor.recorded(1000, B), Some(1000));
        assert_eq!(auditor.recorded(10, B), None, "old frames are forgotten");
    }

    #[test]
    fn late_report_for_a_judged_frame_is_ignored() {
        let mut auditor = IntegrityAuditor::new(50, [A, B]);
        auditor.record(50, A, 1);
        auditor.record(50, B, 1);
        assert_eq!(auditor.record(50, B, 9), None);
        assert_eq!(auditor.record(50, C, 9), None);
        assert_eq!(auditor.recorded(50, B), Some(1));
        assert_eq!(auditor.pending_frames(), 0);
        assert!(auditor.reports().is_empty());
    }

    #[test]
    fn report_is_issued_once() {
        let mut auditor = IntegrityAuditor::new(50, [A, B]);
        auditor.record(50, A, 1);
        assert!(auditor.record(50, B, 2).is_some());
        assert!(auditor.remove_participant(B).is_empty());
        assert_eq!(auditor.reports().len(), 1);
    }
}
