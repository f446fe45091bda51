// Error types for the engine and the lockstep session.
//
// Per-unit failures (path failures, disjoint paths) never surface here; the
// engine absorbs them into unit state and narrative events. What remains are
// caller errors (feeding the engine the wrong frame) and session-level
// conditions the host has to act on.
//
// See also: `scheduler.rs` for `ScheduleError`, `config.rs` for
// `ConfigError`, `checksum.rs` for `DesyncReport`.

use thiserror::Error;

use crate::checksum::DesyncReport;
use crate::config::ConfigError;
use crate::scheduler::ScheduleError;
use crate::types::PlayerId;

/// The engine refused a frame's record list. State is left untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("engine is at frame {expected}, but a record targets frame {got}")]
    WrongFrame { expected: u64, got: u64 },
    #[error("records for frame {frame} are not in (participant, sequence) order")]
    Unsorted { frame: u64 },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("remote config hash {remote:#018x} does not match local {local:#018x}")]
    ConfigMismatch { local: u64, remote: u64 },
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error("session has not started")]
    NotStarted,
    #[error("{0} is not part of this session")]
    UnknownParticipant(PlayerId),
    #[error("desync at frame {}: {:?} diverged", .0.frame, .0.diverging)]
    Desync(DesyncReport),
    #[error("session aborted at frame {frame} waiting on {waiting_on:?}")]
    Aborted { frame: u64, waiting_on: Vec<PlayerId> },
}
