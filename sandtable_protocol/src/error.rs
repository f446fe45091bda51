// Error types for the packet codec and link layer.
//
// `CodecError` covers everything that can be wrong with a single packet's
// bytes; the link layer turns it into a retransmit request or, on transports
// that cannot retransmit, a fatal disconnect. `ProtocolError` covers link
// state that no single packet explains.

use thiserror::Error;

use crate::types::LinkSequence;

/// A packet failed to decode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet truncated: {len} bytes")]
    Truncated { len: usize },
    #[error("unsupported packet version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("body length {declared} does not match {actual} bytes on the wire")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("integrity check failed: expected {expected:#010x}, computed {computed:#010x}")]
    IntegrityMismatch { expected: u32, computed: u32 },
    #[error("body of {0} bytes exceeds the packet limit")]
    BodyTooLarge(usize),
    #[error("compression failed: {0}")]
    Compress(String),
    #[error("decompression failed: {0}")]
    Decompress(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The peer asked for packets we no longer keep.
    #[error("cannot retransmit from {requested:?}; oldest retained is {oldest:?}")]
    RetransmitUnavailable {
        requested: LinkSequence,
        oldest: Option<LinkSequence>,
    },
}
