// Per-hop link sequencing: exactly-once, in-order delivery over a transport
// that may reorder, duplicate, or corrupt packets.
//
// Each direction of a link has a `LinkSender` and a `LinkReceiver`. The sender
// stamps every data packet with the next `LinkSequence` and keeps a bounded
// history of what it sent. The receiver delivers bodies strictly in sequence
// order: duplicates are dropped, packets from the future are parked until the
// gap fills, and a packet that fails its integrity check is discarded and
// reported so the owner can ask for a resend with a nack.
//
// A nack means "resend everything from sequence N onward". Resending the whole
// tail rather than one packet keeps the receiver stateless about which holes
// it has already asked for; anything it already has is dropped as a duplicate.
//
// This module only transforms bytes. Whether a corrupt packet triggers a nack
// or a disconnect is the channel's decision, because only the channel knows
// whether its transport can retransmit.

use std::collections::{BTreeMap, VecDeque};

use crate::codec::{Packet, PacketKind, decode_packet, encode_packet};
use crate::error::{CodecError, ProtocolError};
use crate::types::LinkSequence;

/// Default number of sent packets kept for retransmission.
pub const DEFAULT_HISTORY: usize = 1024;

/// Default number of out-of-order packets a receiver will park.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Sending half of a link.
#[derive(Debug)]
pub struct LinkSender {
    next: u64,
    /// Encoded packets, oldest first, for answering nacks.
    history: VecDeque<(LinkSequence, Vec<u8>)>,
    capacity: usize,
}

impl LinkSender {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    pub fn with_history(capacity: usize) -> Self {
        Self {
            next: 0,
            history: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Sequence number the next `wrap` will use.
    pub fn next_sequence(&self) -> LinkSequence {
        LinkSequence(self.next)
    }

    /// Stamp `body` with the next sequence, encode it, and remember the
    /// encoded bytes for retransmission.
    pub fn wrap(&mut self, body: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        let seq = LinkSequence(self.next);
        let wire = encode_packet(&Packet::data(seq, body))?;
        self.next += 1;
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back((seq, wire.clone()));
        Ok(wire)
    }

    /// Encoded packets with sequence `>= from`, in order.
    pub fn resend_from(&self, from: LinkSequence) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let oldest = self.history.front().map(|(seq, _)| *seq);
        match oldest {
            Some(oldest_seq) if from < oldest_seq => Err(ProtocolError::RetransmitUnavailable {
                requested: from,
                oldest,
            }),
            _ => Ok(self
                .history
                .iter()
                .filter(|(seq, _)| *seq >= from)
                .map(|(_, wire)| wire.clone())
                .collect()),
        }
    }
}

impl Default for LinkSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a nack asking for everything from `from` onward.
pub fn encode_nack(from: LinkSequence) -> Result<Vec<u8>, CodecError> {
    encode_packet(&Packet::nack(from))
}

/// What happened when the receiver accepted one raw packet.
#[derive(Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// Bodies now deliverable, in sequence order. May be more than one when
    /// a gap was just filled.
    Delivered(Vec<Vec<u8>>),
    /// Parked until the gap before it fills. `missing_from` is the first
    /// sequence still outstanding.
    Parked { missing_from: LinkSequence },
    /// Already delivered; dropped.
    Duplicate(LinkSequence),
    /// The far side wants packets resent from this sequence.
    ResendRequested(LinkSequence),
    /// Failed to decode. `resend_from` is where a nack should start.
    Corrupt {
        error: CodecError,
        resend_from: LinkSequence,
    },
    /// Parked too many packets; this one was dropped. A nack from
    /// `resend_from` recovers it.
    Overflow { resend_from: LinkSequence },
}

/// Receiving half of a link.
#[derive(Debug)]
pub struct LinkReceiver {
    next_expected: u64,
    pending: BTreeMap<u64, Vec<u8>>,
    max_pending: usize,
}

impl LinkReceiver {
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            next_expected: 0,
            pending: BTreeMap::new(),
            max_pending,
        }
    }

    pub fn next_expected(&self) -> LinkSequence {
        LinkSequence(self.next_expected)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Accept one raw packet from the transport.
    pub fn accept(&mut self, raw: &[u8]) -> LinkEvent {
        let packet = match decode_packet(raw) {
            Ok(packet) => packet,
            Err(error) => {
                return LinkEvent::Corrupt {
                    error,
                    resend_from: self.next_expected(),
                };
            }
        };

        if packet.kind == PacketKind::Nack {
            return LinkEvent::ResendRequested(packet.link_seq);
        }

        let seq = packet.link_seq.0;
        if seq < self.next_expected || self.pending.contains_key(&seq) {
            return LinkEvent::Duplicate(packet.link_seq);
        }
        if seq > self.next_expected {
            if self.pending.len() >= self.max_pending {
                return LinkEvent::Overflow {
                    resend_from: self.next_expected(),
                };
            }
            self.pending.insert(seq, packet.body);
            return LinkEvent::Parked {
                missing_from: self.next_expected(),
            };
        }

        let mut delivered = vec![packet.body];
        self.next_expected += 1;
        while let Some(body) = self.pending.remove(&self.next_expected) {
            delivered.push(body);
            self.next_expected += 1;
        }
        LinkEvent::Delivered(delivered)
    }
}

impl Default for LinkReceiver {
    fn default() -> Self {
        Self::new()
    }
}
