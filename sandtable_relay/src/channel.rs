// Event channel: exactly-once, in-order message delivery over a transport.
//
// `EventChannel` is the only way lockstep traffic crosses a process
// boundary. It owns one `Transport` plus the two halves of a link
// (`LinkSender` / `LinkReceiver` from the protocol crate) and turns typed
// messages into sequenced, checksummed, optionally compressed packets and
// back.
//
// Failure policy:
// - Transport disconnect: `ChannelError::Transport`, fatal to the link.
// - Corrupt packet: discarded. If the transport can retransmit, a nack asks
//   the far side to resend from the first missing sequence and the channel
//   keeps going; otherwise `ChannelError::Integrity`, treated as a
//   disconnect.
// - A body that decodes as a packet but not as a message: fatal, the peer
//   is speaking a different protocol.
//
// Duplicates (from resends) are dropped silently; out-of-order packets wait
// in the link receiver until the gap fills. The caller sees each message
// once, in the order the far side sent it.
//
// Nacks: a packet parked behind a gap nacks the gap once. Every corrupt
// packet nacks, since the resend may itself have been damaged.
//
// See also: `transport.rs`, `sandtable_protocol::link` for the sequencing
// rules, `client.rs` and `session.rs` which own channels.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use sandtable_protocol::{CodecError, LinkEvent, LinkReceiver, LinkSender, LinkSequence, ProtocolError, encode_nack};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("corrupt packet on a link without retransmission: {0}")]
    Integrity(CodecError),
    #[error("could not encode packet: {0}")]
    Encode(#[from] CodecError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("message body is not valid: {0}")]
    Message(#[from] serde_json::Error),
}

/// Counters for one channel, mostly for tests and logs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub corrupt: u64,
    pub nacks_sent: u64,
    pub resent: u64,
}

#[derive(Debug)]
pub struct EventChannel<T: Transport> {
    transport: T,
    sender: LinkSender,
    receiver: LinkReceiver,
    /// Delivered message bodies not yet handed to the caller.
    ready: VecDeque<Vec<u8>>,
    /// Last nack we sent, to avoid asking for the same tail repeatedly
    /// while the resend is in flight.
    last_nack: Option<LinkSequence>,
    stats: ChannelStats,
    closed: bool,
    /// Error hit while messages were still buffered; reported once those
    /// have been handed out.
    failure: Option<ChannelError>,
}

impl<T: Transport> EventChannel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            sender: LinkSender::new(),
            receiver: LinkReceiver::new(),
            ready: VecDeque::new(),
            last_nack: None,
            stats: ChannelStats::default(),
            closed: false,
            failure: None,
        }
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Serialize, sequence and send one message.
    pub fn send<M: Serialize>(&mut self, message: &M) -> Result<(), ChannelError> {
        if self.closed {
            return Err(TransportError::Disconnected.into());
        }
        let body = serde_json::to_vec(message)?;
        let packet = self.sender.wrap(body)?;
        self.transport.send(&packet)?;
        self.stats.sent += 1;
        Ok(())
    }

    /// Every message that has fully arrived, in send order. Never blocks.
    pub fn poll<M: DeserializeOwned>(&mut self) -> Result<Vec<M>, ChannelError> {
        self.pump_deferring()?;
        self.ready
            .drain(..)
            .map(|body| serde_json::from_slice(&body).map_err(ChannelError::from))
            .collect()
    }

    /// Wait up to `timeout` for one message. Used for handshakes.
    pub fn recv_timeout<M: DeserializeOwned>(&mut self, timeout: Duration) -> Result<Option<M>, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump_deferring()?;
            if let Some(body) = self.ready.pop_front() {
                return Ok(Some(serde_json::from_slice(&body)?));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if let Some(raw) = self.transport.recv_timeout(deadline - now)? {
                self.accept(&raw)?;
            }
        }
    }

    /// Shut the transport. Further sends fail.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport.close();
        }
    }

    /// Like `pump`, but an error behind already-delivered messages waits
    /// until the caller has drained them.
    fn pump_deferring(&mut self) -> Result<(), ChannelError> {
        if let Err(e) = self.pump() {
            if self.ready.is_empty() {
                return Err(e);
            }
            self.failure = Some(e);
        }
        Ok(())
    }

    fn pump(&mut self) -> Result<(), ChannelError> {
        if let Some(e) = self.failure.take() {
            return Err(e);
        }
        while let Some(raw) = self.transport.try_recv()? {
            self.accept(&raw)?;
        }
        Ok(())
    }

    fn accept(&mut self, raw: &[u8]) -> Result<(), ChannelError> {
        match self.receiver.accept(raw) {
            LinkEvent::Delivered(bodies) => {
                self.stats.delivered += bodies.len() as u64;
                self.last_nack = None;
                self.ready.extend(bodies);
            }
            LinkEvent::Parked { missing_from } => {
                debug!(?missing_from, "packet parked behind a gap");
                self.nack(missing_from)?;
            }
            LinkEvent::Duplicate(seq) => {
                self.stats.duplicates += 1;
                debug!(?seq, "duplicate packet dropped");
            }
            LinkEvent::ResendRequested(from) => {
                let packets = self.sender.resend_from(from)?;
                debug!(?from, count = packets.len(), "resending on nack");
                for packet in packets {
                    self.transport.send(&packet)?;
                    self.stats.resent += 1;
                }
            }
            LinkEvent::Corrupt { error, resend_from } => {
                self.stats.corrupt += 1;
                if !self.transport.supports_retransmit() {
                    warn!(%error, "corrupt packet, link cannot retransmit");
                    return Err(ChannelError::Integrity(error));
                }
                warn!(%error, ?resend_from, "corrupt packet discarded, requesting resend");
                self.last_nack = None;
                self.nack(resend_from)?;
            }
            LinkEvent::Overflow { resend_from } => {
                warn!(?resend_from, "reorder buffer full");
                self.nack(resend_from)?;
            }
        }
        Ok(())
    }

    /// Ask the far side to resend from `from`, unless that exact request is
    /// already outstanding.
    fn nack(&mut self, from: LinkSequence) -> Result<(), ChannelError> {
        if self.last_nack == Some(from) {
            return Ok(());
        }
        self.transport.send(&encode_nack(from)?)?;
        self.last_nack = Some(from);
        self.stats.nacks_sent += 1;
        Ok(())
    }
}
