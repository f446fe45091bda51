// Byte transports underneath the event channel.
//
// A `Transport` moves opaque encoded packets (see
// `sandtable_protocol::codec`) between two endpoints. It never inspects
// them. Two implementations:
//
// - `MemoryTransport`: an in-process pair over `mpsc`. Used by tests and by
//   anything that wants two peers in one process. Carries fault injection
//   (corrupt or drop the next N outgoing packets) so the channel's
//   integrity and retransmit paths can be exercised deterministically.
// - `TcpTransport`: length-framed packets over a `TcpStream`. A background
//   reader thread does the blocking reads and pushes whole frames into an
//   `mpsc` inbox, so `try_recv` never blocks the caller. The owning thread
//   is the only writer.
//
// Disconnects surface as `TransportError::Disconnected` from either `send`
// or `try_recv`; the channel treats that as fatal.
//
// See also: `channel.rs` which layers link sequencing and nacks on top.

use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sandtable_protocol::framing::{read_frame, write_frame};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("transport I/O: {0}")]
    Io(#[from] io::Error),
}

/// A bidirectional packet pipe.
pub trait Transport: Send {
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    /// Next received packet, or `None` if nothing is waiting.
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Block up to `timeout` for the next packet.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    /// Whether the far side keeps a send history and answers nacks. Without
    /// it, a corrupt packet cannot be recovered and the link must drop.
    fn supports_retransmit(&self) -> bool;

    /// Stop sending and receiving. Idempotent.
    fn close(&mut self);
}

impl Transport for Box<dyn Transport> {
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        (**self).send(packet)
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).try_recv()
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).recv_timeout(timeout)
    }

    fn supports_retransmit(&self) -> bool {
        (**self).supports_retransmit()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// One end of an in-process link.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Option<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
    retransmit: bool,
    corrupt_next: u32,
    drop_next: u32,
}

impl MemoryTransport {
    /// A connected pair. Both ends answer nacks.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }

    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            tx: Some(tx),
            rx,
            retransmit: true,
            corrupt_next: 0,
            drop_next: 0,
        }
    }

    /// Declare whether this end's peer can retransmit.
    pub fn with_retransmit(mut self, retransmit: bool) -> Self {
        self.retransmit = retransmit;
        self
    }

    /// Flip one byte in each of the next `n` outgoing packets.
    pub fn corrupt_next_sends(&mut self, n: u32) {
        self.corrupt_next = n;
    }

    /// Silently lose the next `n` outgoing packets.
    pub fn drop_next_sends(&mut self, n: u32) {
        self.drop_next = n;
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Disconnected)?;
        if self.drop_next > 0 {
            self.drop_next -= 1;
            debug!(len = packet.len(), "memory transport dropped packet");
            return Ok(());
        }
        let mut bytes = packet.to_vec();
        if self.corrupt_next > 0 && !bytes.is_empty() {
            self.corrupt_next -= 1;
            let mid = bytes.len() / 2;
            bytes[mid] ^= 0x5a;
        }
        tx.send(bytes).map_err(|_| TransportError::Disconnected)
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.try_recv() {
            Ok(bytes) => Ok(Some(bytes)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn supports_retransmit(&self) -> bool {
        self.retransmit
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// Length-framed packets over TCP with a background reader thread.
#[derive(Debug)]
pub struct TcpTransport {
    writer: Option<BufWriter<TcpStream>>,
    inbox: Receiver<Vec<u8>>,
    peer: Option<SocketAddr>,
    _reader: JoinHandle<()>,
}

impl TcpTransport {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream)
    }

    /// Take ownership of an accepted or connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(false)?;
        let peer = stream.peer_addr().ok();
        let reader = BufReader::new(stream.try_clone()?);
        let (tx, inbox) = mpsc::channel();
        let handle = thread::spawn(move || reader_loop(reader, tx));
        Ok(Self {
            writer: Some(BufWriter::new(stream)),
            inbox,
            peer,
            _reader: handle,
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Disconnected)?;
        match write_frame(writer, packet) {
            Ok(()) => Ok(()),
            Err(e) if is_disconnect(&e) => Err(TransportError::Disconnected),
            Err(e) => Err(e.into()),
        }
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.inbox.try_recv() {
            Ok(bytes) => Ok(Some(bytes)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match self.inbox.recv_timeout(timeout) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn supports_retransmit(&self) -> bool {
        true
    }

    fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            // Unblocks the reader thread too.
            let _ = writer.get_ref().shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Read frames until EOF or error. Dropping `tx` on exit is what reports
/// the disconnect to the owner.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: Sender<Vec<u8>>) {
    loop {
        match read_frame(&mut reader) {
            Ok(frame) => {
                if tx.send(frame).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "tcp reader stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn memory_pair_is_bidirectional() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send(b"ping").unwrap();
        b.send(b"pong").unwrap();
        assert_eq!(b.try_recv().unwrap(), Some(b"ping".to_vec()));
        assert_eq!(a.try_recv().unwrap(), Some(b"pong".to_vec()));
        assert_eq!(a.try_recv().unwrap(), None);
    }

    #[test]
    fn memory_fault_injection() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.corrupt_next_sends(1);
        a.drop_next_sends(0);
        a.send(b"abcd").unwrap();
        a.send(b"abcd").unwrap();
        assert_ne!(b.try_recv().unwrap(), Some(b"abcd".to_vec()));
        assert_eq!(b.try_recv().unwrap(), Some(b"abcd".to_vec()));

        a.drop_next_sends(1);
        a.send(b"lost").unwrap();
        a.send(b"kept").unwrap();
        assert_eq!(b.try_recv().unwrap(), Some(b"kept".to_vec()));
    }

    #[test]
    fn closing_one_end_disconnects_the_other() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.close();
        assert!(matches!(a.send(b"x"), Err(TransportError::Disconnected)));
        assert!(matches!(b.try_recv(), Err(TransportError::Disconnected)));
    }

    #[test]
    fn tcp_round_trip_and_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpTransport::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let mut server = TcpTransport::from_stream(stream).unwrap();

        client.send(b"hello").unwrap();
        let got = server.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));

        client.close();
        let mut saw_disconnect = false;
        for _ in 0..100 {
            match server.recv_timeout(Duration::from_millis(50)) {
                Err(TransportError::Disconnected) => {
                    saw_disconnect = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_disconnect);
    }
}
