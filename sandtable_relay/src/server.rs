// TCP server loop for the relay.
//
// Architecture: one relay thread owns the `RelaySession` and every channel.
// Blocking reads live inside each `TcpTransport`'s reader thread, so the
// relay thread itself never blocks on a socket; it loops:
//
//   1. accept any pending connections (non-blocking listener), wrap each in
//      an `EventChannel`, and park it in the handshake queue;
//   2. poll handshake channels: the first message must be `Hello`, which is
//      handed to `RelaySession::add_player`; anything else, an error, or
//      silence past `HANDSHAKE_TIMEOUT` drops the connection;
//   3. `session.pump()` to forward traffic between admitted participants;
//   4. sleep for `poll_interval` when nothing happened.
//
// The relay thread is the only writer to any transport.
//
// Shutdown: `RelayHandle::stop` clears the `keep_running` flag and joins the
// thread; the listener and every transport are dropped with it.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use sandtable_protocol::ClientMessage;
use tracing::{debug, info, warn};

use crate::channel::EventChannel;
use crate::client::HANDSHAKE_TIMEOUT;
use crate::session::{JoinRequest, MAX_PLAYERS, RelaySession};
use crate::transport::TcpTransport;

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        self.wait();
    }

    /// Block until the relay thread exits on its own.
    pub fn wait(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    pub session_name: String,
    pub password: Option<String>,
    /// Clamped to `MAX_PLAYERS` by the session.
    pub max_players: u32,
    /// Idle sleep between polls.
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7979,
            session_name: "sandtable-session".into(),
            password: None,
            max_players: MAX_PLAYERS,
            poll_interval: Duration::from_millis(2),
        }
    }
}

/// Start the relay on a background thread. Returns a handle and the bound
/// address (port 0 lets the OS pick).
pub fn start_relay(config: RelayConfig) -> io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind((config.bind.as_str(), config.port))?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let flag = keep_running.clone();

    info!(%addr, session = %config.session_name, "relay listening");
    let thread = thread::Builder::new()
        .name("sandtable-relay".into())
        .spawn(move || run_relay(listener, config, flag))?;

    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

struct Handshake {
    channel: EventChannel<TcpTransport>,
    since: Instant,
}

fn run_relay(listener: TcpListener, config: RelayConfig, keep_running: Arc<AtomicBool>) {
    let mut session: RelaySession<TcpTransport> =
        RelaySession::new(config.session_name, config.password, config.max_players);
    let mut handshakes: Vec<Handshake> = Vec::new();

    while keep_running.load(Ordering::SeqCst) {
        let mut busy = accept_pending(&listener, &mut handshakes);
        busy |= advance_handshakes(&mut session, &mut handshakes);
        busy |= session.pump() > 0;
        if !busy {
            thread::sleep(config.poll_interval);
        }
    }
    info!("relay stopped");
}

fn accept_pending(listener: &TcpListener, handshakes: &mut Vec<Handshake>) -> bool {
    let mut accepted = false;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => match TcpTransport::from_stream(stream) {
                Ok(transport) => {
                    debug!(%peer, "connection accepted");
                    handshakes.push(Handshake {
                        channel: EventChannel::new(transport),
                        since: Instant::now(),
                    });
                    accepted = true;
                }
                Err(e) => warn!(%peer, error = %e, "could not set up connection"),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return accepted;
            }
        }
    }
}

/// Move connections whose Hello arrived into the session. Returns whether
/// any connection changed state.
fn advance_handshakes(session: &mut RelaySession<TcpTransport>, handshakes: &mut Vec<Handshake>) -> bool {
    let mut progressed = false;
    let mut waiting = Vec::with_capacity(handshakes.len());
    for mut hs in handshakes.drain(..) {
        let mut messages = match hs.channel.poll::<ClientMessage>() {
            Ok(messages) => messages.into_iter(),
            Err(e) => {
                debug!(error = %e, "connection lost during handshake");
                progressed = true;
                continue;
            }
        };
        let Some(first) = messages.next() else {
            if hs.since.elapsed() > HANDSHAKE_TIMEOUT {
                debug!("handshake timed out");
                progressed = true;
            } else {
                waiting.push(hs);
            }
            continue;
        };
        progressed = true;
        let Some(request) = JoinRequest::from_message(first) else {
            warn!("first message was not Hello; dropping connection");
            continue;
        };
        if let Ok(id) = session.add_player(request, hs.channel) {
            // Anything pipelined behind the Hello.
            for message in messages {
                session.handle(id, message);
            }
        }
    }
    *handshakes = waiting;
    progressed
}
