// sandtable_relay: event channel, transports, and the relay server.
//
// Everything that moves lockstep traffic between processes. The relay is a
// thin broker: it admits participants, starts the game when the host says
// so, forwards each participant's frame inputs and checksums to everyone
// else, and flags checksum disagreements. It never runs the simulation.
//
// Module overview:
// - `transport.rs`: `Transport` trait, `MemoryTransport` (in-process pair
//                   with fault injection), `TcpTransport` (framed TCP with a
//                   reader thread).
// - `channel.rs`:   `EventChannel`: typed messages over a transport with
//                   link sequencing, integrity checks, nack-driven resends.
// - `session.rs`:   `RelaySession`: lobby, roster, forwarding, relay-side
//                   desync detection.
// - `server.rs`:    TCP accept/handshake/pump loop (`start_relay`).
// - `client.rs`:    `NetClient`: the peer's side of the protocol.
//
// Depends on `sandtable_protocol` only; no simulation types here. The relay
// runs as a standalone binary (`main.rs`) or embedded via `start_relay`.

pub mod channel;
pub mod client;
pub mod server;
pub mod session;
pub mod transport;

pub use server::start_relay;
