// CLI entry point for the standalone Sandtable relay.
//
// Starts a relay that lockstep peers connect to. The relay forwards frame
// inputs and checksums between participants and flags desyncs; it never
// runs the simulation. See `server.rs` for the loop and `session.rs` for
// the session rules.
//
// Logging goes through `tracing`; set `RUST_LOG` (e.g.
// `RUST_LOG=sandtable_relay=debug`) to change the filter. Default is `info`.

use std::time::Duration;

use clap::Parser;
use sandtable_relay::server::{RelayConfig, start_relay};
use sandtable_relay::session::MAX_PLAYERS;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Lockstep relay for Sandtable sessions", long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Listen port
    #[arg(short, long, default_value_t = 7979)]
    port: u16,

    /// Session name shown to joining players
    #[arg(short, long, default_value = "sandtable-session")]
    name: String,

    /// Session password
    #[arg(long)]
    password: Option<String>,

    /// Maximum participants (1 to 8)
    #[arg(short, long, default_value_t = MAX_PLAYERS, value_parser = clap::value_parser!(u32).range(1..=MAX_PLAYERS as i64))]
    max_players: u32,

    /// Idle poll interval in milliseconds
    #[arg(long, default_value_t = 2)]
    poll_ms: u64,
}

fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let config = RelayConfig {
        bind: args.bind,
        port: args.port,
        session_name: args.name,
        password: args.password,
        max_players: args.max_players,
        poll_interval: Duration::from_millis(args.poll_ms),
    };

    let (mut handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    };
    info!(%addr, "relay running; Ctrl+C to stop");

    // The process exits on SIGINT; until then the relay thread runs forever.
    handle.wait();
}
