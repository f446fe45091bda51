// Gameplay scenarios over a real relay: routing around an obstacle, a
// corrupted peer caught by the audit, and a peer leaving mid-game.
//
// Each checks both peers' view of the world, plus the relay's view where it
// has one.

use multiplayer_tests::{TestPeer, network_config, run_until, run_while};
use sandtable_protocol::ParticipantId;
use sandtable_relay::server::{RelayConfig, RelayHandle, start_relay};
use sandtable_sim::command::SimAction;
use sandtable_sim::config::{MapConfig, SessionConfig};
use sandtable_sim::pathfinding::MovementStrategy;
use sandtable_sim::session::SessionStatus;
use sandtable_sim::types::{CellCoord, PlayerId, UnitId};

const WALL: CellCoord = CellCoord::new(3, 3);

fn relay() -> (RelayHandle, std::net::SocketAddr) {
    start_relay(RelayConfig {
        port: 0,
        session_name: "scenario".into(),
        ..RelayConfig::default()
    })
    .unwrap()
}

fn two_peers(config: &SessionConfig) -> (RelayHandle, TestPeer, TestPeer) {
    let (handle, addr) = relay();
    let mut host = TestPeer::connect(addr, "Host", config);
    let mut joiner = TestPeer::connect(addr, "Joiner", config);
    host.send_start_game(7, config);
    host.poll_until_game_start();
    joiner.poll_until_game_start();
    (handle, host, joiner)
}

/// 16x16 open map with a single wall on the diagonal from (0,0) to (5,5).
fn walled_config() -> SessionConfig {
    let mut rows = vec![".".repeat(16); 16];
    rows[3] = format!("...#{}", ".".repeat(12));
    let mut config = SessionConfig {
        latency_window: 2,
        checksum_interval: 20,
        map: MapConfig {
            rows,
            ..MapConfig::open(16, 16)
        },
        ..network_config()
    };
    config.pathing.strategy_priority = vec![MovementStrategy::CheapestAvoidAll];
    config
}

#[test]
fn move_routes_around_a_wall_identically_on_both_peers() {
    let config = walled_config();
    let (handle, mut host, mut joiner) = two_peers(&config);

    host.issue(SimAction::Spawn {
        template: "tank".into(),
        cell: CellCoord::new(0, 0),
    });
    run_until(&mut [&mut host, &mut joiner], 10);
    let tank = UnitId(1);
    assert_eq!(host.session().sim().units[&tank].cell, CellCoord::new(0, 0));

    let order = host.issue(SimAction::Move {
        unit: tank,
        destination: CellCoord::new(5, 5),
    });
    assert_eq!(order.frame, 12);

    let destination = CellCoord::new(5, 5);
    let mut frame = 10;
    let arrived = loop {
        frame += 1;
        run_until(&mut [&mut host, &mut joiner], frame);
        let a = &host.session().sim().units[&tank];
        let b = &joiner.session().sim().units[&tank];
        assert_eq!(a, b, "tank differs between peers at frame {frame}");
        assert_ne!(a.cell, WALL, "tank drove through the wall at frame {frame}");
        if a.cell == destination && !a.in_transit() {
            break frame;
        }
        if frame >= 400 {
            panic!("tank never reached {destination:?}; stuck at {:?}", a.cell);
        }
    };
    assert!(arrived > 12);

    // The audit at the next multiple of 20 still agrees.
    let audit = arrived.next_multiple_of(20) + 5;
    run_until(&mut [&mut host, &mut joiner], audit);
    assert!(host.session().desync().is_none());
    assert!(joiner.session().desync().is_none());
    assert_eq!(host.session().sim().checksum(), joiner.session().sim().checksum());

    host.disconnect();
    joiner.disconnect();
    handle.stop();
}

#[test]
fn corrupted_peer_is_named_by_every_auditor() {
    // Default interval: audits at 50, 100, ...
    let config = network_config();
    let (handle, mut host, mut joiner) = two_peers(&config);
    host.issue(SimAction::Spawn {
        template: "rifleman".into(),
        cell: CellCoord::new(4, 4),
    });
    run_until(&mut [&mut host, &mut joiner], 60);
    assert!(host.session().desync().is_none());

    joiner.session_mut().sim_mut_for_testing().corrupt_for_testing();
    run_while(&mut [&mut host, &mut joiner], "desync at frame 100", |p| {
        p.session().desync().is_some() && !p.relay_desyncs.is_empty()
    });

    for peer in [&host, &joiner] {
        let report = peer.session().desync().unwrap();
        assert_eq!(report.frame, 100);
        assert_eq!(report.diverging, vec![PlayerId(1)]);
        assert!(matches!(peer.session().status(), SessionStatus::Desynced(_)));
        assert_eq!(peer.relay_desyncs, vec![(100, vec![ParticipantId(1)])]);
    }

    host.disconnect();
    joiner.disconnect();
    handle.stop();
}

#[test]
fn departing_peer_stops_blocking_the_host() {
    let config = network_config();
    let (handle, mut host, mut joiner) = two_peers(&config);
    joiner.issue(SimAction::Spawn {
        template: "engineer".into(),
        cell: CellCoord::new(20, 20),
    });
    run_until(&mut [&mut host, &mut joiner], 30);
    joiner.disconnect();

    run_until(&mut [&mut host], 80);
    assert_eq!(host.departed, vec![ParticipantId(1)]);
    assert_eq!(host.session().status(), SessionStatus::Running);
    // The joiner's unit stays in the world; only its input stream ended.
    assert_eq!(host.session().sim().units[&UnitId(1)].owner, PlayerId(1));

    host.disconnect();
    handle.stop();
}
