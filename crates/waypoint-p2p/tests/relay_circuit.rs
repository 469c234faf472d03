//! Relay server, reservations and relayed dials over loopback TCP.

use std::time::Duration;

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use waypoint_p2p::bootstrap::BootstrapConfig;
use waypoint_p2p::{Node, NodeConfig, NodeEvent, NodeHandle, TransportType};

const WAIT: Duration = Duration::from_secs(20);

fn relay_config() -> NodeConfig {
    let mut config = NodeConfig::relay();
    config.listen = vec!["/ip4/127.0.0.1/tcp/0".to_string()];
    config.discovery.enabled = false;
    config.enable_autonat = false;
    config
}

fn peer_config(relays: &[Multiaddr]) -> NodeConfig {
    let mut config = NodeConfig::peer();
    config.listen = vec!["/ip4/127.0.0.1/tcp/0".to_string()];
    config.bootstrap = BootstrapConfig {
        peers: relays.iter().map(|a| a.to_string()).collect(),
        min_peers: 1,
    };
    config.discovery.enabled = false;
    config.greeting = false;
    config.relay.discover_relays = 1;
    config.relay.enable_hole_punching = false;
    config.dial_timeout_secs = 10;
    config
}

async fn listen_addr(node: &NodeHandle) -> Multiaddr {
    timeout(WAIT, async {
        loop {
            if let Some(addr) = node.multiaddrs().await.unwrap().into_iter().next() {
                return addr;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("node never started listening")
}

async fn start_relay() -> (NodeHandle, Multiaddr) {
    let relay = Node::start(relay_config()).await.unwrap();
    let addr = listen_addr(&relay).await;
    (relay, addr)
}

/// Start a peer with its event receiver subscribed before bootstrap runs.
async fn start_peer(config: NodeConfig) -> (NodeHandle, broadcast::Receiver<NodeEvent>) {
    let node = Node::new(config).await.unwrap();
    let handle = node.handle();
    let events = handle.events();
    node.spawn();
    (handle, events)
}

async fn wait_for_reservation(events: &mut broadcast::Receiver<NodeEvent>) -> PeerId {
    timeout(WAIT, async {
        loop {
            if let Ok(NodeEvent::RelayReservationAccepted { relay }) = events.recv().await {
                return relay;
            }
        }
    })
    .await
    .expect("relay reservation never accepted")
}

async fn wait_for_reservations(node: &NodeHandle, count: usize) {
    timeout(WAIT, async {
        while node.status().await.unwrap().reservations.len() != count {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("reservation count never reached");
}

/// Our circuit address through `relay`, once the listener is reported.
async fn circuit_addr(node: &NodeHandle, relay: PeerId) -> Multiaddr {
    timeout(WAIT, async {
        loop {
            let found = node.multiaddrs().await.unwrap().into_iter().find(|a| {
                a.iter().any(|p| p == Protocol::P2pCircuit)
                    && a.iter().any(|p| p == Protocol::P2p(relay))
            });
            if let Some(addr) = found {
                return addr;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("circuit address never appeared")
}

#[tokio::test]
async fn test_peer_reserves_slot_on_bootstrap_relay() {
    let (relay, relay_addr) = start_relay().await;
    let (peer, mut events) = start_peer(peer_config(&[relay_addr])).await;

    assert_eq!(wait_for_reservation(&mut events).await, relay.peer_id());
    wait_for_reservations(&peer, 1).await;

    let status = peer.status().await.unwrap();
    assert_eq!(status.reservations, vec![relay.peer_id()]);
    assert!(status.bootstrap.is_complete());

    let addr = circuit_addr(&peer, relay.peer_id()).await;
    assert!(addr.to_string().ends_with(&format!("/p2p-circuit/p2p/{}", peer.peer_id())));

    for node in [peer, relay] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_reservations_capped_at_discover_relays() {
    let (first, first_addr) = start_relay().await;
    let (second, second_addr) = start_relay().await;

    let mut config = peer_config(&[first_addr, second_addr]);
    config.bootstrap.min_peers = 2;
    let (peer, mut events) = start_peer(config).await;

    let reserved = wait_for_reservation(&mut events).await;
    assert!(reserved == first.peer_id() || reserved == second.peer_id());

    timeout(WAIT, async {
        while peer.peers().await.unwrap().len() != 2 {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("both relays never connected");

    // Give identify and a few retry ticks a chance to over-reserve.
    sleep(Duration::from_secs(5)).await;
    let status = peer.status().await.unwrap();
    assert_eq!(status.reservations, vec![reserved]);
    assert!(status.bootstrap.is_complete());

    for node in [peer, first, second] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_reservation_released_when_relay_goes_away() {
    let (relay, relay_addr) = start_relay().await;
    let (peer, mut events) = start_peer(peer_config(&[relay_addr])).await;

    wait_for_reservation(&mut events).await;
    wait_for_reservations(&peer, 1).await;

    relay.shutdown().await.unwrap();
    wait_for_reservations(&peer, 0).await;

    timeout(WAIT, async {
        while peer
            .multiaddrs()
            .await
            .unwrap()
            .iter()
            .any(|a| TransportType::from_multiaddr(a) == TransportType::CircuitRelay)
        {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("circuit address never withdrawn");

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dial_through_circuit_address() {
    let (relay, relay_addr) = start_relay().await;
    let (target, mut target_events) = start_peer(peer_config(&[relay_addr])).await;
    wait_for_reservation(&mut target_events).await;
    let circuit = circuit_addr(&target, relay.peer_id()).await;

    let mut config = peer_config(&[]);
    config.relay.discover_relays = 0;
    let dialer = Node::start(config).await.unwrap();
    let mut events = dialer.events();

    assert_eq!(dialer.dial(circuit).await.unwrap(), target.peer_id());

    let opened = timeout(WAIT, async {
        loop {
            if let Ok(NodeEvent::ConnectionOpened(info)) = events.recv().await {
                if info.peer_id == target.peer_id() {
                    return info;
                }
            }
        }
    })
    .await
    .expect("relayed connection never reported");
    assert_eq!(opened.transport, TransportType::CircuitRelay);

    // The dialer reaches the relay directly and the target through it.
    let status = dialer.status().await.unwrap();
    assert!(status.connections.iter().any(|c| {
        c.peer_id == target.peer_id() && c.transport == TransportType::CircuitRelay
    }));
    assert!(status.peers.iter().any(|p| p.peer_id == relay.peer_id()));

    for node in [dialer, target, relay] {
        node.shutdown().await.unwrap();
    }
}
