//! Periodic status reporting.
//!
//! The reporter re-reads connection and address state on a fixed interval
//! and logs it: a one-line summary at info, the full table at debug.

use std::fmt::Write as _;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bootstrap::BootstrapState;
use crate::error::NodeError;
use crate::event::{ConnectionInfo, Direction};
use crate::node::NodeHandle;
use crate::pubsub::GossipStats;
use crate::relay::ConnectionMode;
use crate::transport::TransportStats;

/// A connected peer as shown in the status table.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    /// Open connections to the peer.
    pub connections: usize,
    /// Smoothed ping round-trip time.
    pub latency_ms: Option<f64>,
    pub agent_version: Option<String>,
}

/// Point-in-time view of a node.
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    pub peer_id: PeerId,
    /// At least one listener is open.
    pub online: bool,
    pub connections: Vec<ConnectionInfo>,
    pub transports: TransportStats,
    /// Our dialable addresses, each ending in `/p2p/<peer id>`.
    pub addresses: Vec<Multiaddr>,
    pub peers: Vec<PeerStatus>,
    /// Subscribed topics with the number of peers subscribed to each.
    pub topics: Vec<(String, usize)>,
    pub mode: ConnectionMode,
    pub bootstrap: BootstrapState,
    pub gossip: GossipStats,
    /// Relays holding an accepted reservation for us.
    pub reservations: Vec<PeerId>,
    /// Entries in the peer store.
    pub known_peers: usize,
}

impl StatusSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "{} | {} | {} connections ({}) | {} addresses | {} reservations",
            if self.online { "online" } else { "offline" },
            self.mode.description(),
            self.transports.total,
            self.transports.describe(),
            self.addresses.len(),
            self.reservations.len(),
        )
    }

    /// Multi-line rendering of everything in the snapshot.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Peer ID: {}", self.peer_id);
        let _ = writeln!(
            out,
            "Status: {}",
            if self.online { "online" } else { "offline" }
        );
        let _ = writeln!(out, "Mode: {}", self.mode.description());
        let _ = writeln!(out, "Bootstrap: {}", self.bootstrap.log_state());

        let _ = writeln!(out, "Addresses ({}):", self.addresses.len());
        for addr in &self.addresses {
            let _ = writeln!(out, "  {}", addr);
        }

        let _ = writeln!(out, "Peer types: {}", self.transports.describe());

        let _ = writeln!(out, "Connections ({}):", self.connections.len());
        for conn in &self.connections {
            let arrow = match conn.direction {
                Direction::Inbound => "<-",
                Direction::Outbound => "->",
            };
            let _ = writeln!(
                out,
                "  {} {} [{}] {}",
                arrow,
                conn.peer_id,
                conn.transport.label(),
                conn.remote_addr
            );
        }

        let _ = writeln!(
            out,
            "Peers ({} connected, {} known):",
            self.peers.len(),
            self.known_peers
        );
        for peer in &self.peers {
            let latency = peer
                .latency_ms
                .map(|ms| format!("{:.1}ms", ms))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "  {} conns={} rtt={} agent={}",
                peer.peer_id,
                peer.connections,
                latency,
                peer.agent_version.as_deref().unwrap_or("-")
            );
        }

        let _ = writeln!(out, "Topics:");
        for (topic, subscribers) in &self.topics {
            let _ = writeln!(out, "  {} ({} subscribers)", topic, subscribers);
        }

        if !self.reservations.is_empty() {
            let _ = writeln!(out, "Relay reservations:");
            for relay in &self.reservations {
                let _ = writeln!(out, "  {}", relay);
            }
        }

        let _ = write!(out, "{}", self.gossip.summary());
        out
    }
}

/// Fixed-interval polling loop over a node's status.
pub struct StatusReporter;

impl StatusReporter {
    /// Poll `handle` every `interval` until the node stops.
    pub fn spawn(handle: NodeHandle, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match handle.status().await {
                    Ok(snapshot) => {
                        info!("{}", snapshot.summary());
                        debug!("\n{}", snapshot.render());
                    }
                    Err(NodeError::NotRunning) => {
                        debug!("Node stopped, status reporter exiting");
                        break;
                    }
                    Err(e) => debug!(error = %e, "Status poll failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportType;

    fn snapshot() -> StatusSnapshot {
        let local = PeerId::random();
        let remote = PeerId::random();
        let relay_addr: Multiaddr = format!(
            "/ip4/127.0.0.1/tcp/9002/p2p/{}/p2p-circuit",
            PeerId::random()
        )
        .parse()
        .unwrap();
        let connections = vec![ConnectionInfo {
            peer_id: remote,
            transport: TransportType::from_multiaddr(&relay_addr),
            remote_addr: relay_addr,
            direction: Direction::Inbound,
        }];
        let transports = TransportStats::from_transports(connections.iter().map(|c| c.transport));
        let bootstrap = BootstrapState::new();
        StatusSnapshot {
            peer_id: local,
            online: true,
            mode: ConnectionMode::derive(&transports, None, &bootstrap),
            connections,
            transports,
            addresses: vec![format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", local)
                .parse()
                .unwrap()],
            peers: vec![PeerStatus {
                peer_id: remote,
                connections: 1,
                latency_ms: Some(12.34),
                agent_version: None,
            }],
            topics: vec![("welcome_0.0.1".to_string(), 1)],
            bootstrap,
            gossip: GossipStats::default(),
            reservations: Vec::new(),
            known_peers: 3,
        }
    }

    #[test]
    fn test_summary_line() {
        let summary = snapshot().summary();
        assert!(summary.starts_with("online | Circuit Relay via"));
        assert!(summary.contains("1 connections (Circuit Relay: 1)"));
        assert!(summary.contains("1 addresses"));
        assert!(!summary.contains('\n'));
    }

    #[test]
    fn test_render_lists_everything() {
        let snap = snapshot();
        let text = snap.render();
        assert!(text.contains(&format!("Peer ID: {}", snap.peer_id)));
        assert!(text.contains("Peer types: Circuit Relay: 1"));
        assert!(text.contains("rtt=12.3ms"));
        assert!(text.contains("Peers (1 connected, 3 known):"));
        assert!(text.contains("welcome_0.0.1 (1 subscribers)"));
        assert!(text.contains("<- "));
        assert!(!text.contains("Relay reservations"));
    }
}
