//! Events a running node reports to its subscribers.

use libp2p::{Multiaddr, PeerId};

use crate::discovery::DiscoverySource;
use crate::pubsub::{MessageKind, PubsubMessage};
use crate::transport::TransportType;

/// Which side opened a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One open connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub remote_addr: Multiaddr,
    pub transport: TransportType,
    pub direction: Direction,
}

#[derive(Clone, Debug)]
pub enum NodeEvent {
    ConnectionOpened(ConnectionInfo),

    ConnectionClosed {
        peer_id: PeerId,
        remote_addr: Multiaddr,
        /// Error that closed the connection, if it did not close cleanly.
        cause: Option<String>,
    },

    PeerDiscovered {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        source: DiscoverySource,
    },

    /// Our own dialable addresses changed (new listener, expired listener,
    /// relay reservation, confirmed external address).
    SelfAddressesUpdated { addrs: Vec<Multiaddr> },

    MessageReceived(PubsubMessage),

    /// A relay accepted (or renewed) our reservation.
    RelayReservationAccepted { relay: PeerId },

    /// Outcome of a DCUtR attempt on a relayed connection.
    HolePunch {
        peer_id: PeerId,
        success: bool,
        error: Option<String>,
    },
}

impl NodeEvent {
    /// One console line for the event. Messages on discovery topics carry
    /// announcements, not user content, and are not echoed.
    pub fn describe(&self, discovery_topics: &[String]) -> Option<String> {
        let line = match self {
            NodeEvent::ConnectionOpened(info) => format!(
                "Connected to {} via {} ({})",
                info.peer_id,
                info.transport.label(),
                info.remote_addr
            ),
            NodeEvent::ConnectionClosed {
                peer_id,
                remote_addr,
                cause,
            } => match cause {
                Some(cause) => format!(
                    "Disconnected from {} ({}): {}",
                    peer_id, remote_addr, cause
                ),
                None => format!("Disconnected from {} ({})", peer_id, remote_addr),
            },
            NodeEvent::PeerDiscovered {
                peer_id,
                addrs,
                source,
            } => format!(
                "Discovered peer {} via {:?} ({} addresses)",
                peer_id,
                source,
                addrs.len()
            ),
            NodeEvent::SelfAddressesUpdated { addrs } => {
                let addrs: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
                format!("Listening on: {}", addrs.join(", "))
            }
            NodeEvent::MessageReceived(msg) => {
                if MessageKind::from_topic(&msg.topic, discovery_topics) == MessageKind::Discovery {
                    return None;
                }
                let from = msg.source.unwrap_or(msg.propagation_source);
                format!("{}: {}: {}", msg.topic, from, msg.text())
            }
            NodeEvent::RelayReservationAccepted { relay } => {
                format!("Reservation accepted by relay {}", relay)
            }
            NodeEvent::HolePunch {
                peer_id,
                success: true,
                ..
            } => format!("Hole punch to {} succeeded, connection upgraded to direct", peer_id),
            NodeEvent::HolePunch {
                peer_id, error, ..
            } => format!(
                "Hole punch to {} failed: {}",
                peer_id,
                error.as_deref().unwrap_or("unknown error")
            ),
        };
        Some(line)
    }
}
