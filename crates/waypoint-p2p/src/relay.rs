//! Circuit relay: server limits, client reservations, and the connection
//! mode a node is in.
//!
//! A peer behind NAT cannot be dialled directly. It connects to a relay,
//! learns through identify that the relay speaks the circuit relay v2 hop
//! protocol, and reserves a slot by listening on
//! `<relay addr>/p2p/<relay>/p2p-circuit`. Other peers reach it through that
//! circuit address; DCUtR then tries to upgrade the relayed connection to a
//! direct, hole-punched one.
//!
//! The relay forwards Noise-encrypted traffic. It sees who talks to whom,
//! never what they say.

use std::collections::HashMap;
use std::time::Duration;

use libp2p::{
    core::transport::ListenerId, multiaddr::Protocol, relay, Multiaddr, PeerId, StreamProtocol,
};
use serde::{Deserialize, Serialize};

use crate::bootstrap::{BootstrapPhase, BootstrapState};
use crate::transport::{with_peer_id, TransportStats, TransportType};

/// Circuit relay v2 hop protocol, advertised by relay servers via identify.
pub const RELAY_HOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/hop";

/// Relay settings, covering both roles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum relays to hold reservations on. Zero disables reservations.
    pub discover_relays: usize,

    /// Attempt DCUtR hole punching over relayed connections.
    pub enable_hole_punching: bool,

    /// Relay server role.
    pub server: RelayServerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            discover_relays: 1,
            enable_hole_punching: true,
            server: RelayServerConfig::default(),
        }
    }
}

/// Limits for serving as a relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServerConfig {
    /// Act as a circuit relay for other peers.
    pub enabled: bool,

    /// Maximum concurrent reservations. `None` means unlimited.
    pub max_reservations: Option<usize>,

    /// Maximum reservations a single peer may hold.
    pub max_reservations_per_peer: usize,

    /// Maximum concurrent relayed circuits.
    pub max_circuits: usize,

    /// Reservation lifetime in seconds.
    pub reservation_duration_secs: u64,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_reservations: None,
            max_reservations_per_peer: 4,
            max_circuits: 16,
            reservation_duration_secs: 60 * 60,
        }
    }
}

impl RelayServerConfig {
    /// Translate to the libp2p relay behaviour configuration.
    pub fn to_libp2p(&self) -> relay::Config {
        relay::Config {
            max_reservations: self.max_reservations.unwrap_or(usize::MAX),
            max_reservations_per_peer: self.max_reservations_per_peer,
            reservation_duration: Duration::from_secs(self.reservation_duration_secs),
            max_circuits: self.max_circuits,
            ..Default::default()
        }
    }
}

/// Whether a peer's identify protocol list marks it as a relay.
pub fn supports_relay_hop(protocols: &[StreamProtocol]) -> bool {
    protocols.iter().any(|p| p.as_ref() == RELAY_HOP_PROTOCOL)
}

/// Address to listen on to reserve a slot on `relay` reachable at `addr`.
pub fn circuit_listen_addr(addr: &Multiaddr, relay: PeerId) -> Multiaddr {
    with_peer_id(addr, relay).with(Protocol::P2pCircuit)
}

/// State of one reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReservationStatus {
    /// Listener opened, relay has not accepted yet.
    Pending,
    /// Relay accepted the reservation.
    Active,
}

#[derive(Clone, Debug)]
struct Reservation {
    listener: ListenerId,
    status: ReservationStatus,
}

/// Reservations held on relays, capped at `max`.
#[derive(Debug)]
pub struct RelayReservations {
    max: usize,
    slots: HashMap<PeerId, Reservation>,
}

impl RelayReservations {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            slots: HashMap::new(),
        }
    }

    /// Most relays a reservation is held on at once.
    pub fn capacity(&self) -> usize {
        self.max
    }

    /// Whether a reservation on `relay` should be attempted.
    pub fn wants(&self, relay: &PeerId) -> bool {
        self.slots.len() < self.max && !self.slots.contains_key(relay)
    }

    /// Record a reservation attempt. Returns `false` if it exceeds the cap
    /// or duplicates an existing one.
    pub fn insert_pending(&mut self, relay: PeerId, listener: ListenerId) -> bool {
        if !self.wants(&relay) {
            return false;
        }
        self.slots.insert(
            relay,
            Reservation {
                listener,
                status: ReservationStatus::Pending,
            },
        );
        true
    }

    /// The relay accepted (or renewed) our reservation.
    pub fn mark_active(&mut self, relay: &PeerId) -> bool {
        match self.slots.get_mut(relay) {
            Some(r) => {
                r.status = ReservationStatus::Active;
                true
            }
            None => false,
        }
    }

    /// A listener closed; free its slot. Returns the relay it belonged to.
    pub fn release_listener(&mut self, listener: ListenerId) -> Option<PeerId> {
        let relay = self
            .slots
            .iter()
            .find(|(_, r)| r.listener == listener)
            .map(|(p, _)| *p)?;
        self.slots.remove(&relay);
        Some(relay)
    }

    /// The relay went away; free its slot. Returns the listener to remove.
    pub fn release_relay(&mut self, relay: &PeerId) -> Option<ListenerId> {
        self.slots.remove(relay).map(|r| r.listener)
    }

    pub fn status(&self, relay: &PeerId) -> Option<ReservationStatus> {
        self.slots.get(relay).map(|r| r.status)
    }

    /// Relays with an accepted reservation.
    pub fn active(&self) -> Vec<PeerId> {
        let mut relays: Vec<PeerId> = self
            .slots
            .iter()
            .filter(|(_, r)| r.status == ReservationStatus::Active)
            .map(|(p, _)| *p)
            .collect();
        relays.sort();
        relays
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// How the node is currently attached to the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMode {
    /// At least one direct connection.
    Direct {
        direct_peers: usize,
        relayed_peers: usize,
    },

    /// Only relayed connections. The relay sees metadata, not data.
    ViaRelay {
        /// PeerId of the relay being used (for diagnostics).
        relay_peer: String,
        relayed_peers: usize,
    },

    /// No connections yet, bootstrap dials in flight.
    Bootstrapping,

    /// No connections.
    Disconnected { reason: String },
}

impl ConnectionMode {
    /// Derive the mode from the current connection breakdown.
    pub fn derive(
        stats: &TransportStats,
        relay_peer: Option<PeerId>,
        bootstrap: &BootstrapState,
    ) -> Self {
        if stats.total == 0 {
            return match &bootstrap.phase {
                BootstrapPhase::Connecting => ConnectionMode::Bootstrapping,
                BootstrapPhase::Failed { reason } => ConnectionMode::Disconnected {
                    reason: reason.clone(),
                },
                _ => ConnectionMode::Disconnected {
                    reason: "no peers connected".to_string(),
                },
            };
        }

        let relayed = stats.count(TransportType::CircuitRelay);
        if stats.has_direct_connection {
            ConnectionMode::Direct {
                direct_peers: stats.total - relayed,
                relayed_peers: relayed,
            }
        } else {
            ConnectionMode::ViaRelay {
                relay_peer: relay_peer
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                relayed_peers: relayed,
            }
        }
    }

    /// Human-readable description for console logging.
    pub fn description(&self) -> String {
        match self {
            ConnectionMode::Direct {
                direct_peers,
                relayed_peers,
            } => format!(
                "Direct: {} direct, {} relayed connections",
                direct_peers, relayed_peers
            ),
            ConnectionMode::ViaRelay {
                relay_peer,
                relayed_peers,
            } => format!(
                "Circuit Relay via {} | {} relayed connections | relay sees metadata only, not data",
                &relay_peer[..8.min(relay_peer.len())],
                relayed_peers
            ),
            ConnectionMode::Bootstrapping => "Bootstrapping: dialling bootstrap peers".to_string(),
            ConnectionMode::Disconnected { reason } => format!("Disconnected: {}", reason),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionMode::Direct { .. } | ConnectionMode::ViaRelay { .. }
        )
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self, ConnectionMode::ViaRelay { .. })
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ConnectionMode::Direct { .. })
    }
}
