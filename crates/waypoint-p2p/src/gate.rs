//! Connection gate consulted before every outbound dial.

use std::net::{Ipv4Addr, Ipv6Addr};

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{peer_id_of, TransportConfig, TransportType};

/// Dial policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Permit dialling loopback, private and link-local addresses.
    /// On by default so that a relay and peers can run on one machine.
    pub allow_private_addresses: bool,

    /// Peer ids (base58) that are never dialled. Connections with them are
    /// closed as soon as they are established, in either direction.
    pub denied_peers: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            allow_private_addresses: true,
            denied_peers: Vec::new(),
        }
    }
}

/// Why a dial was refused.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("private addresses are not allowed")]
    PrivateAddress,
    #[error("transport {} is not enabled", .0.label())]
    TransportDisabled(TransportType),
    #[error("peer {0} is denied")]
    DeniedPeer(PeerId),
}

/// Evaluates [`GateConfig`] against concrete addresses and peers.
#[derive(Clone, Debug)]
pub struct ConnectionGate {
    allow_private: bool,
    denied: Vec<PeerId>,
    transports: TransportConfig,
}

impl ConnectionGate {
    /// Unparsable entries in `denied_peers` are rejected earlier by
    /// config validation, so they are skipped here.
    pub fn new(config: &GateConfig, transports: TransportConfig) -> Self {
        Self {
            allow_private: config.allow_private_addresses,
            denied: config
                .denied_peers
                .iter()
                .filter_map(|p| p.parse().ok())
                .collect(),
            transports,
        }
    }

    pub fn is_denied_peer(&self, peer: &PeerId) -> bool {
        self.denied.contains(peer)
    }

    /// Check an outbound dial.
    pub fn check_dial(&self, addr: &Multiaddr) -> Result<(), Denial> {
        if let Some(peer) = peer_id_of(addr) {
            if self.is_denied_peer(&peer) {
                return Err(Denial::DeniedPeer(peer));
            }
        }

        let transport = TransportType::from_multiaddr(addr);
        if !self.transports.allows(transport) {
            return Err(Denial::TransportDisabled(transport));
        }

        // A circuit address is only as private as the relay in front of it.
        if !self.allow_private && is_private(addr) {
            return Err(Denial::PrivateAddress);
        }

        Ok(())
    }
}

/// Whether the first IP component of the address is loopback, private,
/// link-local or unspecified.
pub fn is_private(addr: &Multiaddr) -> bool {
    for protocol in addr.iter() {
        match protocol {
            Protocol::Ip4(ip) => return is_private_v4(ip),
            Protocol::Ip6(ip) => return is_private_v6(ip),
            Protocol::Dns(host) | Protocol::Dns4(host) | Protocol::Dns6(host) => {
                return host == "localhost";
            }
            _ => {}
        }
    }
    false
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
        || (first & 0xffc0) == 0xfe80 // link local fe80::/10
}
