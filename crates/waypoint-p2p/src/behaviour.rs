//! libp2p network behaviour for a Waypoint node.
//!
//! Defines the composite behaviour that combines:
//! - GossipSub for topic messaging and peer announcements
//! - Identify for learning peer protocols and listen addresses
//! - Ping for connection keep-alive and latency
//! - Circuit relay v2 client, plus the server when running as a relay
//! - DCUtR hole punching and AutoNAT, when enabled
//!
//! Alongside it, [`PeerStore`] keeps a bounded [`PeerRecord`] per peer and
//! scores peers that publish bogus discovery announcements.

use std::collections::HashMap;
use std::time::Duration;

use libp2p::{
    autonat, dcutr, gossipsub, identify,
    identity::{Keypair, PublicKey},
    ping, relay,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
    Multiaddr, PeerId,
};

use crate::config::NodeConfig;
use crate::error::NodeError;

/// Largest gossip message accepted.
pub const MAX_TRANSMIT_SIZE: usize = 64 * 1024;

/// Addresses remembered per peer; the oldest are dropped first.
pub const MAX_PEER_ADDRS: usize = 16;

/// Peer store size above which records of peers we are neither connected
/// to nor bootstrapping from are dropped.
pub const MAX_KNOWN_PEERS: usize = 256;

/// The composite network behaviour driven by the node's swarm.
#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    /// GossipSub carries application topics and discovery announcements.
    pub gossipsub: gossipsub::Behaviour,

    /// Identify tells us which peers are relays and what they listen on.
    pub identify: identify::Behaviour,

    pub ping: ping::Behaviour,

    /// Client side of circuit relay v2: reservations and relayed dials.
    pub relay_client: relay::client::Behaviour,

    /// Server side of circuit relay v2, only in relay mode.
    pub relay_server: Toggle<relay::Behaviour>,

    pub dcutr: Toggle<dcutr::Behaviour>,

    pub autonat: Toggle<autonat::Behaviour>,
}

impl NodeBehaviour {
    pub fn new(
        keypair: &Keypair,
        relay_client: relay::client::Behaviour,
        config: &NodeConfig,
    ) -> Result<Self, NodeError> {
        let peer_id = keypair.public().to_peer_id();

        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            create_gossipsub_config()?,
        )
        .map_err(|e| NodeError::Transport {
            reason: format!("gossipsub: {}", e),
        })?;

        let identify = identify::Behaviour::new(create_identify_config(
            &config.protocol_version,
            keypair.public(),
        ));

        let relay_server = config
            .relay
            .server
            .enabled
            .then(|| relay::Behaviour::new(peer_id, config.relay.server.to_libp2p()));

        let dcutr = config
            .relay
            .enable_hole_punching
            .then(|| dcutr::Behaviour::new(peer_id));

        let autonat = config
            .enable_autonat
            .then(|| autonat::Behaviour::new(peer_id, autonat::Config::default()));

        Ok(Self {
            gossipsub,
            identify,
            ping: ping::Behaviour::new(ping::Config::new()),
            relay_client,
            relay_server: Toggle::from(relay_server),
            dcutr: Toggle::from(dcutr),
            autonat: Toggle::from(autonat),
        })
    }
}

/// GossipSub configuration: signed messages, strict validation, 1s heartbeat.
pub fn create_gossipsub_config() -> Result<gossipsub::Config, NodeError> {
    gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(1))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .max_transmit_size(MAX_TRANSMIT_SIZE)
        .build()
        .map_err(|e| NodeError::Transport {
            reason: format!("gossipsub config: {}", e),
        })
}

/// Identify configuration. Listen address changes are pushed to peers so
/// a new relay reservation becomes visible without waiting for a re-identify.
pub fn create_identify_config(
    protocol_version: &str,
    local_public_key: PublicKey,
) -> identify::Config {
    identify::Config::new(protocol_version.to_string(), local_public_key)
        .with_push_listen_addr_updates(true)
}

/// Everything we know about one peer.
#[derive(Clone, Debug, Default)]
pub struct PeerRecord {
    /// Listen addresses reported by identify, a discovery announcement or
    /// the bootstrap list, newest last. Used when dialling the peer.
    pub addrs: Vec<Multiaddr>,
    /// Agent version reported by identify.
    pub agent_version: Option<String>,
    /// Smoothed ping round-trip time in milliseconds.
    pub avg_latency_ms: Option<f64>,
    /// Announcements from this peer that passed validation.
    pub announcements_valid: u64,
    /// Announcements signed by this peer that claimed someone else's id.
    pub announcements_invalid: u64,
}

impl PeerRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge addresses, dropping duplicates. A re-reported address moves
    /// to the back; past [`MAX_PEER_ADDRS`] the oldest are evicted.
    pub fn add_addrs<I: IntoIterator<Item = Multiaddr>>(&mut self, addrs: I) {
        for addr in addrs {
            self.addrs.retain(|a| a != &addr);
            self.addrs.push(addr);
        }
        if self.addrs.len() > MAX_PEER_ADDRS {
            let excess = self.addrs.len() - MAX_PEER_ADDRS;
            self.addrs.drain(..excess);
        }
    }

    /// Fold a ping sample into the running average.
    pub fn record_rtt(&mut self, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1000.0;
        self.avg_latency_ms = Some(match self.avg_latency_ms {
            Some(avg) => avg * 0.8 + sample * 0.2,
            None => sample,
        });
    }

    /// Reputation score (0.0 - 1.0) over announcements. Higher is better.
    pub fn reputation(&self) -> f64 {
        let total = self.announcements_valid + self.announcements_invalid;
        if total == 0 {
            return 0.5;
        }
        self.announcements_valid as f64 / total as f64
    }

    /// Disconnect peers that mostly publish spoofed announcements, once
    /// there is enough data to judge.
    pub fn should_disconnect(&self) -> bool {
        self.announcements_invalid >= 3 && self.reputation() < 0.5
    }
}

/// What we know about peers, bounded by [`MAX_KNOWN_PEERS`].
#[derive(Debug, Default)]
pub struct PeerStore {
    records: HashMap<PeerId, PeerRecord>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.records.get(peer)
    }

    /// The record for `peer`, created empty if missing.
    pub fn entry(&mut self, peer: PeerId) -> &mut PeerRecord {
        self.records.entry(peer).or_default()
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerRecord> {
        self.records.remove(peer)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Once over [`MAX_KNOWN_PEERS`], drop every record `keep` rejects.
    /// Returns how many were dropped.
    pub fn prune<F: Fn(&PeerId) -> bool>(&mut self, keep: F) -> usize {
        if self.records.len() <= MAX_KNOWN_PEERS {
            return 0;
        }
        let before = self.records.len();
        self.records.retain(|peer, _| keep(peer));
        before - self.records.len()
    }
}
