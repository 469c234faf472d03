//! Static bootstrap peer list.
//!
//! Bootstrap entries are full multiaddrs ending in `/p2p/<peer id>`. Each is
//! reported as a discovered peer and dialled once at start-up; from there,
//! gossip discovery and the relay find the rest of the network.

use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::transport::peer_id_of;

/// Relay the demo network is seeded with: a local relay listening on
/// WebSocket port 9001 with a fixed identity.
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "/ip4/127.0.0.1/tcp/9001/ws/p2p/12D3KooWATM3WBM9SaBmf88B57Msggrui7tarypMmcca72cUD4ed",
];

/// Bootstrap configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Bootstrap multiaddresses, each with a `/p2p/` peer id.
    pub peers: Vec<String>,

    /// Number of bootstrap peers that must be connected before
    /// bootstrapping counts as complete. Capped at the list length.
    pub min_peers: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            peers: DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_peers: 1,
        }
    }
}

impl BootstrapConfig {
    /// An empty list, for nodes that are themselves the entry point.
    pub fn none() -> Self {
        Self {
            peers: Vec::new(),
            min_peers: 0,
        }
    }

    /// Parse every entry into `(peer id, address)`.
    pub fn parse(&self) -> Result<Vec<(PeerId, Multiaddr)>, ConfigError> {
        self.peers.iter().map(|s| parse_bootstrap_addr(s)).collect()
    }

    /// Entries grouped by peer in first-seen order, so a peer listed under
    /// several addresses is dialled once with all of them.
    pub fn peers_by_id(&self) -> Result<Vec<(PeerId, Vec<Multiaddr>)>, ConfigError> {
        let mut grouped: Vec<(PeerId, Vec<Multiaddr>)> = Vec::new();
        for (peer, addr) in self.parse()? {
            match grouped.iter_mut().find(|(p, _)| *p == peer) {
                Some((_, addrs)) => {
                    if !addrs.contains(&addr) {
                        addrs.push(addr);
                    }
                }
                None => grouped.push((peer, vec![addr])),
            }
        }
        Ok(grouped)
    }
}

/// Parse one bootstrap entry; the address must name its peer.
pub fn parse_bootstrap_addr(s: &str) -> Result<(PeerId, Multiaddr), ConfigError> {
    let addr = s
        .parse::<Multiaddr>()
        .map_err(|e| ConfigError::InvalidMultiaddr {
            field: "bootstrap.peers",
            addr: s.to_string(),
            reason: e.to_string(),
        })?;
    let peer = peer_id_of(&addr).ok_or_else(|| ConfigError::MissingPeerId {
        addr: s.to_string(),
    })?;
    Ok((peer, addr))
}

/// Bootstrap progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapState {
    /// Current phase of bootstrapping.
    pub phase: BootstrapPhase,
    /// Bootstrap peers configured.
    pub peers_total: usize,
    /// Bootstrap peers currently connected.
    pub peers_connected: usize,
    /// Bootstrap dials that failed.
    pub connection_failures: usize,
    /// Connected bootstrap peers needed for completion.
    pub required: usize,
}

/// Phases of the bootstrap process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapPhase {
    /// Not started, or no bootstrap peers configured.
    NotStarted,
    /// Dialling bootstrap peers.
    Connecting,
    /// Enough bootstrap peers connected.
    Complete,
    /// Every bootstrap dial failed.
    Failed { reason: String },
}

impl BootstrapState {
    pub fn new() -> Self {
        Self {
            phase: BootstrapPhase::NotStarted,
            peers_total: 0,
            peers_connected: 0,
            connection_failures: 0,
            required: 0,
        }
    }

    /// Begin dialling `total` bootstrap peers.
    pub fn start(&mut self, total: usize, min_peers: usize) {
        self.peers_total = total;
        self.required = min_peers.min(total);
        self.peers_connected = 0;
        self.connection_failures = 0;
        self.phase = if total == 0 {
            BootstrapPhase::NotStarted
        } else if self.required == 0 {
            BootstrapPhase::Complete
        } else {
            BootstrapPhase::Connecting
        };
    }

    /// A bootstrap peer connected. A late success also clears a failure.
    pub fn record_connected(&mut self) {
        self.peers_connected += 1;
        if self.peers_total > 0 && self.peers_connected >= self.required {
            self.phase = BootstrapPhase::Complete;
        }
    }

    /// A bootstrap peer disconnected. Completion is sticky.
    pub fn record_disconnected(&mut self) {
        self.peers_connected = self.peers_connected.saturating_sub(1);
    }

    /// A bootstrap dial failed.
    pub fn record_failure(&mut self) {
        self.connection_failures += 1;
        if self.phase == BootstrapPhase::Connecting
            && self.peers_connected == 0
            && self.connection_failures >= self.peers_total
        {
            self.phase = BootstrapPhase::Failed {
                reason: format!(
                    "all {} bootstrap peers unreachable",
                    self.peers_total
                ),
            };
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == BootstrapPhase::Complete
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.phase, BootstrapPhase::Failed { .. })
    }

    /// One-line description for status output.
    pub fn log_state(&self) -> String {
        match &self.phase {
            BootstrapPhase::NotStarted => {
                if self.peers_total == 0 {
                    "No bootstrap peers configured".to_string()
                } else {
                    "Bootstrap not started".to_string()
                }
            }
            BootstrapPhase::Connecting => format!(
                "Connecting to bootstrap peers... ({}/{} connected, {} failed)",
                self.peers_connected, self.peers_total, self.connection_failures
            ),
            BootstrapPhase::Complete => format!(
                "Bootstrap complete: {}/{} bootstrap peers connected",
                self.peers_connected, self.peers_total
            ),
            BootstrapPhase::Failed { reason } => format!("Bootstrap failed: {}", reason),
        }
    }
}

impl Default for BootstrapState {
    fn default() -> Self {
        Self::new()
    }
}
