//! Gossip-based peer discovery.
//!
//! Every `interval_ms` a node publishes a [`PeerAnnouncement`] listing its
//! reachable addresses on each discovery topic. Peers subscribed to the
//! same topic learn about each other without a DHT; a relay that merely
//! subscribes to the topic is enough to connect browser and native peers.

use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pubsub::PUBSUB_PEER_DISCOVERY;

/// Addresses kept from a single announcement.
pub const MAX_ANNOUNCED_ADDRS: usize = 16;

/// Pub/sub discovery settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Enable pub/sub discovery.
    pub enabled: bool,

    /// Topics announcements are published on and read from.
    pub topics: Vec<String>,

    /// Announcement period in milliseconds.
    pub interval_ms: u64,

    /// Subscribe and listen for announcements without announcing ourselves.
    pub listen_only: bool,

    /// Dial newly discovered peers.
    pub auto_dial: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topics: vec![PUBSUB_PEER_DISCOVERY.to_string()],
            interval_ms: 10_000,
            listen_only: false,
            auto_dial: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// How a peer came to our attention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoverySource {
    /// Listed in the static bootstrap configuration.
    Bootstrap,
    /// Announced on a discovery topic.
    Pubsub,
}

/// Announcement payload published on discovery topics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    /// Base58 peer id of the announcing node.
    pub peer_id: String,
    /// Addresses the node can be dialled on.
    pub addrs: Vec<String>,
}

/// Why an announcement was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AnnouncementError {
    #[error("malformed announcement: {0}")]
    Malformed(String),
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
    /// Announced id differs from the signed message author.
    #[error("announcement for {announced} published by {author}")]
    SourceMismatch { announced: PeerId, author: PeerId },
    /// Our own announcement echoed back.
    #[error("own announcement")]
    OwnAnnouncement,
}

/// A validated announcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub peer_id: PeerId,
    /// Parsed addresses, at most [`MAX_ANNOUNCED_ADDRS`]; entries that fail
    /// to parse are skipped.
    pub addrs: Vec<Multiaddr>,
}

impl PeerAnnouncement {
    pub fn new(peer_id: &PeerId, addrs: &[Multiaddr]) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            addrs: addrs.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing a struct of strings cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AnnouncementError> {
        serde_json::from_slice(bytes).map_err(|e| AnnouncementError::Malformed(e.to_string()))
    }
}

/// Decode and vet an announcement received over gossip.
pub fn accept_announcement(
    bytes: &[u8],
    source: Option<PeerId>,
    local_peer: &PeerId,
) -> Result<DiscoveredPeer, AnnouncementError> {
    let announcement = PeerAnnouncement::decode(bytes)?;
    let peer_id = announcement
        .peer_id
        .parse::<PeerId>()
        .map_err(|e| AnnouncementError::InvalidPeerId(e.to_string()))?;

    if &peer_id == local_peer {
        return Err(AnnouncementError::OwnAnnouncement);
    }

    if let Some(source) = source {
        if source != peer_id {
            return Err(AnnouncementError::SourceMismatch {
                announced: peer_id,
                author: source,
            });
        }
    }

    let addrs = announcement
        .addrs
        .iter()
        .filter_map(|a| a.parse::<Multiaddr>().ok())
        .take(MAX_ANNOUNCED_ADDRS)
        .collect();

    Ok(DiscoveredPeer { peer_id, addrs })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> Vec<Multiaddr> {
        vec![
            "/ip4/127.0.0.1/tcp/4001".parse().unwrap(),
            "/ip4/127.0.0.1/tcp/4002/ws".parse().unwrap(),
        ]
    }

    #[test]
    fn test_accept_valid_announcement() {
        let remote = PeerId::random();
        let local = PeerId::random();
        let bytes = PeerAnnouncement::new(&remote, &addrs()).encode();

        let found = accept_announcement(&bytes, Some(remote), &local).unwrap();
        assert_eq!(found.peer_id, remote);
        assert_eq!(found.addrs, addrs());
    }

    #[test]
    fn test_reject_spoofed_announcement() {
        let remote = PeerId::random();
        let forger = PeerId::random();
        let bytes = PeerAnnouncement::new(&remote, &addrs()).encode();

        let err = accept_announcement(&bytes, Some(forger), &PeerId::random()).unwrap_err();
        assert_eq!(
            err,
            AnnouncementError::SourceMismatch {
                announced: remote,
                author: forger,
            }
        );
        assert_eq!(
            err.to_string(),
            format!("announcement for {} published by {}", remote, forger)
        );
    }

    #[test]
    fn test_reject_own_and_malformed() {
        let local = PeerId::random();
        let bytes = PeerAnnouncement::new(&local, &addrs()).encode();
        assert_eq!(
            accept_announcement(&bytes, Some(local), &local),
            Err(AnnouncementError::OwnAnnouncement)
        );

        assert!(matches!(
            accept_announcement(b"not json", None, &local),
            Err(AnnouncementError::Malformed(_))
        ));

        let bad_id = serde_json::to_vec(&PeerAnnouncement {
            peer_id: "nope".to_string(),
            addrs: vec![],
        })
        .unwrap();
        assert!(matches!(
            accept_announcement(&bad_id, None, &local),
            Err(AnnouncementError::InvalidPeerId(_))
        ));
    }

    #[test]
    fn test_unparsable_addresses_are_skipped() {
        let remote = PeerId::random();
        let announcement = PeerAnnouncement {
            peer_id: remote.to_string(),
            addrs: vec!["garbage".to_string(), "/ip4/1.2.3.4/tcp/1".to_string()],
        };
        let found = accept_announcement(&announcement.encode(), None, &PeerId::random()).unwrap();
        assert_eq!(found.addrs.len(), 1);
    }

    #[test]
    fn test_announced_addresses_are_capped() {
        let remote = PeerId::random();
        let many: Vec<Multiaddr> = (0..100u16)
            .map(|port| format!("/ip4/10.0.0.1/tcp/{}", 4000 + port).parse().unwrap())
            .collect();
        let bytes = PeerAnnouncement::new(&remote, &many).encode();
        let found = accept_announcement(&bytes, Some(remote), &PeerId::random()).unwrap();
        assert_eq!(found.addrs, many[..MAX_ANNOUNCED_ADDRS].to_vec());
    }

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.topics, vec![PUBSUB_PEER_DISCOVERY.to_string()]);
        assert_eq!(config.interval(), Duration::from_secs(10));
        assert!(!config.listen_only);
    }
}
