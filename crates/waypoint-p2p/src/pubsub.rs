//! Topic-scoped publish/subscribe messaging.
//!
//! Gossipsub carries two kinds of traffic: application messages on the
//! topics a node subscribes to (the welcome topic by default), and peer
//! announcements on the discovery topics (see [`crate::discovery`]).

use libp2p::PeerId;
use serde::{Deserialize, Serialize};

/// Application topic every peer joins by default.
pub const WELCOME_TOPIC: &str = "welcome_0.0.1";

/// Topic carrying peer announcements between browser and native peers.
pub const PUBSUB_PEER_DISCOVERY: &str = "browser-peer-discovery";

/// A message delivered on a subscribed topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubsubMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub data: Vec<u8>,
    /// Author of the message (signed), when known.
    pub source: Option<PeerId>,
    /// Peer that forwarded the message to us.
    pub propagation_source: PeerId,
    /// Gossipsub message id.
    pub message_id: String,
}

impl PubsubMessage {
    /// Payload as text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// What a gossip message carries, judged by its topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// A peer announcement on one of the discovery topics.
    Discovery,
    /// Anything else.
    Application,
}

impl MessageKind {
    pub fn from_topic(topic: &str, discovery_topics: &[String]) -> Self {
        if discovery_topics.iter().any(|t| t == topic) {
            Self::Discovery
        } else {
            Self::Application
        }
    }
}

/// Counters over gossip traffic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipStats {
    /// Messages received across all topics.
    pub messages_received: u64,
    /// Application messages received.
    pub application_messages: u64,
    /// Discovery announcements received.
    pub announcements_received: u64,
    /// Announcements dropped (malformed, spoofed, or our own).
    pub announcements_rejected: u64,
    /// Messages we published successfully.
    pub messages_published: u64,
    /// Publish attempts that failed (usually no subscribed peers yet).
    pub publish_failures: u64,
}

impl GossipStats {
    pub fn record_received(&mut self, kind: &MessageKind) {
        self.messages_received += 1;
        match kind {
            MessageKind::Discovery => self.announcements_received += 1,
            MessageKind::Application => self.application_messages += 1,
        }
    }

    pub fn record_publish(&mut self, ok: bool) {
        if ok {
            self.messages_published += 1;
        } else {
            self.publish_failures += 1;
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Gossip: {} received ({} application, {} announcements, {} rejected) | {} published, {} failed",
            self.messages_received,
            self.application_messages,
            self.announcements_received,
            self.announcements_rejected,
            self.messages_published,
            self.publish_failures,
        )
    }
}

/// Greeting sent on the welcome topic when a peer joins it.
pub fn greeting(local_peer: &PeerId) -> Vec<u8> {
    format!("hi from {}", local_peer).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_from_topic() {
        let discovery = vec![PUBSUB_PEER_DISCOVERY.to_string()];
        assert_eq!(
            MessageKind::from_topic(PUBSUB_PEER_DISCOVERY, &discovery),
            MessageKind::Discovery
        );
        assert_eq!(
            MessageKind::from_topic(WELCOME_TOPIC, &discovery),
            MessageKind::Application
        );
        assert_eq!(
            MessageKind::from_topic(PUBSUB_PEER_DISCOVERY, &[]),
            MessageKind::Application
        );
    }

    #[test]
    fn test_gossip_stats_summary() {
        let mut stats = GossipStats::default();
        stats.record_received(&MessageKind::Application);
        stats.record_received(&MessageKind::Discovery);
        stats.record_received(&MessageKind::Discovery);
        stats.announcements_rejected += 1;
        stats.record_publish(true);
        stats.record_publish(false);

        assert_eq!(stats.messages_received, 3);
        assert_eq!(stats.announcements_received, 2);
        let summary = stats.summary();
        assert!(summary.contains("3 received"));
        assert!(summary.contains("1 application"));
        assert!(summary.contains("1 published, 1 failed"));
    }

    #[test]
    fn test_greeting_and_text() {
        let peer = PeerId::random();
        let msg = PubsubMessage {
            topic: WELCOME_TOPIC.to_string(),
            data: greeting(&peer),
            source: Some(peer),
            propagation_source: peer,
            message_id: "1".to_string(),
        };
        assert_eq!(msg.text(), format!("hi from {}", peer));
    }
}
