//! Transport classification and configuration.
//!
//! The native swarm always carries TCP, QUIC, WebSocket and circuit relay
//! transports, secured with Noise and multiplexed with Yamux. The
//! [`TransportConfig`] flags decide which of them the node listens on and
//! dials through.
//!
//! Browser transports (WebRTC, WebTransport) are recognised when they show
//! up in peer addresses so that status output can account for browser
//! peers, but they cannot be dialled from a native node.

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

/// Transport a connection (or an address) runs over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportType {
    /// Browser-to-browser WebRTC, usually negotiated through a relay.
    WebRTC,
    /// WebRTC to a server with a certificate hash in its address.
    WebRTCDirect,
    /// WebTransport over QUIC (browser only).
    WebTransport,
    /// Circuit relay v2, traffic forwarded by a third peer.
    CircuitRelay,
    /// WebSocket over TLS.
    WebSocketSecure,
    /// Plain WebSocket.
    WebSocket,
    /// QUIC v1.
    Quic,
    /// Raw TCP.
    Tcp,
    /// Anything else.
    Other,
}

impl TransportType {
    /// All variants, in classification precedence order.
    pub const ALL: [TransportType; 9] = [
        TransportType::WebRTC,
        TransportType::WebRTCDirect,
        TransportType::WebTransport,
        TransportType::CircuitRelay,
        TransportType::WebSocketSecure,
        TransportType::WebSocket,
        TransportType::Quic,
        TransportType::Tcp,
        TransportType::Other,
    ];

    /// Classify a multiaddr by the transport it names.
    ///
    /// A WebRTC address that traverses a relay counts as WebRTC: the relay
    /// is only used for signalling and the data path is direct.
    pub fn from_multiaddr(addr: &Multiaddr) -> Self {
        let mut webrtc = false;
        let mut webrtc_direct = false;
        let mut webtransport = false;
        let mut circuit = false;
        let mut tls = false;
        let mut ws = false;
        let mut wss = false;
        let mut quic = false;
        let mut tcp = false;

        for protocol in addr.iter() {
            match protocol {
                Protocol::WebRTC => webrtc = true,
                Protocol::WebRTCDirect => webrtc_direct = true,
                Protocol::WebTransport => webtransport = true,
                Protocol::P2pCircuit => circuit = true,
                Protocol::Tls => tls = true,
                Protocol::Ws(_) => ws = true,
                Protocol::Wss(_) => wss = true,
                Protocol::QuicV1 | Protocol::Quic => quic = true,
                Protocol::Tcp(_) => tcp = true,
                _ => {}
            }
        }

        if webrtc {
            TransportType::WebRTC
        } else if webrtc_direct {
            TransportType::WebRTCDirect
        } else if webtransport {
            TransportType::WebTransport
        } else if circuit {
            TransportType::CircuitRelay
        } else if wss || (tls && ws) {
            TransportType::WebSocketSecure
        } else if ws {
            TransportType::WebSocket
        } else if quic {
            TransportType::Quic
        } else if tcp {
            TransportType::Tcp
        } else {
            TransportType::Other
        }
    }

    /// Whether data flows without an intermediary.
    pub fn is_direct(&self) -> bool {
        !matches!(self, TransportType::CircuitRelay | TransportType::Other)
    }

    /// Whether rust-libp2p can dial this transport outside a browser.
    pub fn is_native(&self) -> bool {
        !matches!(
            self,
            TransportType::WebRTC | TransportType::WebRTCDirect | TransportType::WebTransport
        )
    }

    /// Short label used in status output.
    pub fn label(&self) -> &'static str {
        match self {
            TransportType::WebRTC => "WebRTC",
            TransportType::WebRTCDirect => "WebRTC Direct",
            TransportType::WebTransport => "WebTransport",
            TransportType::CircuitRelay => "Circuit Relay",
            TransportType::WebSocketSecure => "WebSockets (secure)",
            TransportType::WebSocket => "WebSockets",
            TransportType::Quic => "QUIC",
            TransportType::Tcp => "TCP",
            TransportType::Other => "Other",
        }
    }
}

/// Which transports the node listens on and dials through.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Raw TCP.
    pub enable_tcp: bool,

    /// WebSocket (plain and secure). Browser peers reach native nodes
    /// this way.
    pub enable_websocket: bool,

    /// QUIC v1.
    pub enable_quic: bool,

    /// Circuit relay v2 client transport. Required for relay reservations
    /// and for reaching peers that are only reachable through a relay.
    pub enable_relay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enable_tcp: true,
            enable_websocket: true,
            enable_quic: true,
            enable_relay: true,
        }
    }
}

impl TransportConfig {
    /// Whether any transport is turned on.
    pub fn any_enabled(&self) -> bool {
        self.enable_tcp || self.enable_websocket || self.enable_quic || self.enable_relay
    }

    /// Whether this configuration permits using the given transport.
    pub fn allows(&self, transport: TransportType) -> bool {
        match transport {
            TransportType::Tcp => self.enable_tcp,
            TransportType::WebSocket | TransportType::WebSocketSecure => self.enable_websocket,
            TransportType::Quic => self.enable_quic,
            TransportType::CircuitRelay => self.enable_relay,
            TransportType::WebRTC
            | TransportType::WebRTCDirect
            | TransportType::WebTransport
            | TransportType::Other => false,
        }
    }
}

/// Connection counts broken down by transport.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Number of active connections by transport type, in precedence order.
    pub connections: Vec<(TransportType, usize)>,
    /// Total number of active connections.
    pub total: usize,
    /// Whether any connection goes through a relay.
    pub using_relay: bool,
    /// Whether at least one connection is direct.
    pub has_direct_connection: bool,
}

impl TransportStats {
    /// Tally the given transports. Every known type appears in the result,
    /// including those with zero connections.
    pub fn from_transports<I>(transports: I) -> Self
    where
        I: IntoIterator<Item = TransportType>,
    {
        let mut counts = [0usize; TransportType::ALL.len()];
        let mut total = 0;
        for transport in transports {
            let idx = TransportType::ALL
                .iter()
                .position(|t| *t == transport)
                .unwrap_or(TransportType::ALL.len() - 1);
            counts[idx] += 1;
            total += 1;
        }

        let connections: Vec<(TransportType, usize)> = TransportType::ALL
            .iter()
            .copied()
            .zip(counts)
            .collect();

        let using_relay = connections
            .iter()
            .any(|(t, n)| *t == TransportType::CircuitRelay && *n > 0);
        let has_direct_connection = connections.iter().any(|(t, n)| t.is_direct() && *n > 0);

        Self {
            connections,
            total,
            using_relay,
            has_direct_connection,
        }
    }

    /// Count for one transport.
    pub fn count(&self, transport: TransportType) -> usize {
        self.connections
            .iter()
            .find(|(t, _)| *t == transport)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    /// `"WebSockets: 2, Circuit Relay: 1"`, omitting empty types.
    pub fn describe(&self) -> String {
        let parts: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(t, n)| format!("{}: {}", t.label(), n))
            .collect();
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Peer id of the relay in a circuit address
/// (`.../p2p/<relay>/p2p-circuit/...`).
pub fn relay_peer_of(addr: &Multiaddr) -> Option<PeerId> {
    let mut last_peer = None;
    for protocol in addr.iter() {
        match protocol {
            Protocol::P2p(peer) => last_peer = Some(peer),
            Protocol::P2pCircuit => return last_peer,
            _ => {}
        }
    }
    None
}

/// Trailing `/p2p/<id>` of an address, if present.
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer)) => Some(peer),
        _ => None,
    }
}

/// Append `/p2p/<peer>` unless the address already ends with a peer id.
pub fn with_peer_id(addr: &Multiaddr, peer: PeerId) -> Multiaddr {
    if peer_id_of(addr).is_some() {
        addr.clone()
    } else {
        addr.clone().with(Protocol::P2p(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELAY: &str = "12D3KooWATM3WBM9SaBmf88B57Msggrui7tarypMmcca72cUD4ed";

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_classify_native_transports() {
        assert_eq!(
            TransportType::from_multiaddr(&ma("/ip4/127.0.0.1/tcp/9002")),
            TransportType::Tcp
        );
        assert_eq!(
            TransportType::from_multiaddr(&ma("/ip4/127.0.0.1/tcp/9001/ws")),
            TransportType::WebSocket
        );
        assert_eq!(
            TransportType::from_multiaddr(&ma("/dns4/relay.example.com/tcp/443/wss")),
            TransportType::WebSocketSecure
        );
        assert_eq!(
            TransportType::from_multiaddr(&ma("/ip4/127.0.0.1/udp/9003/quic-v1")),
            TransportType::Quic
        );
    }

    #[test]
    fn test_classify_relay_and_browser_transports() {
        let circuit = ma(&format!(
            "/ip4/127.0.0.1/tcp/9002/p2p/{RELAY}/p2p-circuit"
        ));
        assert_eq!(TransportType::from_multiaddr(&circuit), TransportType::CircuitRelay);

        let webrtc = ma(&format!(
            "/ip4/127.0.0.1/tcp/9001/ws/p2p/{RELAY}/p2p-circuit/webrtc"
        ));
        assert_eq!(TransportType::from_multiaddr(&webrtc), TransportType::WebRTC);

        assert_eq!(
            TransportType::from_multiaddr(&ma("/ip4/127.0.0.1/udp/9004/webrtc-direct")),
            TransportType::WebRTCDirect
        );
        assert_eq!(
            TransportType::from_multiaddr(&ma("/ip4/127.0.0.1/udp/9005/quic-v1/webtransport")),
            TransportType::WebTransport
        );
        assert_eq!(
            TransportType::from_multiaddr(&ma("/ip4/127.0.0.1")),
            TransportType::Other
        );
    }

    #[test]
    fn test_transport_config_allows() {
        let config = TransportConfig {
            enable_quic: false,
            ..TransportConfig::default()
        };
        assert!(config.allows(TransportType::Tcp));
        assert!(config.allows(TransportType::WebSocketSecure));
        assert!(!config.allows(TransportType::Quic));
        assert!(!config.allows(TransportType::WebRTC));
        assert!(config.any_enabled());

        let none = TransportConfig {
            enable_tcp: false,
            enable_websocket: false,
            enable_quic: false,
            enable_relay: false,
        };
        assert!(!none.any_enabled());
    }

    #[test]
    fn test_transport_stats() {
        let stats = TransportStats::from_transports([
            TransportType::WebSocket,
            TransportType::WebSocket,
            TransportType::CircuitRelay,
        ]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.count(TransportType::WebSocket), 2);
        assert_eq!(stats.count(TransportType::Tcp), 0);
        assert!(stats.using_relay);
        assert!(stats.has_direct_connection);
        assert_eq!(stats.describe(), "Circuit Relay: 1, WebSockets: 2");

        let empty = TransportStats::from_transports([]);
        assert_eq!(empty.total, 0);
        assert!(!empty.has_direct_connection);
        assert_eq!(empty.describe(), "none");
    }

    #[test]
    fn test_relay_peer_extraction() {
        let relay: PeerId = RELAY.parse().unwrap();
        let circuit = ma(&format!("/ip4/10.0.0.1/tcp/9002/p2p/{RELAY}/p2p-circuit"));
        assert_eq!(relay_peer_of(&circuit), Some(relay));
        assert_eq!(relay_peer_of(&ma(&format!("/ip4/10.0.0.1/tcp/9002/p2p/{RELAY}"))), None);

        let plain = ma("/ip4/10.0.0.1/tcp/9002");
        assert_eq!(peer_id_of(&plain), None);
        let with = with_peer_id(&plain, relay);
        assert_eq!(peer_id_of(&with), Some(relay));
        assert_eq!(with_peer_id(&with, relay), with);
    }
}
