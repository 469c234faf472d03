//! # Waypoint P2P
//!
//! A libp2p node bootstrapper with relay-assisted connectivity and
//! topic-based peer discovery.
//!
//! ## Architecture
//!
//! - The swarm runs on its own tokio task ([`node`]); the rest of the
//!   program drives it through a cloneable [`NodeHandle`]
//! - TCP, WebSocket and QUIC transports, Noise encryption, Yamux
//!   multiplexing, plus the circuit relay v2 client transport
//! - Peers are found through a static bootstrap list and through
//!   announcements gossiped on a discovery topic
//! - Peers behind NAT reserve a slot on a relay and are reached through
//!   it; DCUtR then tries to upgrade relayed connections to direct ones
//! - A status reporter polls connection and address state on an interval
//!
//! ## Trust Model
//!
//! Gossip messages are signed and strictly validated. A discovery
//! announcement is only accepted when the peer it names is the peer that
//! signed it.
//!
//! Circuit relays forward encrypted streams. They learn who is connected
//! to whom, never the content.

pub mod behaviour;
pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod gate;
pub mod identity;
pub mod logging;
pub mod node;
pub mod pubsub;
pub mod relay;
pub mod status;
pub mod transport;

pub use config::NodeConfig;
pub use discovery::DiscoverySource;
pub use error::{ConfigError, NodeError};
pub use event::{ConnectionInfo, Direction, NodeEvent};
pub use logging::{init_logging, LogControl, LogFormat};
pub use node::{Node, NodeHandle};
pub use pubsub::{PubsubMessage, PUBSUB_PEER_DISCOVERY, WELCOME_TOPIC};
pub use status::{StatusReporter, StatusSnapshot};
pub use transport::TransportType;
