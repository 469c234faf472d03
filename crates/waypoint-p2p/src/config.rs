//! Node configuration with TOML file support.

use std::path::Path;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use crate::bootstrap::BootstrapConfig;
use crate::discovery::DiscoveryConfig;
use crate::error::ConfigError;
use crate::gate::GateConfig;
use crate::identity::IdentityConfig;
use crate::logging::LogFormat;
use crate::pubsub::WELCOME_TOPIC;
use crate::relay::{RelayConfig, RelayServerConfig};
use crate::transport::{TransportConfig, TransportType};

/// Listen addresses of the relay server.
pub const RELAY_LISTEN_ADDRS: &[&str] = &["/ip4/0.0.0.0/tcp/9001/ws", "/ip4/0.0.0.0/tcp/9002"];

/// Configuration for a Waypoint node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests). Every field has a default, so
/// a file only needs to name what it changes.
///
/// Table-valued fields must stay after the plain ones for TOML output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Multiaddrs to listen on.
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Application topics to subscribe to on start.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Say hello on the welcome topic whenever a peer joins it.
    #[serde(default = "default_true")]
    pub greeting: bool,

    /// Status reporter period in seconds.
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// Upper bound on a single dial.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Idle connections are closed after this many seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_connection_timeout_secs: u64,

    /// Discovery-driven dials stop once this many connections are open.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Run AutoNAT to learn whether we are publicly reachable.
    #[serde(default)]
    pub enable_autonat: bool,

    /// Identify protocol version string.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Log filter directives, e.g. "info" or "info,waypoint_p2p=debug".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub transports: TransportConfig,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub identity: IdentityConfig,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_listen() -> Vec<String> {
    vec![
        "/ip4/0.0.0.0/tcp/0".to_string(),
        "/ip4/0.0.0.0/tcp/0/ws".to_string(),
        "/ip4/0.0.0.0/udp/0/quic-v1".to_string(),
    ]
}

fn default_topics() -> Vec<String> {
    vec![WELCOME_TOPIC.to_string()]
}

fn default_true() -> bool {
    true
}

fn default_status_interval() -> u64 {
    5
}

fn default_dial_timeout() -> u64 {
    20
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    50
}

fn default_protocol_version() -> String {
    "/waypoint/0.1.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::peer()
    }
}

impl NodeConfig {
    /// A regular peer: bootstraps from the local relay, discovers other
    /// peers over gossip, reserves a slot on one relay and greets peers on
    /// the welcome topic.
    pub fn peer() -> Self {
        Self {
            listen: default_listen(),
            transports: TransportConfig::default(),
            bootstrap: BootstrapConfig::default(),
            discovery: DiscoveryConfig::default(),
            relay: RelayConfig::default(),
            gate: GateConfig::default(),
            identity: IdentityConfig::default(),
            topics: default_topics(),
            greeting: true,
            status_interval_secs: default_status_interval(),
            dial_timeout_secs: default_dial_timeout(),
            idle_connection_timeout_secs: default_idle_timeout(),
            max_connections: default_max_connections(),
            enable_autonat: false,
            protocol_version: default_protocol_version(),
            log_format: LogFormat::default(),
            log_level: default_log_level(),
        }
    }

    /// A relay server: fixed listen ports, unlimited reservations, AutoNAT,
    /// and a discovery-topic subscription so announcements propagate
    /// through it. It neither bootstraps nor reserves on other relays.
    pub fn relay() -> Self {
        Self {
            listen: RELAY_LISTEN_ADDRS.iter().map(|s| s.to_string()).collect(),
            transports: TransportConfig {
                enable_quic: false,
                ..TransportConfig::default()
            },
            bootstrap: BootstrapConfig::none(),
            discovery: DiscoveryConfig {
                listen_only: true,
                auto_dial: false,
                ..DiscoveryConfig::default()
            },
            relay: RelayConfig {
                discover_relays: 0,
                enable_hole_punching: false,
                server: RelayServerConfig {
                    enabled: true,
                    ..RelayServerConfig::default()
                },
            },
            topics: Vec::new(),
            greeting: false,
            enable_autonat: true,
            ..Self::peer()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Load a TOML file on top of `self`. Keys the file leaves out keep
    /// their current values instead of falling back to the peer defaults.
    pub fn merge_toml_file(&self, path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.merge_toml_str(&contents)
    }

    /// Apply a TOML document over `self`. Tables merge key by key; arrays
    /// and plain values replace.
    pub fn merge_toml_str(&self, contents: &str) -> Result<Self, ConfigError> {
        let parse_error = |reason: String| ConfigError::Parse { reason };
        let overlay: toml::Table =
            toml::from_str(contents).map_err(|e| parse_error(e.to_string()))?;
        let mut merged = match toml::Value::try_from(self) {
            Ok(toml::Value::Table(table)) => table,
            Ok(_) => return Err(parse_error("config did not serialize to a table".to_string())),
            Err(e) => return Err(parse_error(e.to_string())),
        };
        merge_tables(&mut merged, overlay);
        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| parse_error(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Check the configuration for errors a node could not start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.transports.any_enabled() {
            return Err(ConfigError::NoTransports);
        }
        self.listen_addrs()?;
        self.bootstrap.parse()?;
        for peer in &self.gate.denied_peers {
            peer.parse::<PeerId>()
                .map_err(|e| ConfigError::InvalidPeerId {
                    field: "gate.denied_peers",
                    peer: peer.clone(),
                    reason: e.to_string(),
                })?;
        }
        if self.status_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "status_interval_secs",
            });
        }
        if self.dial_timeout_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "dial_timeout_secs",
            });
        }
        if self.discovery.enabled && self.discovery.interval_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "discovery.interval_ms",
            });
        }
        if self.relay.server.enabled && self.enabled_listen_addrs()?.is_empty() {
            return Err(ConfigError::RelayWithoutListenAddr);
        }
        Ok(())
    }

    /// All configured listen addresses, parsed.
    pub fn listen_addrs(&self) -> Result<Vec<Multiaddr>, ConfigError> {
        self.listen
            .iter()
            .map(|s| {
                s.parse::<Multiaddr>()
                    .map_err(|e| ConfigError::InvalidMultiaddr {
                        field: "listen",
                        addr: s.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect()
    }

    /// Listen addresses whose transport is enabled.
    pub fn enabled_listen_addrs(&self) -> Result<Vec<Multiaddr>, ConfigError> {
        Ok(self
            .listen_addrs()?
            .into_iter()
            .filter(|a| self.transports.allows(TransportType::from_multiaddr(a)))
            .collect())
    }

    /// Topics to subscribe on start: application topics followed by
    /// discovery topics, without duplicates.
    pub fn all_topics(&self) -> Vec<String> {
        let mut topics = self.topics.clone();
        if self.discovery.enabled {
            for t in &self.discovery.topics {
                if !topics.contains(t) {
                    topics.push(t.clone());
                }
            }
        }
        topics
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_timeout_secs)
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(nested) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, nested);
                continue;
            }
            base.insert(key, toml::Value::Table(nested));
        } else {
            base.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::PUBSUB_PEER_DISCOVERY;

    #[test]
    fn test_presets_are_valid() {
        NodeConfig::peer().validate().unwrap();
        NodeConfig::relay().validate().unwrap();
    }

    #[test]
    fn test_relay_preset() {
        let relay = NodeConfig::relay();
        assert!(relay.relay.server.enabled);
        assert_eq!(relay.relay.server.max_reservations, None);
        assert!(relay.bootstrap.peers.is_empty());
        assert!(relay.discovery.listen_only);
        assert_eq!(relay.all_topics(), vec![PUBSUB_PEER_DISCOVERY.to_string()]);
        assert_eq!(
            relay.listen,
            vec!["/ip4/0.0.0.0/tcp/9001/ws", "/ip4/0.0.0.0/tcp/9002"]
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = NodeConfig::from_toml_str(
            r#"
            listen = ["/ip4/127.0.0.1/tcp/4001"]
            status_interval_secs = 1

            [bootstrap]
            peers = []

            [gate]
            allow_private_addresses = false
            "#,
        )
        .unwrap();

        assert_eq!(config.listen, vec!["/ip4/127.0.0.1/tcp/4001"]);
        assert_eq!(config.status_interval(), Duration::from_secs(1));
        assert!(config.bootstrap.peers.is_empty());
        assert!(!config.gate.allow_private_addresses);
        assert_eq!(config.topics, vec![WELCOME_TOPIC.to_string()]);
        assert_eq!(config.discovery.interval_ms, 10_000);
        assert_eq!(config.relay.discover_relays, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let config = NodeConfig::relay();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), config.to_toml_string().unwrap()).unwrap();
        assert_eq!(NodeConfig::from_toml_file(file.path()).unwrap(), config);
    }

    #[test]
    fn test_merge_keeps_preset_values() {
        let relay = NodeConfig::relay();
        let config = relay.merge_toml_str(r#"log_level = "debug""#).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(
            config,
            NodeConfig {
                log_level: "debug".to_string(),
                ..NodeConfig::relay()
            }
        );
        assert!(config.relay.server.enabled);
        assert!(config.bootstrap.peers.is_empty());
        assert_eq!(config.relay.discover_relays, 0);
    }

    #[test]
    fn test_merge_nested_tables_key_by_key() {
        let config = NodeConfig::relay()
            .merge_toml_str(
                r#"
                listen = ["/ip4/127.0.0.1/tcp/7000"]

                [relay.server]
                max_reservations = 4

                [discovery]
                interval_ms = 500
                "#,
            )
            .unwrap();
        assert_eq!(config.listen, vec!["/ip4/127.0.0.1/tcp/7000"]);
        assert!(config.relay.server.enabled);
        assert_eq!(config.relay.server.max_reservations, Some(4));
        assert!(!config.relay.enable_hole_punching);
        assert_eq!(config.discovery.interval_ms, 500);
        assert!(config.discovery.listen_only);

        assert!(matches!(
            NodeConfig::relay().merge_toml_str("listen = ["),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_merge_file_over_peer_matches_plain_load() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "status_interval_secs = 2\n").unwrap();
        assert_eq!(
            NodeConfig::peer().merge_toml_file(file.path()).unwrap(),
            NodeConfig::from_toml_file(file.path()).unwrap()
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = NodeConfig::peer();
        config.listen.push("not-a-multiaddr".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMultiaddr { field: "listen", .. })
        ));

        let mut config = NodeConfig::peer();
        config.bootstrap.peers = vec!["/ip4/127.0.0.1/tcp/9001/ws".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPeerId { .. })
        ));

        let mut config = NodeConfig::peer();
        config.status_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval { .. })
        ));

        let mut config = NodeConfig::peer();
        config.gate.denied_peers = vec!["bogus".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPeerId { .. })
        ));

        let mut config = NodeConfig::peer();
        config.transports = TransportConfig {
            enable_tcp: false,
            enable_websocket: false,
            enable_quic: false,
            enable_relay: false,
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoTransports)));

        let mut config = NodeConfig::relay();
        config.transports.enable_tcp = false;
        config.transports.enable_websocket = false;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelayWithoutListenAddr)
        ));
    }

    #[test]
    fn test_enabled_listen_addrs_filters_by_transport() {
        let mut config = NodeConfig::peer();
        config.transports.enable_quic = false;
        let addrs = config.enabled_listen_addrs().unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs
            .iter()
            .all(|a| TransportType::from_multiaddr(a) != TransportType::Quic));
    }
}
