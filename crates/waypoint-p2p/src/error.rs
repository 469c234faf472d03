use thiserror::Error;

/// Errors raised while building, configuring or driving a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {reason}")]
    Identity { reason: String },

    #[error("Failed to build transport stack: {reason}")]
    Transport { reason: String },

    #[error("Failed to listen on {addr}: {reason}")]
    Listen { addr: String, reason: String },

    #[error("Dial to {addr} denied by connection gate: {reason}")]
    DialDenied { addr: String, reason: String },

    #[error("Dial to {addr} failed: {reason}")]
    DialFailed { addr: String, reason: String },

    #[error("Dial to {addr} timed out after {secs}s")]
    DialTimeout { addr: String, secs: u64 },

    #[error("Failed to subscribe to topic {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Failed to publish on topic {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Logging error: {reason}")]
    Logging { reason: String },

    #[error("Node event loop is not running")]
    NotRunning,
}

/// Errors from loading or validating a [`crate::NodeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("Invalid multiaddr {addr:?} in {field}: {reason}")]
    InvalidMultiaddr {
        field: &'static str,
        addr: String,
        reason: String,
    },

    #[error("Bootstrap address {addr:?} has no /p2p/ peer id")]
    MissingPeerId { addr: String },

    #[error("Invalid peer id {peer:?} in {field}: {reason}")]
    InvalidPeerId {
        field: &'static str,
        peer: String,
        reason: String,
    },

    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },

    #[error("At least one transport must be enabled")]
    NoTransports,

    #[error("Relay server mode requires at least one listen address")]
    RelayWithoutListenAddr,
}
