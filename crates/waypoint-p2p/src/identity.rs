//! Node identity.
//!
//! A node either runs with a fixed identity (a protobuf-encoded keypair,
//! supplied as hex or as a file) or generates a fresh Ed25519 keypair at
//! start-up. Fixed identities let a relay keep the peer id that peers
//! carry in their bootstrap lists.

use std::path::PathBuf;

use libp2p::identity::Keypair;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Where the node's keypair comes from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex-encoded protobuf keypair. Takes precedence over `keypair_file`.
    pub keypair_hex: Option<String>,

    /// File holding a protobuf keypair, either raw bytes or hex text.
    pub keypair_file: Option<PathBuf>,
}

/// Resolve the configured identity, generating one if none is configured.
pub fn load_keypair(config: &IdentityConfig) -> Result<Keypair, NodeError> {
    if let Some(hex_str) = &config.keypair_hex {
        return keypair_from_hex(hex_str);
    }

    if let Some(path) = &config.keypair_file {
        let bytes = std::fs::read(path).map_err(|e| NodeError::Identity {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        return keypair_from_file_bytes(&bytes);
    }

    Ok(Keypair::generate_ed25519())
}

/// Decode a hex protobuf keypair. An optional `0x` prefix is accepted.
pub fn keypair_from_hex(hex_str: &str) -> Result<Keypair, NodeError> {
    let trimmed = hex_str.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(trimmed).map_err(|e| NodeError::Identity {
        reason: format!("invalid hex: {}", e),
    })?;
    keypair_from_protobuf(&bytes)
}

/// Encode a keypair as hex protobuf, the format [`keypair_from_hex`] reads.
pub fn encode_keypair_hex(keypair: &Keypair) -> Result<String, NodeError> {
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| NodeError::Identity {
            reason: format!("failed to encode keypair: {}", e),
        })?;
    Ok(hex::encode(bytes))
}

fn keypair_from_protobuf(bytes: &[u8]) -> Result<Keypair, NodeError> {
    Keypair::from_protobuf_encoding(bytes).map_err(|e| NodeError::Identity {
        reason: format!("invalid protobuf keypair: {}", e),
    })
}

// Files written by `waypoint keygen > key.hex` hold hex text; files
// exported by other libp2p tooling hold the raw protobuf.
fn keypair_from_file_bytes(bytes: &[u8]) -> Result<Keypair, NodeError> {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.trim().is_empty() && text.trim().bytes().all(|b| b.is_ascii_hexdigit()) => {
            keypair_from_hex(text)
        }
        _ => keypair_from_protobuf(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hex_roundtrip_keeps_peer_id() {
        let keypair = Keypair::generate_ed25519();
        let hex_str = encode_keypair_hex(&keypair).unwrap();

        let restored = keypair_from_hex(&hex_str).unwrap();
        assert_eq!(restored.public().to_peer_id(), keypair.public().to_peer_id());

        let prefixed = keypair_from_hex(&format!("0x{}\n", hex_str)).unwrap();
        assert_eq!(prefixed.public().to_peer_id(), keypair.public().to_peer_id());
    }

    #[test]
    fn test_invalid_hex_is_rejected() {
        assert!(matches!(
            keypair_from_hex("zz"),
            Err(NodeError::Identity { .. })
        ));
        assert!(matches!(
            keypair_from_hex("deadbeef"),
            Err(NodeError::Identity { .. })
        ));
    }

    #[test]
    fn test_load_from_hex_and_binary_files() {
        let keypair = Keypair::generate_ed25519();
        let expected = keypair.public().to_peer_id();

        let mut hex_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(hex_file, "{}", encode_keypair_hex(&keypair).unwrap()).unwrap();
        let config = IdentityConfig {
            keypair_file: Some(hex_file.path().to_path_buf()),
            ..IdentityConfig::default()
        };
        assert_eq!(load_keypair(&config).unwrap().public().to_peer_id(), expected);

        let mut bin_file = tempfile::NamedTempFile::new().unwrap();
        bin_file
            .write_all(&keypair.to_protobuf_encoding().unwrap())
            .unwrap();
        let config = IdentityConfig {
            keypair_file: Some(bin_file.path().to_path_buf()),
            ..IdentityConfig::default()
        };
        assert_eq!(load_keypair(&config).unwrap().public().to_peer_id(), expected);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let config = IdentityConfig {
            keypair_file: Some(PathBuf::from("/nonexistent/waypoint.key")),
            ..IdentityConfig::default()
        };
        assert!(load_keypair(&config).is_err());
    }

    #[test]
    fn test_default_generates_fresh_identity() {
        let a = load_keypair(&IdentityConfig::default()).unwrap();
        let b = load_keypair(&IdentityConfig::default()).unwrap();
        assert_ne!(a.public().to_peer_id(), b.public().to_peer_id());
    }
}
