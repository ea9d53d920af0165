//! Node configuration.
//!
//! A `NodeConfig` is plain data: construct it, tweak the fields (or use the
//! `with_` helpers), and hand it to [`Node::new`](crate::node::Node::new),
//! which validates it. File and environment loaders live outside the core
//! and deserialize into this struct via serde.

use std::time::Duration;

use asoc_wire::protocol::DEFAULT_MAX_FRAME_BYTES;
use asoc_wire::ApiKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NodeError;
use crate::streaming::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Main node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster name. Public; only its hash travels on the wire.
    pub community: String,

    /// Shared secret keying all HMACs. At least 16 bytes; 32 recommended.
    pub api_key: Vec<u8>,

    /// TCP port where this node accepts sessions.
    #[serde(default = "default_port")]
    pub port: u16,

    /// UDP port for discovery broadcasts.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// Peers to dial directly, as "host:port". With static peers configured,
    /// discovery defaults to off; set `enable_discovery` for hybrid mode.
    #[serde(default)]
    pub static_peers: Vec<String>,

    /// Explicitly enable or disable discovery. Unset: on iff no static peers.
    #[serde(default)]
    pub enable_discovery: Option<bool>,

    /// Seconds between discovery broadcasts.
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_s: u64,

    /// Seconds a peer stays in the table without a fresh datagram.
    #[serde(default = "default_peer_ttl")]
    pub peer_ttl_s: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_s: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_s: u64,

    /// Cap on a single frame's payload.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Default outbound chunk size; overridable per stream.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Seed the node identity instead of drawing a fresh one.
    #[serde(default)]
    pub node_id: Option<Uuid>,
}

fn default_port() -> u16 {
    9000
}

fn default_discovery_port() -> u16 {
    9999
}

fn default_broadcast_interval() -> u64 {
    3
}

fn default_peer_ttl() -> u64 {
    15
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

impl NodeConfig {
    /// A configuration with the given community and key and all defaults.
    pub fn new(community: impl Into<String>, api_key: impl Into<Vec<u8>>) -> Self {
        Self {
            community: community.into(),
            api_key: api_key.into(),
            port: default_port(),
            discovery_port: default_discovery_port(),
            static_peers: Vec::new(),
            enable_discovery: None,
            broadcast_interval_s: default_broadcast_interval(),
            peer_ttl_s: default_peer_ttl(),
            handshake_timeout_s: default_handshake_timeout(),
            idle_timeout_s: default_idle_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            chunk_size: default_chunk_size(),
            node_id: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn with_static_peers(mut self, peers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.static_peers = peers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_discovery(mut self, enable: bool) -> Self {
        self.enable_discovery = Some(enable);
        self
    }

    pub fn with_node_id(mut self, id: Uuid) -> Self {
        self.node_id = Some(id);
        self
    }

    /// Whether the discovery loops should run (see `enable_discovery`).
    pub fn discovery_enabled(&self) -> bool {
        self.enable_discovery
            .unwrap_or_else(|| self.static_peers.is_empty())
    }

    pub fn api_key(&self) -> ApiKey {
        ApiKey::new(self.api_key.clone())
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_s)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_s)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_s)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_s)
    }

    /// Check the configuration, including static peer syntax.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.community.is_empty() {
            return Err(NodeError::Config("community must not be empty".into()));
        }
        if self.api_key.len() < ApiKey::MIN_LEN {
            return Err(NodeError::Config(format!(
                "api_key must be at least {} bytes, got {}",
                ApiKey::MIN_LEN,
                self.api_key.len()
            )));
        }
        if self.port == 0 {
            return Err(NodeError::Config("port must be in 1..=65535".into()));
        }
        if self.discovery_port == 0 {
            return Err(NodeError::Config(
                "discovery_port must be in 1..=65535".into(),
            ));
        }
        if self.broadcast_interval_s < 1 {
            return Err(NodeError::Config(
                "broadcast_interval_s must be at least 1".into(),
            ));
        }
        if self.peer_ttl_s < self.broadcast_interval_s {
            return Err(NodeError::Config(
                "peer_ttl_s must be at least broadcast_interval_s".into(),
            ));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(NodeError::Config(format!(
                "chunk_size {} outside {}..={}",
                self.chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        if self.max_frame_bytes < self.chunk_size {
            return Err(NodeError::Config(
                "max_frame_bytes must be at least chunk_size".into(),
            ));
        }
        self.parsed_static_peers()?;
        Ok(())
    }

    /// Parse `static_peers` into (host, port) pairs.
    pub(crate) fn parsed_static_peers(&self) -> Result<Vec<(String, u16)>, NodeError> {
        let mut out = Vec::with_capacity(self.static_peers.len());
        for peer in &self.static_peers {
            let (host, port_str) = peer.rsplit_once(':').ok_or_else(|| {
                NodeError::Config(format!("invalid static peer '{peer}': expected host:port"))
            })?;
            let port: u16 = port_str.parse().map_err(|_| {
                NodeError::Config(format!("invalid static peer '{peer}': bad port"))
            })?;
            if host.is_empty() || port == 0 {
                return Err(NodeError::Config(format!("invalid static peer '{peer}'")));
            }
            out.push((host.trim().to_string(), port));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> NodeConfig {
        NodeConfig::new("test-cluster", *b"0123456789abcdef0123456789abcdef")
    }

    #[test]
    fn defaults_are_valid() {
        let config = base();
        config.validate().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.discovery_port, 9999);
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.max_frame_bytes, 16 * 1024 * 1024);
        assert!(config.discovery_enabled());
    }

    #[test]
    fn static_peers_disable_discovery_by_default() {
        let config = base().with_static_peers(["10.0.0.1:9000"]);
        assert!(!config.discovery_enabled());
        // Hybrid mode: both sources.
        let hybrid = base()
            .with_static_peers(["10.0.0.1:9000"])
            .with_discovery(true);
        assert!(hybrid.discovery_enabled());
    }

    #[test]
    fn rejects_short_api_key() {
        let config = NodeConfig::new("c", b"too-short".to_vec());
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn rejects_empty_community() {
        let config = NodeConfig::new("", *b"0123456789abcdef");
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn rejects_chunk_size_out_of_range() {
        let mut config = base();
        config.chunk_size = 1024;
        assert!(config.validate().is_err());
        config.chunk_size = 32 * 1024 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_ttl_below_interval() {
        let mut config = base();
        config.broadcast_interval_s = 10;
        config.peer_ttl_s = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_static_peers() {
        let config = base().with_static_peers(["10.0.1.10:9000", "node3.example.com:9001"]);
        let parsed = config.parsed_static_peers().unwrap();
        assert_eq!(parsed[0], ("10.0.1.10".to_string(), 9000));
        assert_eq!(parsed[1], ("node3.example.com".to_string(), 9001));
    }

    #[test]
    fn rejects_malformed_static_peers() {
        for bad in ["no-port", "host:", "host:0", "host:notaport", ":9000"] {
            let config = base().with_static_peers([bad]);
            assert!(config.validate().is_err(), "accepted {bad}");
        }
    }
}
