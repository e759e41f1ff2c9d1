//! Network configuration for a mesh node.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::message::{DEFAULT_MAX_PAYLOAD, DEFAULT_TTL};
use crate::relay::RelayMode;
use crate::transport::FrameLimits;

/// Configuration for the mesh networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on for incoming peer connections.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Address announced to peers in the hello message. Defaults to the
    /// bound listen address.
    pub advertise_addr: Option<SocketAddr>,

    /// Largest payload a message may carry, in bytes.
    pub max_payload_size: usize,

    /// Maximum number of simultaneously registered peers.
    pub max_peers: usize,

    /// Peers silent for longer than this are evicted.
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// How often a keep-alive hello is sent to every peer.
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// How often the idle sweeper runs.
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// How long a new connection may stay silent before it is dropped.
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Timeout for establishing an outbound connection.
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Timeout for writing one frame to a peer.
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Upper bound on how long `stop()` waits for background tasks.
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Which peers receive relayed messages.
    pub relay_mode: RelayMode,

    /// Hop budget stamped on messages this node originates.
    pub default_ttl: u8,

    /// Number of recent message ids remembered for duplicate suppression.
    pub seen_cache_capacity: usize,

    /// Capacity of the local delivery queue.
    pub inbox_capacity: usize,

    /// Bootstrap peer addresses (`host:port`) dialed on startup.
    pub known_peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            advertise_addr: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_peers: 64,
            idle_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            relay_mode: RelayMode::Flood,
            default_ttl: DEFAULT_TTL,
            seen_cache_capacity: 4096,
            inbox_capacity: 256,
            known_peers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// Framing limits derived from the payload limit.
    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_payload: self.max_payload_size,
            write_timeout: self.write_timeout,
        }
    }

    /// Save the config to a JSON file, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, NetworkError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Cannot load config file, using defaults: {e}");
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.listen_addr.port(), 8080);
        assert!(config.advertise_addr.is_none());
        assert_eq!(config.max_payload_size, 64 * 1024);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.relay_mode, RelayMode::Flood);
        assert_eq!(config.default_ttl, 8);
        assert!(config.known_peers.is_empty());
    }

    #[test]
    fn test_frame_limits_cover_max_payload() {
        let mut config = NetworkConfig::default();
        config.max_payload_size = 1024;
        let limits = config.frame_limits();
        assert_eq!(limits.max_payload, 1024);
        assert!(limits.max_body_len() > 1024);
        assert_eq!(limits.write_timeout, config.write_timeout);
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let mut config = NetworkConfig::default();
        config.relay_mode = RelayMode::SingleHop;
        config.advertise_addr = Some("10.0.0.7:8080".parse().unwrap());

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.listen_addr, config.listen_addr);
        assert_eq!(deserialized.advertise_addr, config.advertise_addr);
        assert_eq!(deserialized.relay_mode, RelayMode::SingleHop);
        assert_eq!(deserialized.sweep_interval, config.sweep_interval);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: NetworkConfig =
            serde_json::from_str(r#"{"listen_addr": "127.0.0.1:9000", "idle_timeout": 30}"#)
                .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.max_peers, 64);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut original = NetworkConfig::default();
        original.max_peers = 8;
        original.known_peers = vec!["192.168.1.100:8080".to_string()];
        original.save_to_file(&path).unwrap();

        let loaded = NetworkConfig::load_or_default(&path);
        assert_eq!(loaded.max_peers, 8);
        assert_eq!(loaded.known_peers, original.known_peers);
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetworkConfig::load_or_default(&dir.path().join("missing.json"));
        assert_eq!(config.max_peers, 64);
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let config = NetworkConfig::load_or_default(&path);
        assert_eq!(config.listen_addr.port(), 8080);

        assert!(matches!(
            NetworkConfig::load_from_file(&path),
            Err(NetworkError::Serialization(_))
        ));
        assert!(matches!(
            NetworkConfig::load_from_file(&dir.path().join("missing.json")),
            Err(NetworkError::Io(_))
        ));
    }
}
