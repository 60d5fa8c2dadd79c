//! Network configuration for a participant.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunk::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::error::NetworkError;
use crate::identity::{ParticipantAddress, ParticipantId, ParticipantType};

/// Protocol version spoken by this build.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

/// Minimum distance between alive interval and alive timeout before a
/// warning is logged.
pub const ALIVE_TIMEOUT_MARGIN: Duration = Duration::from_millis(100);

/// Address of the upstream daemon to connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonAddress {
    pub ip: String,
    pub port: u16,
}

/// Configuration for one connection system instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Our unique id on the mesh.
    pub participant_id: ParticipantId,

    /// Human-readable name, used in logs and announced to peers.
    pub participant_name: String,

    /// IP announced to peers so they can connect back.
    pub ip: String,

    /// Port to listen on. 0 lets the OS choose.
    pub port: u16,

    /// Upstream daemon, if any.
    pub daemon: Option<DaemonAddress>,

    /// Act as an address-exchange relay.
    pub relay: bool,

    /// With `relay`, do not take part in scene traffic.
    pub pure_daemon: bool,

    /// Peers with a different version are dropped.
    pub protocol_version: u32,

    /// Idle time after which an Alive message is sent.
    #[serde(with = "duration_ms_serde")]
    pub alive_interval: Duration,

    /// Silence after which a peer is considered dead.
    #[serde(with = "duration_ms_serde")]
    pub alive_timeout: Duration,

    /// Size of one scene-update chunk and of the socket send buffer.
    pub chunk_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            participant_id: ParticipantId::generate(),
            participant_name: String::from("participant"),
            ip: String::from("127.0.0.1"),
            port: 0,
            daemon: None,
            relay: false,
            pure_daemon: false,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            alive_interval: Duration::from_millis(300),
            alive_timeout: Duration::from_millis(1000),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl NetworkConfig {
    /// Config for a plain client with a fresh id.
    pub fn client(name: impl Into<String>) -> Self {
        Self {
            participant_name: name.into(),
            ..Self::default()
        }
    }

    /// Config for a relay daemon listening on `port`.
    pub fn daemon(name: impl Into<String>, port: u16) -> Self {
        Self {
            participant_name: name.into(),
            port,
            relay: true,
            ..Self::default()
        }
    }

    /// Role announced in our hello.
    pub fn participant_type(&self) -> ParticipantType {
        match (self.relay, self.pure_daemon) {
            (true, true) => ParticipantType::PureDaemon,
            (true, false) => ParticipantType::Daemon,
            (false, _) => ParticipantType::Client,
        }
    }

    /// Our own identity, with the configured (not the bound) port.
    pub fn participant_address(&self) -> ParticipantAddress {
        ParticipantAddress::new(
            self.participant_id,
            self.participant_name.clone(),
            self.ip.clone(),
            self.port,
        )
    }

    /// The configured daemon, unless it is unset, has port 0, or is ourselves.
    pub fn other_daemon(&self) -> Option<&DaemonAddress> {
        self.daemon
            .as_ref()
            .filter(|d| d.port != 0 && !(d.ip == self.ip && d.port == self.port))
    }

    /// Whether the alive timeout leaves too little room after the interval.
    pub fn alive_timeout_too_low(&self) -> bool {
        self.alive_timeout < self.alive_interval + ALIVE_TIMEOUT_MARGIN
    }

    /// Repair values no running system can use, logging each repair:
    /// a nil participant id gets a fresh one and the chunk size is
    /// clamped to `1..=MAX_CHUNK_SIZE`.
    pub fn normalize(&mut self) {
        if self.participant_id.is_invalid() {
            self.participant_id = ParticipantId::generate();
            warn!(
                "Config for '{}' has no participant id, using {}",
                self.participant_name, self.participant_id
            );
        }
        if self.chunk_size == 0 {
            warn!("Chunk size 0 is not usable, using {DEFAULT_CHUNK_SIZE}");
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        } else if self.chunk_size > MAX_CHUNK_SIZE {
            warn!(
                "Chunk size {} exceeds the frame limit, using {MAX_CHUNK_SIZE}",
                self.chunk_size
            );
            self.chunk_size = MAX_CHUNK_SIZE;
        }
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        debug!("Saved network config for '{}' to {}", self.participant_name, path.display());
        Ok(())
    }

    /// Load and normalize a JSON config. A missing file yields defaults
    /// silently; an unreadable or corrupt one yields defaults with a
    /// warning naming the file.
    pub fn load_or_default(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str::<NetworkConfig>(&data).unwrap_or_else(|e| {
                warn!("Corrupt network config {}, using defaults: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Cannot read network config {}, using defaults: {e}", path.display());
                Self::default()
            }
        };
        config.normalize();
        config
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
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
        assert_eq!(config.port, 0);
        assert!(config.daemon.is_none());
        assert_eq!(config.participant_type(), ParticipantType::Client);
        assert_eq!(config.chunk_size, 300_000);
        assert!(!config.alive_timeout_too_low());
        assert!(!config.participant_id.is_invalid());
    }

    #[test]
    fn test_participant_type_from_flags() {
        let mut config = NetworkConfig::daemon("d", 7001);
        assert_eq!(config.participant_type(), ParticipantType::Daemon);
        config.pure_daemon = true;
        assert_eq!(config.participant_type(), ParticipantType::PureDaemon);
        config.relay = false;
        assert_eq!(config.participant_type(), ParticipantType::Client);
    }

    #[test]
    fn test_other_daemon_ignores_self_and_port_zero() {
        let mut config = NetworkConfig::daemon("d", 7001);
        config.daemon = Some(DaemonAddress {
            ip: "127.0.0.1".into(),
            port: 7001,
        });
        assert!(config.other_daemon().is_none());

        config.daemon = Some(DaemonAddress {
            ip: "127.0.0.1".into(),
            port: 0,
        });
        assert!(config.other_daemon().is_none());

        config.daemon = Some(DaemonAddress {
            ip: "127.0.0.1".into(),
            port: 7002,
        });
        assert_eq!(config.other_daemon().unwrap().port, 7002);
    }

    #[test]
    fn test_alive_timeout_too_low() {
        let mut config = NetworkConfig::default();
        config.alive_interval = Duration::from_millis(500);
        config.alive_timeout = Duration::from_millis(550);
        assert!(config.alive_timeout_too_low());
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let mut config = NetworkConfig::client("renderer");
        config.alive_interval = Duration::from_millis(250);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"alive_interval\":250"));
        let deserialized: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.participant_id, config.participant_id);
        assert_eq!(deserialized.alive_interval, config.alive_interval);
        assert_eq!(deserialized.participant_name, "renderer");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NetworkConfig = serde_json::from_str(r#"{"port": 5999, "relay": true}"#).unwrap();
        assert_eq!(config.port, 5999);
        assert!(config.relay);
        assert_eq!(config.protocol_version, DEFAULT_PROTOCOL_VERSION);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");

        let mut original = NetworkConfig::daemon("main-daemon", 7001);
        original.protocol_version = 9;
        original.save_to_file(&path).unwrap();

        let loaded = NetworkConfig::load_or_default(&path);
        assert_eq!(loaded.port, 7001);
        assert_eq!(loaded.protocol_version, 9);
        assert_eq!(loaded.participant_id, original.participant_id);
    }

    #[test]
    fn test_save_into_missing_directory_creates_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("network.json");
        NetworkConfig::client("c").save_to_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_save_below_a_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let err = NetworkConfig::client("c")
            .save_to_file(&blocker.join("network.json"))
            .unwrap_err();
        assert!(matches!(err, NetworkError::Io(_)), "got {err:?}");
    }

    #[test]
    fn test_load_normalizes_unusable_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        std::fs::write(
            &path,
            r#"{"participant_id": "00000000-0000-0000-0000-000000000000", "chunk_size": 0}"#,
        )
        .unwrap();

        let config = NetworkConfig::load_or_default(&path);
        assert!(!config.participant_id.is_invalid());
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_normalize_clamps_chunk_size_to_frame_limit() {
        let mut config = NetworkConfig::client("c");
        let id = config.participant_id;
        config.chunk_size = usize::MAX;
        config.normalize();
        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(config.participant_id, id);
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetworkConfig::load_or_default(&dir.path().join("absent.json"));
        assert_eq!(config.port, 0);
        assert!(!config.participant_id.is_invalid());
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = NetworkConfig::load_or_default(&path);
        assert_eq!(config.port, 0);
    }
}
