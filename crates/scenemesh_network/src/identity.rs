//! Participant identity: ids, addresses and roles.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique identifier for a participant in the mesh.
///
/// Ordering is the numeric ordering of the 128-bit value; connection
/// tie-breaking depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(uuid::Uuid);

impl ParticipantId {
    /// Generate a new random participant ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// The id carried by handles that have not completed the handshake.
    pub const fn invalid() -> Self {
        Self(uuid::Uuid::nil())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(uuid::Uuid::from_u128(value))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_invalid(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ParticipantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Well-known id used by standalone daemon processes.
pub const DAEMON_ID: ParticipantId = ParticipantId::from_u128(0xBBBC4FDF_44E4_4EE9_8649_E0139E8AE986);

/// Role a participant plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantType {
    /// Scene provider and/or renderer.
    Client,
    /// Relays addresses and also exchanges scene content.
    Daemon,
    /// Relays addresses only; never a scene content peer.
    PureDaemon,
}

impl ParticipantType {
    /// Whether this role performs address-exchange relay.
    pub fn is_relay(self) -> bool {
        matches!(self, Self::Daemon | Self::PureDaemon)
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Client => 0,
            Self::Daemon => 1,
            Self::PureDaemon => 2,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Client),
            1 => Some(Self::Daemon),
            2 => Some(Self::PureDaemon),
            _ => None,
        }
    }
}

impl fmt::Display for ParticipantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Client => "Client",
            Self::Daemon => "Daemon",
            Self::PureDaemon => "PureDaemon",
        };
        f.write_str(s)
    }
}

/// Full identity of a participant: id, human-readable name and the address
/// it accepts connections on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantAddress {
    pub id: ParticipantId,
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl ParticipantAddress {
    pub fn new(id: ParticipantId, name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            name: name.into(),
            ip: ip.into(),
            port,
        }
    }

    /// Address with no id yet, e.g. a configured daemon before its hello.
    pub fn unidentified(ip: impl Into<String>, port: u16) -> Self {
        Self::new(ParticipantId::invalid(), "", ip, port)
    }

    /// Whether both addresses point at the same listening endpoint.
    pub fn same_endpoint(&self, ip: &str, port: u16) -> bool {
        self.ip == ip && self.port == port
    }
}

impl fmt::Display for ParticipantAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} at {}:{}", self.id, self.name, self.ip, self.port)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_generation() {
        let a = ParticipantId::generate();
        let b = ParticipantId::generate();
        assert_ne!(a, b);
        assert!(!a.is_invalid());
    }

    #[test]
    fn test_invalid_id_is_default() {
        assert!(ParticipantId::default().is_invalid());
        assert_eq!(ParticipantId::invalid().as_u128(), 0);
    }

    #[test]
    fn test_ids_compare_numerically() {
        let ten = ParticipantId::from_u128(10);
        let twenty = ParticipantId::from_u128(20);
        assert!(ten < twenty);
        assert!(ParticipantId::from_u128(1 << 100) > ParticipantId::from_u128(u64::MAX as u128));
    }

    #[test]
    fn test_id_bytes_roundtrip() {
        let id = ParticipantId::generate();
        assert_eq!(ParticipantId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_id_parse_display() {
        let id = ParticipantId::generate();
        let parsed: ParticipantId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_participant_type_wire_values() {
        for t in [
            ParticipantType::Client,
            ParticipantType::Daemon,
            ParticipantType::PureDaemon,
        ] {
            assert_eq!(ParticipantType::from_wire(t.to_wire()), Some(t));
        }
        assert_eq!(ParticipantType::from_wire(7), None);
        assert!(!ParticipantType::Client.is_relay());
        assert!(ParticipantType::PureDaemon.is_relay());
    }

    #[test]
    fn test_address_equality_is_by_value() {
        let id = ParticipantId::from_u128(5);
        let a = ParticipantAddress::new(id, "a", "127.0.0.1", 7001);
        let b = ParticipantAddress::new(id, "a", "127.0.0.1", 7001);
        assert_eq!(a, b);
        assert_ne!(a, ParticipantAddress::new(id, "a", "127.0.0.1", 7002));
        assert!(a.same_endpoint("127.0.0.1", 7001));
    }
}
