//! Peer discovery through daemon address exchange.
//!
//! Participants never scan the network. A relay daemon tells every newly
//! established peer about the clients it already knows, and tells everybody
//! else about the newcomer. Which side of a pair then opens the TCP
//! connection is decided by [`LocalParticipant::connect_decision`], so two
//! peers learning about each other at the same time end up with one link.

use bytes::Bytes;

use crate::codec::{MessageReader, MessageWriter};
use crate::config::{DaemonAddress, NetworkConfig};
use crate::error::CodecError;
use crate::identity::{ParticipantAddress, ParticipantId, ParticipantType};
use crate::message::{get_address, put_address};

/// One participant entry of a `ConnectorAddressExchange` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub address: ParticipantAddress,
    pub participant_type: ParticipantType,
}

impl AddressEntry {
    pub fn new(address: ParticipantAddress, participant_type: ParticipantType) -> Self {
        Self {
            address,
            participant_type,
        }
    }
}

pub fn encode_address_exchange(entries: &[AddressEntry]) -> Bytes {
    let mut w = MessageWriter::new();
    w.put_u32(entries.len() as u32);
    for entry in entries {
        put_address(&mut w, &entry.address, entry.participant_type);
    }
    w.finish()
}

pub fn decode_address_exchange(payload: &[u8]) -> Result<Vec<AddressEntry>, CodecError> {
    let mut r = MessageReader::new(payload);
    let count = r.get_u32()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let (address, participant_type) = get_address(&mut r)?;
        entries.push(AddressEntry::new(address, participant_type));
    }
    Ok(entries)
}

/// Address-exchange messages a relay sends when `new_peer` got established.
///
/// The newcomer receives every other established client; every other
/// established peer, daemons included, receives a one-entry update naming
/// the newcomer. `established` may or may not already contain `new_peer`.
pub fn plan_address_exchange(
    new_peer: &AddressEntry,
    established: &[AddressEntry],
) -> Vec<(ParticipantId, Vec<AddressEntry>)> {
    let new_id = new_peer.address.id;
    let others: Vec<&AddressEntry> = established
        .iter()
        .filter(|e| e.address.id != new_id)
        .collect();

    let mut plan = Vec::with_capacity(others.len() + 1);
    plan.push((
        new_id,
        others
            .iter()
            .filter(|e| e.participant_type == ParticipantType::Client)
            .map(|e| (*e).clone())
            .collect(),
    ));
    for other in others {
        plan.push((other.address.id, vec![new_peer.clone()]));
    }
    plan
}

/// Outcome of the tie-break rule for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Open a connection; the flag tells whether the target is our daemon.
    Initiate { target_is_daemon: bool },
    /// Let the peer connect to us.
    Wait,
}

/// What the connect decision needs to know about ourselves.
#[derive(Debug, Clone)]
pub struct LocalParticipant {
    pub address: ParticipantAddress,
    pub participant_type: ParticipantType,
    pub other_daemon: Option<DaemonAddress>,
}

impl LocalParticipant {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            address: config.participant_address(),
            participant_type: config.participant_type(),
            other_daemon: config.other_daemon().cloned(),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.address.id
    }

    pub fn name(&self) -> &str {
        &self.address.name
    }

    pub fn acts_as_daemon(&self) -> bool {
        self.participant_type.is_relay()
    }

    /// Whether `address` is the configured upstream daemon.
    pub fn is_other_daemon(&self, address: &ParticipantAddress) -> bool {
        self.other_daemon
            .as_ref()
            .is_some_and(|d| address.same_endpoint(&d.ip, d.port))
    }

    /// The tie-break rule.
    ///
    /// Relays never initiate. Everybody else connects to its upstream
    /// daemon, and to a known peer only if that peer's id is greater than
    /// its own.
    pub fn connect_decision(&self, target: &ParticipantAddress) -> ConnectDecision {
        if self.acts_as_daemon() {
            return ConnectDecision::Wait;
        }
        let target_is_daemon = self.is_other_daemon(target);
        let target_id_greater = !target.id.is_invalid() && target.id > self.id();
        if target_is_daemon || target_id_greater {
            ConnectDecision::Initiate { target_is_daemon }
        } else {
            ConnectDecision::Wait
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: u128, port: u16) -> AddressEntry {
        AddressEntry::new(
            ParticipantAddress::new(ParticipantId::from_u128(id), format!("c{id}"), "127.0.0.1", port),
            ParticipantType::Client,
        )
    }

    fn local(id: u128, participant_type: ParticipantType, daemon: Option<u16>) -> LocalParticipant {
        LocalParticipant {
            address: ParticipantAddress::new(ParticipantId::from_u128(id), "self", "127.0.0.1", 0),
            participant_type,
            other_daemon: daemon.map(|port| DaemonAddress {
                ip: "127.0.0.1".into(),
                port,
            }),
        }
    }

    #[test]
    fn test_address_exchange_roundtrip() {
        let entries = vec![client(2, 5001), client(3, 5002)];
        let bytes = encode_address_exchange(&entries);
        assert_eq!(decode_address_exchange(&bytes).unwrap(), entries);
        assert!(decode_address_exchange(&encode_address_exchange(&[])).unwrap().is_empty());
    }

    #[test]
    fn test_address_exchange_truncated() {
        let bytes = encode_address_exchange(&[client(2, 5001)]);
        assert!(decode_address_exchange(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_tie_break_is_symmetric() {
        for (a, b) in [(1u128, 2u128), (20, 10), (u128::MAX, 7), (1 << 64, (1 << 64) + 1)] {
            let la = local(a, ParticipantType::Client, None);
            let lb = local(b, ParticipantType::Client, None);
            let a_connects = la.connect_decision(&lb.address) != ConnectDecision::Wait;
            let b_connects = lb.connect_decision(&la.address) != ConnectDecision::Wait;
            assert!(a_connects ^ b_connects, "exactly one of {a} and {b} initiates");
        }
    }

    #[test]
    fn test_relays_never_initiate() {
        let daemon = local(10, ParticipantType::Daemon, Some(7002));
        let target = ParticipantAddress::new(ParticipantId::from_u128(99), "x", "127.0.0.1", 7002);
        assert_eq!(daemon.connect_decision(&target), ConnectDecision::Wait);
        let pure = local(10, ParticipantType::PureDaemon, None);
        assert_eq!(pure.connect_decision(&target), ConnectDecision::Wait);
    }

    #[test]
    fn test_client_always_connects_to_its_daemon() {
        // client id 20, daemon id 10: the id rule alone would wait

        let c = local(20, ParticipantType::Client, Some(7001));
        let daemon_unidentified = ParticipantAddress::unidentified("127.0.0.1", 7001);
        assert_eq!(
            c.connect_decision(&daemon_unidentified),
            ConnectDecision::Initiate {
                target_is_daemon: true
            }
        );
        let daemon = ParticipantAddress::new(ParticipantId::from_u128(10), "d", "127.0.0.1", 7001);
        assert_eq!(
            c.connect_decision(&daemon),
            ConnectDecision::Initiate {
                target_is_daemon: true
            }
        );
    }

    #[test]
    fn test_unidentified_non_daemon_target_waits() {
        let c = local(1, ParticipantType::Client, Some(7001));
        assert_eq!(
            c.connect_decision(&ParticipantAddress::unidentified("127.0.0.1", 5555)),
            ConnectDecision::Wait
        );
    }

    #[test]
    fn test_plan_first_peer_gets_empty_list() {
        // Scenario A: the daemon's only peer is the new client.
        let c = client(20, 5000);
        let plan = plan_address_exchange(&c, std::slice::from_ref(&c));
        assert_eq!(plan, vec![(c.address.id, vec![])]);
    }

    #[test]
    fn test_plan_new_peer_with_existing_clients() {
        // Scenario B: B and C are established, E joins.
        let b = client(2, 5002);
        let c = client(3, 5003);
        let e = client(5, 5005);
        let plan = plan_address_exchange(&e, &[b.clone(), c.clone(), e.clone()]);

        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0], (e.address.id, vec![b.clone(), c.clone()]));
        assert!(plan.contains(&(b.address.id, vec![e.clone()])));
        assert!(plan.contains(&(c.address.id, vec![e.clone()])));
    }

    #[test]
    fn test_plan_skips_daemons_in_list_but_updates_them() {
        let other_daemon = AddressEntry::new(
            ParticipantAddress::new(ParticipantId::from_u128(8), "d2", "127.0.0.1", 7002),
            ParticipantType::Daemon,
        );
        let e = client(5, 5005);
        let plan = plan_address_exchange(&e, &[other_daemon.clone()]);
        assert_eq!(plan[0], (e.address.id, vec![]));
        assert_eq!(plan[1], (other_daemon.address.id, vec![e]));
    }
}
