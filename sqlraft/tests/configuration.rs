//! Cluster configuration tests: codec bijection, duplicate detection and voter accounting.

use pretty_assertions::assert_eq;
use sqlraft::error::ConfigurationError;
use sqlraft::membership::Configuration;
use sqlraft::membership::Role;

fn three_node_config() -> Configuration {
    let mut c = Configuration::new();
    c.add(1, "10.0.0.1:9001".to_string(), Role::Voter).unwrap();
    c.add(2, "10.0.0.2:9001".to_string(), Role::Standby).unwrap();
    c.add(3, "10.0.0.3:9001".to_string(), Role::Spare).unwrap();
    c
}

#[test]
fn encode_decode_round_trip() {
    let c = three_node_config();
    let encoded = c.encode();
    assert_eq!(encoded.len() % 8, 0, "encoding must be padded to a word boundary");
    let decoded = Configuration::decode(&encoded).unwrap();
    assert_eq!(decoded, c);
}

#[test]
fn encode_decode_single_voter() {
    let c = Configuration::new_single(1, "1".to_string());
    let decoded = Configuration::decode(&c.encode()).unwrap();
    assert_eq!(decoded, c);
    assert_eq!(decoded.voter_count(), 1);
    assert!(decoded.validate().is_ok());
}

#[test]
fn decode_rejects_garbage() {
    assert!(Configuration::decode(&[]).is_err());
    assert!(Configuration::decode(&[9; 4]).is_err());

    // A valid version byte but a count pointing past the end of the buffer.
    let mut bytes = vec![1u8];
    bytes.extend_from_slice(&5u64.to_le_bytes());
    assert!(Configuration::decode(&bytes).is_err());

    // Truncated mid-server.
    let c = three_node_config();
    let encoded = c.encode();
    assert!(Configuration::decode(&encoded[..encoded.len() / 2]).is_err());
}

#[test]
fn duplicate_id_and_address_are_rejected() {
    let mut c = Configuration::new();
    c.add(1, "a".to_string(), Role::Voter).unwrap();
    assert_eq!(
        c.add(1, "b".to_string(), Role::Voter),
        Err(ConfigurationError::DuplicateId(1))
    );
    assert_eq!(
        c.add(2, "a".to_string(), Role::Voter),
        Err(ConfigurationError::DuplicateAddress("a".to_string()))
    );
}

#[test]
fn zero_id_is_rejected() {
    let mut c = Configuration::new();
    assert_eq!(c.add(0, "a".to_string(), Role::Voter), Err(ConfigurationError::BadId));
}

#[test]
fn voter_accounting() {
    let c = three_node_config();
    assert_eq!(c.voter_count(), 1);
    assert_eq!(c.majority(), 1);
    assert!(c.is_voter(1));
    assert!(!c.is_voter(2));
    assert_eq!(c.index_of_voter(1), Some(0));
    assert_eq!(c.index_of_voter(2), None);

    let mut c = c;
    c.set_role(2, Role::Voter).unwrap();
    c.set_role(3, Role::Voter).unwrap();
    assert_eq!(c.voter_count(), 3);
    assert_eq!(c.majority(), 2);
    assert_eq!(c.index_of_voter(3), Some(2));
}

#[test]
fn a_configuration_without_voters_is_invalid() {
    let mut c = Configuration::new();
    c.add(1, "a".to_string(), Role::Spare).unwrap();
    assert_eq!(c.validate(), Err(ConfigurationError::NoVoters));

    let empty = Configuration::new();
    assert_eq!(empty.validate(), Err(ConfigurationError::NoVoters));
}

#[test]
fn remove_unknown_server_fails() {
    let mut c = three_node_config();
    assert_eq!(c.remove(9), Err(ConfigurationError::UnknownServer(9)));
    c.remove(2).unwrap();
    assert!(!c.contains(2));
    assert_eq!(c.servers().len(), 2);
}
