use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;

use crate::types::NodeId;

pub fn pubkey_to_node_id(signing_key: &SigningKey) -> NodeId {
    let public_key: PublicKey = signing_key.verifying_key().into();
    pubkey_to_bytes(&public_key)
}

pub fn verifying_key_to_node_id(key: &VerifyingKey) -> NodeId {
    let public_key: PublicKey = key.into();
    pubkey_to_bytes(&public_key)
}

pub fn parse_uncompressed_pubkey(bytes: &NodeId) -> Result<PublicKey, &'static str> {
    let mut uncompressed: [u8; 65] = [0u8; 65];
    uncompressed[0] = 0x04;
    uncompressed[1..].copy_from_slice(bytes);
    PublicKey::from_sec1_bytes(&uncompressed).map_err(|_| "invalid public key")
}

pub fn pubkey_to_bytes(pubkey: &PublicKey) -> NodeId {
    let point = pubkey.to_encoded_point(false);
    let mut result: NodeId = [0u8; 64];
    result.copy_from_slice(&point.as_bytes()[1..65]);
    result
}

/// Parse a 128-char hex node id.
pub fn node_id_from_hex(s: &str) -> Result<NodeId, &'static str> {
    let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|_| "node id is not hex")?;
    <NodeId>::try_from(bytes.as_slice()).map_err(|_| "node id must be 64 bytes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_roundtrips_through_pubkey() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let node_id = pubkey_to_node_id(&key);
        let pubkey = parse_uncompressed_pubkey(&node_id).unwrap();
        assert_eq!(pubkey_to_bytes(&pubkey), node_id);
        assert_eq!(verifying_key_to_node_id(key.verifying_key()), node_id);
    }

    #[test]
    fn node_id_hex_parsing() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let node_id = pubkey_to_node_id(&key);
        assert_eq!(node_id_from_hex(&hex::encode(node_id)).unwrap(), node_id);
        assert!(node_id_from_hex("abcd").is_err());
        assert!(node_id_from_hex("zz").is_err());
    }
}
