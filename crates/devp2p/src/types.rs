/// 64-byte uncompressed secp256k1 public key (without the 0x04 prefix).
pub type NodeId = [u8; 64];

/// Short hex form used in log lines.
pub fn short_id(id: &NodeId) -> String {
    hex::encode(&id[..8])
}

/// 65-byte recoverable ECDSA signature: r || s || recovery id.
pub type Signature = [u8; 65];
