use alloy_primitives::B256;
use devp2p::crypto::{pubkey_to_node_id, verifying_key_to_node_id};
use devp2p::types::{NodeId, Signature};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};

use crate::QposError;

/// Identity that signs consensus messages.
pub trait Signer {
    fn id(&self) -> NodeId;

    /// Recoverable signature over a 32-byte digest.
    fn sign(&self, hash: &B256) -> Result<Signature, QposError>;
}

pub struct K256Signer {
    key: SigningKey,
    id: NodeId,
}

impl K256Signer {
    pub fn new(key: SigningKey) -> Self {
        let id = pubkey_to_node_id(&key);
        K256Signer { key, id }
    }
}

impl Signer for K256Signer {
    fn id(&self) -> NodeId {
        self.id
    }

    fn sign(&self, hash: &B256) -> Result<Signature, QposError> {
        let (sig, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| QposError::Signature(e.to_string()))?;
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(out)
    }
}

/// Identity that produced `signature` over `hash`.
pub fn recover(signature: &Signature, hash: &B256) -> Result<NodeId, QposError> {
    let sig = EcdsaSignature::from_slice(&signature[..64])
        .map_err(|e| QposError::Signature(format!("invalid signature: {}", e)))?;
    let recovery_id = RecoveryId::from_byte(signature[64])
        .ok_or_else(|| QposError::Signature(format!("invalid recovery id {}", signature[64])))?;
    let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &sig, recovery_id)
        .map_err(|e| QposError::Signature(format!("recovery failed: {}", e)))?;
    Ok(verifying_key_to_node_id(&key))
}

/// Whether `id` signed `hash`.
pub fn verify(id: &NodeId, signature: &Signature, hash: &B256) -> bool {
    matches!(recover(signature, hash), Ok(signer) if signer == *id)
}
