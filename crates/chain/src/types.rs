use alloy_primitives::{Address, B256, U256};
use devp2p::rlp::{self, RlpItem};
use devp2p::types::Signature;
use sha3::{Digest, Keccak256};

pub type BlockNonce = [u8; 8];

pub type Bloom = [u8; 256];

/// One entry of a committed block's signature list: the signer's position in
/// the sorted miner list and its signature over the pre-seal hash.
pub type SealEntry = (u64, Signature);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    pub coinbase: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: B256,
    pub nonce: BlockNonce,
}

pub fn keccak(data: &[u8]) -> B256 {
    B256::from_slice(&Keccak256::digest(data))
}

/// RLP of the empty list.
pub const EMPTY_LIST_RLP: [u8; 1] = [0xc0];

/// keccak256 of the RLP empty list.
pub fn empty_uncle_hash() -> B256 {
    keccak(&EMPTY_LIST_RLP)
}

impl BlockHeader {
    pub fn hash(&self) -> B256 {
        keccak(&self.rlp_encode())
    }

    pub fn rlp_encode(&self) -> Vec<u8> {
        let mut fields = self.unsealed_fields();
        fields.push(RlpItem::Bytes(self.mix_hash.to_vec()));
        fields.push(RlpItem::Bytes(self.nonce.to_vec()));
        RlpItem::List(fields).encode()
    }

    /// Hash of the header without its seal fields (mix hash and nonce).
    /// Consensus signatures are made over this value.
    pub fn seal_hash(&self) -> B256 {
        keccak(&RlpItem::List(self.unsealed_fields()).encode())
    }

    pub fn has_empty_body(&self) -> bool {
        self.transactions_root == crate::trie::empty_trie_hash()
            && self.uncle_hash == empty_uncle_hash()
    }

    fn unsealed_fields(&self) -> Vec<RlpItem> {
        vec![
            RlpItem::Bytes(self.parent_hash.to_vec()),
            RlpItem::Bytes(self.uncle_hash.to_vec()),
            RlpItem::Bytes(self.coinbase.to_vec()),
            RlpItem::Bytes(self.state_root.to_vec()),
            RlpItem::Bytes(self.transactions_root.to_vec()),
            RlpItem::Bytes(self.receipts_root.to_vec()),
            RlpItem::Bytes(self.logs_bloom.to_vec()),
            RlpItem::Bytes(u256_to_bytes(&self.difficulty)),
            RlpItem::u64(self.number),
            RlpItem::u64(self.gas_limit),
            RlpItem::u64(self.gas_used),
            RlpItem::u64(self.timestamp),
            RlpItem::Bytes(self.extra_data.clone()),
        ]
    }
}

impl Default for BlockHeader {
    fn default() -> Self {
        BlockHeader {
            parent_hash: B256::ZERO,
            uncle_hash: empty_uncle_hash(),
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            transactions_root: crate::trie::empty_trie_hash(),
            receipts_root: crate::trie::empty_trie_hash(),
            logs_bloom: [0u8; 256],
            difficulty: U256::from(1u64),
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Vec::new(),
            mix_hash: B256::ZERO,
            nonce: [0u8; 8],
        }
    }
}

/// Assemble a block `[header, transactions, uncles]` from a header and raw transactions.
pub fn encode_block(header: &BlockHeader, transactions: &[Vec<u8>]) -> Vec<u8> {
    rlp::encode_list_of_encoded(&[
        header.rlp_encode(),
        rlp::encode_list_of_encoded(transactions),
        EMPTY_LIST_RLP.to_vec(),
    ])
}

/// Append a QPOS seal (`number`, `[[index, signature], ...]`) to a raw block.
pub fn seal_block(block: &[u8], number: u64, seal: &[SealEntry]) -> Result<Vec<u8>, devp2p::error::Error> {
    let mut parts: Vec<Vec<u8>> = rlp::split_list(block)?.into_iter().map(<[u8]>::to_vec).collect();
    parts.truncate(3);
    parts.push(RlpItem::u64(number).encode());
    parts.push(
        RlpItem::List(
            seal.iter()
                .map(|(idx, sig)| RlpItem::List(vec![RlpItem::u64(*idx), RlpItem::Bytes(sig.to_vec())]))
                .collect(),
        )
        .encode(),
    );
    Ok(rlp::encode_list_of_encoded(&parts))
}

pub fn u256_to_bytes(v: &U256) -> Vec<u8> {
    let buf = v.to_be_bytes::<32>();
    let start = buf.iter().position(|&b| b != 0).unwrap_or(32);
    buf[start..].to_vec()
}

/// Convert big-endian bytes to U256, keeping the low 32 bytes.
pub fn bytes_to_u256(bytes: &[u8]) -> U256 {
    let tail = &bytes[bytes.len().saturating_sub(32)..];
    let mut buf = [0u8; 32];
    buf[32 - tail.len()..].copy_from_slice(tail);
    U256::from_be_bytes(buf)
}
