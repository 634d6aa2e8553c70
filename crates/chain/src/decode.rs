use alloy_primitives::{Address, B256, U256};
use devp2p::rlp::{self, RlpItem};
use thiserror::Error;

use crate::trie::ordered_trie_root;
use crate::types::{keccak, BlockHeader, SealEntry};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("RLP decode error: {0}")]
    Rlp(String),
    #[error("expected at least {expected_min} fields, got {got}")]
    FieldCount { expected_min: usize, got: usize },
    #[error("{field}: expected {expected} bytes, got {got}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
}

impl From<devp2p::error::Error> for DecodeError {
    fn from(e: devp2p::error::Error) -> Self {
        DecodeError::Rlp(e.to_string())
    }
}

fn next_field(iter: &mut impl Iterator<Item = RlpItem>) -> Result<RlpItem, DecodeError> {
    iter.next()
        .ok_or(DecodeError::Rlp("unexpected end of RLP fields".to_string()))
}

fn to_fixed<const N: usize>(item: RlpItem, field: &'static str) -> Result<[u8; N], DecodeError> {
    let bytes = item.into_bytes()?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| DecodeError::InvalidLength {
        field,
        expected: N,
        got: bytes.len(),
    })
}

fn to_b256(item: RlpItem, field: &'static str) -> Result<B256, DecodeError> {
    Ok(B256::from(to_fixed::<32>(item, field)?))
}

fn to_u256(item: RlpItem) -> Result<U256, DecodeError> {
    let bytes = item.into_bytes()?;
    U256::try_from_be_slice(&bytes).ok_or(DecodeError::InvalidLength {
        field: "u256",
        expected: 32,
        got: bytes.len(),
    })
}

fn to_u64(item: RlpItem) -> Result<u64, DecodeError> {
    Ok(item.as_u64()?)
}

/// Decode a block header from raw RLP bytes.
pub fn decode_block_header(data: &[u8]) -> Result<BlockHeader, DecodeError> {
    let fields = rlp::decode(data)?.into_list()?;
    if fields.len() < 15 {
        return Err(DecodeError::FieldCount {
            expected_min: 15,
            got: fields.len(),
        });
    }

    let mut iter = fields.into_iter();
    Ok(BlockHeader {
        parent_hash: to_b256(next_field(&mut iter)?, "parent_hash")?,
        uncle_hash: to_b256(next_field(&mut iter)?, "uncle_hash")?,
        coinbase: Address::from(to_fixed::<20>(next_field(&mut iter)?, "coinbase")?),
        state_root: to_b256(next_field(&mut iter)?, "state_root")?,
        transactions_root: to_b256(next_field(&mut iter)?, "transactions_root")?,
        receipts_root: to_b256(next_field(&mut iter)?, "receipts_root")?,
        logs_bloom: to_fixed(next_field(&mut iter)?, "bloom")?,
        difficulty: to_u256(next_field(&mut iter)?)?,
        number: to_u64(next_field(&mut iter)?)?,
        gas_limit: to_u64(next_field(&mut iter)?)?,
        gas_used: to_u64(next_field(&mut iter)?)?,
        timestamp: to_u64(next_field(&mut iter)?)?,
        extra_data: next_field(&mut iter)?.into_bytes()?,
        mix_hash: to_b256(next_field(&mut iter)?, "mix_hash")?,
        nonce: to_fixed(next_field(&mut iter)?, "nonce")?,
    })
}

/// Content key used to match a body to the header that committed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BodyKey {
    pub transactions_root: B256,
    pub uncles_hash: B256,
}

impl BodyKey {
    pub fn of_header(header: &BlockHeader) -> Self {
        BodyKey {
            transactions_root: header.transactions_root,
            uncles_hash: header.uncle_hash,
        }
    }
}

/// A body: every block item after the header. The first two are the
/// transaction and uncle lists; QPOS blocks append the seal items.
#[derive(Debug, Clone)]
pub struct DecodedBody {
    /// Raw RLP of each transaction.
    pub transactions: Vec<Vec<u8>>,
    /// Raw RLP of the uncle list.
    pub uncles_rlp: Vec<u8>,
    /// Raw RLP of any trailing items.
    pub extra: Vec<Vec<u8>>,
}

impl DecodedBody {
    pub fn key(&self) -> BodyKey {
        BodyKey {
            transactions_root: ordered_trie_root(&self.transactions),
            uncles_hash: keccak(&self.uncles_rlp),
        }
    }
}

fn decode_body_parts(parts: &[&[u8]]) -> Result<DecodedBody, DecodeError> {
    if parts.len() < 2 {
        return Err(DecodeError::FieldCount {
            expected_min: 2,
            got: parts.len(),
        });
    }
    let transactions = rlp::split_list(parts[0])?
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect();
    // Uncles only need to be a well-formed list here.
    rlp::split_list(parts[1])?;
    Ok(DecodedBody {
        transactions,
        uncles_rlp: parts[1].to_vec(),
        extra: parts[2..].iter().map(|p| p.to_vec()).collect(),
    })
}

/// Decode a body `[transactions, uncles, ...]`.
pub fn decode_block_body(data: &[u8]) -> Result<DecodedBody, DecodeError> {
    decode_body_parts(&rlp::split_list(data)?)
}

#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub header: BlockHeader,
    pub header_rlp: Vec<u8>,
    pub hash: B256,
    pub body: DecodedBody,
    /// Raw RLP of the body (the block's items after the header, as a list).
    pub body_rlp: Vec<u8>,
}

impl DecodedBlock {
    /// Whether the body matches the roots the header commits to.
    pub fn body_matches_header(&self) -> bool {
        self.body.key() == BodyKey::of_header(&self.header)
    }

    /// Signature list of a QPOS-committed block: items `[number, [[idx, sig], ...]]`
    /// after the uncles. `Ok(None)` for unsealed blocks.
    pub fn seal(&self) -> Result<Option<(u64, Vec<SealEntry>)>, DecodeError> {
        let [number, list] = match self.body.extra.as_slice() {
            [] => return Ok(None),
            [number, list] => [number, list],
            other => {
                return Err(DecodeError::FieldCount {
                    expected_min: 2,
                    got: other.len(),
                })
            }
        };
        let number = to_u64(rlp::decode(number)?)?;
        let mut entries = Vec::new();
        for entry in rlp::decode(list)?.into_list()? {
            let mut fields = entry.into_list()?.into_iter();
            let idx = to_u64(next_field(&mut fields)?)?;
            let sig = to_fixed::<65>(next_field(&mut fields)?, "signature")?;
            entries.push((idx, sig));
        }
        Ok(Some((number, entries)))
    }
}

/// Decode a block `[header, transactions, uncles, ...]`.
pub fn decode_block(data: &[u8]) -> Result<DecodedBlock, DecodeError> {
    let parts = rlp::split_list(data)?;
    if parts.len() < 3 {
        return Err(DecodeError::FieldCount {
            expected_min: 3,
            got: parts.len(),
        });
    }
    let header_rlp = parts[0].to_vec();
    let header = decode_block_header(&header_rlp)?;
    let body = decode_body_parts(&parts[1..])?;
    let body_rlp = rlp::encode_list_of_encoded(&parts[1..].iter().map(|p| p.to_vec()).collect::<Vec<_>>());
    Ok(DecodedBlock {
        hash: keccak(&header_rlp),
        header,
        header_rlp,
        body,
        body_rlp,
    })
}

/// Join a raw header and a raw body back into a block.
pub fn assemble_block(header_rlp: &[u8], body_rlp: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut parts = vec![header_rlp.to_vec()];
    parts.extend(rlp::split_list(body_rlp)?.into_iter().map(<[u8]>::to_vec));
    Ok(rlp::encode_list_of_encoded(&parts))
}

/// keccak256 of raw RLP header bytes.
pub fn hash_raw_header(raw_rlp: &[u8]) -> B256 {
    keccak(raw_rlp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{encode_block, seal_block, EMPTY_LIST_RLP};

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            number,
            gas_limit: 8_000_000,
            timestamp: 1_000 + number,
            extra_data: b"test".to_vec(),
            nonce: [0, 0, 0, 0, 0, 0, 0, 42],
            ..Default::default()
        }
    }

    #[test]
    fn header_fields_survive() {
        let h = header(9);
        assert_eq!(decode_block_header(&h.rlp_encode()).unwrap(), h);
    }

    #[test]
    fn short_header_is_rejected() {
        let raw = RlpItem::List(vec![RlpItem::u64(1); 5]).encode();
        assert!(matches!(
            decode_block_header(&raw),
            Err(DecodeError::FieldCount { expected_min: 15, got: 5 })
        ));
    }

    #[test]
    fn hash_raw_header_matches() {
        let h = header(3);
        assert_eq!(hash_raw_header(&h.rlp_encode()), h.hash());
    }

    #[test]
    fn block_body_key_matches_committed_roots() {
        let txs = vec![RlpItem::Bytes(b"tx-a".to_vec()).encode(), RlpItem::Bytes(b"tx-b".to_vec()).encode()];
        let mut h = header(4);
        h.transactions_root = ordered_trie_root(&txs);
        let block = decode_block(&encode_block(&h, &txs)).unwrap();
        assert!(block.body_matches_header());
        assert_eq!(block.hash, h.hash());
        assert_eq!(block.body.transactions, txs);
        assert_eq!(block.body.uncles_rlp, EMPTY_LIST_RLP.to_vec());
    }

    #[test]
    fn tampered_body_does_not_match() {
        let h = header(4);
        let txs = vec![RlpItem::Bytes(b"tx".to_vec()).encode()];
        let block = decode_block(&encode_block(&h, &txs)).unwrap();
        assert!(!block.body_matches_header());
    }

    #[test]
    fn assemble_inverts_the_split() {
        let raw = encode_block(&header(2), &[]);
        let block = decode_block(&raw).unwrap();
        assert_eq!(assemble_block(&block.header_rlp, &block.body_rlp).unwrap(), raw);
    }

    #[test]
    fn seal_list_is_read_back() {
        let raw = encode_block(&header(5), &[]);
        assert!(decode_block(&raw).unwrap().seal().unwrap().is_none());

        let sealed = seal_block(&raw, 5, &[(0, [1u8; 65]), (2, [3u8; 65])]).unwrap();
        let block = decode_block(&sealed).unwrap();
        assert!(block.body_matches_header());
        let (number, entries) = block.seal().unwrap().unwrap();
        assert_eq!(number, 5);
        assert_eq!(entries, vec![(0, [1u8; 65]), (2, [3u8; 65])]);
    }

    #[test]
    fn empty_body_decodes() {
        let body = RlpItem::List(vec![RlpItem::List(vec![]), RlpItem::List(vec![])]).encode();
        let decoded = decode_block_body(&body).unwrap();
        assert!(decoded.transactions.is_empty());
        assert_eq!(decoded.key(), BodyKey::of_header(&BlockHeader::default()));
    }
}
