use alloy_primitives::{B256, U256};

use crate::bytes::encode_u64;
use crate::error::Error;
use crate::rlp::{self, RlpItem};

pub const STATUS_MSG_ID: u8 = 0x00;
pub const NEW_BLOCK_HASHES_MSG_ID: u8 = 0x01;
pub const GET_BLOCK_HEADERS_MSG_ID: u8 = 0x03;
pub const BLOCK_HEADERS_MSG_ID: u8 = 0x04;
pub const GET_BLOCK_BODIES_MSG_ID: u8 = 0x05;
pub const BLOCK_BODIES_MSG_ID: u8 = 0x06;
pub const NEW_BLOCK_MSG_ID: u8 = 0x07;

/// Status handshake payload announced by every peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthStatus {
    pub protocol_version: u32,
    pub network_id: u64,
    pub total_difficulty: U256,
    pub best_hash: B256,
    pub genesis_hash: B256,
}

/// What we are currently waiting on from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Asking {
    /// Status handshake outstanding.
    #[default]
    State,
    Nothing,
    BlockHeaders,
    BlockBodies,
}

impl EthStatus {
    pub fn from_rlp(data: &[u8]) -> Result<EthStatus, Error> {
        let items = rlp::decode(data)?.into_list()?;
        if items.len() < 5 {
            return Err(Error::Eth(format!("status has {} fields, need 5", items.len())));
        }
        let mut iter = items.into_iter();
        let protocol_version = next(&mut iter)?.as_u64()? as u32;
        let network_id = next(&mut iter)?.as_u64()?;
        let total_difficulty = to_u256(next(&mut iter)?)?;
        let best_hash = to_b256(next(&mut iter)?, "bestHash")?;
        let genesis_hash = to_b256(next(&mut iter)?, "genesisHash")?;

        Ok(EthStatus {
            protocol_version,
            network_id,
            total_difficulty,
            best_hash,
            genesis_hash,
        })
    }

    pub fn to_rlp(&self) -> Vec<u8> {
        RlpItem::List(vec![
            RlpItem::u64(self.protocol_version as u64),
            RlpItem::u64(self.network_id),
            RlpItem::Bytes(u256_bytes(&self.total_difficulty)),
            RlpItem::Bytes(self.best_hash.to_vec()),
            RlpItem::Bytes(self.genesis_hash.to_vec()),
        ])
        .encode()
    }
}

/// Start of a GetBlockHeaders request: by number or by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStart {
    ByNumber(u64),
    ByHash(B256),
}

/// Format: `[start, limit, skip, reverse]`
pub fn encode_get_block_headers(start: HeaderStart, limit: u64, skip: u64, reverse: bool) -> Vec<u8> {
    let start = match start {
        HeaderStart::ByNumber(n) => RlpItem::Bytes(encode_u64(n)),
        HeaderStart::ByHash(h) => RlpItem::Bytes(h.to_vec()),
    };
    RlpItem::List(vec![start, RlpItem::u64(limit), RlpItem::u64(skip), RlpItem::bool(reverse)]).encode()
}

/// Format: `[hash1, hash2, ...]`
pub fn encode_get_block_bodies(hashes: &[B256]) -> Vec<u8> {
    RlpItem::List(hashes.iter().map(|h| RlpItem::Bytes(h.to_vec())).collect()).encode()
}

/// Format: `[block, td]` where `block` is already RLP-encoded.
pub fn encode_new_block(block_rlp: &[u8], td: &U256) -> Vec<u8> {
    rlp::encode_list_of_encoded(&[block_rlp.to_vec(), rlp::encode_bytes(&u256_bytes(td))])
}

/// Split a NewBlock payload into its raw items. Arity is left to the caller.
pub fn split_new_block(payload: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    Ok(rlp::split_list(payload)?.into_iter().map(<[u8]>::to_vec).collect())
}

/// Format: `[[hash1, number1], [hash2, number2], ...]`
pub fn encode_new_block_hashes(entries: &[(B256, u64)]) -> Vec<u8> {
    RlpItem::List(
        entries
            .iter()
            .map(|(hash, number)| RlpItem::List(vec![RlpItem::Bytes(hash.to_vec()), RlpItem::u64(*number)]))
            .collect(),
    )
    .encode()
}

pub fn decode_new_block_hashes(payload: &[u8]) -> Result<Vec<(B256, u64)>, Error> {
    let entries = rlp::decode(payload)?.into_list()?;
    let mut result = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut fields = entry.into_list()?.into_iter();
        let hash = to_b256(next(&mut fields)?, "block_hash")?;
        let number = next(&mut fields)?.as_u64()?;
        result.push((hash, number));
    }
    Ok(result)
}

fn next(iter: &mut impl Iterator<Item = RlpItem>) -> Result<RlpItem, Error> {
    iter.next()
        .ok_or_else(|| Error::Eth("unexpected end of fields".to_string()))
}

fn to_b256(item: RlpItem, field: &'static str) -> Result<B256, Error> {
    let bytes = item.into_bytes()?;
    if bytes.len() != 32 {
        return Err(Error::Eth(format!("{} must be 32 bytes, got {}", field, bytes.len())));
    }
    Ok(B256::from_slice(&bytes))
}

fn to_u256(item: RlpItem) -> Result<U256, Error> {
    let bytes = item.into_bytes()?;
    U256::try_from_be_slice(&bytes).ok_or_else(|| Error::Eth("integer exceeds 256 bits".to_string()))
}

fn u256_bytes(v: &U256) -> Vec<u8> {
    let buf = v.to_be_bytes::<32>();
    let start = buf.iter().position(|&b| b != 0).unwrap_or(32);
    buf[start..].to_vec()
}
