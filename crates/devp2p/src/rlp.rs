use crate::bytes::{decode_u64, encode_u64};
use crate::error::Error;

const MAX_RLP_DEPTH: usize = 16;

mod consts {
    pub const SINGLE_BYTE_MAX: u8 = 0x7f;
    pub const SHORT_STRING_PREFIX: u8 = 0x80;
    pub const LONG_STRING_PREFIX: u8 = 0xb7;
    pub const LONG_STRING_MAX: u8 = 0xbf;
    pub const SHORT_LIST_PREFIX: u8 = 0xc0;
    pub const LONG_LIST_PREFIX: u8 = 0xf7;
}

/// Decoded RLP tree. Byte strings stay raw; integers are interpreted by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RlpItem {
    Bytes(Vec<u8>),
    List(Vec<RlpItem>),
}

impl RlpItem {
    pub fn u64(value: u64) -> Self {
        RlpItem::Bytes(encode_u64(value))
    }

    pub fn bool(value: bool) -> Self {
        RlpItem::u64(value as u64)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            RlpItem::Bytes(bytes) => encode_bytes(bytes),
            RlpItem::List(items) => {
                let payload: Vec<u8> = items.iter().flat_map(|item| item.encode()).collect();
                encode_list_payload(&payload)
            }
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, RlpItem::List(_))
    }

    pub fn into_list(self) -> Result<Vec<RlpItem>, Error> {
        match self {
            RlpItem::List(items) => Ok(items),
            RlpItem::Bytes(_) => Err(Error::Rlp("expected list, got bytes".to_string())),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, Error> {
        match self {
            RlpItem::Bytes(bytes) => Ok(bytes),
            RlpItem::List(_) => Err(Error::Rlp("expected bytes, got list".to_string())),
        }
    }

    /// Interpret a byte string as a big-endian unsigned integer.
    pub fn as_u64(&self) -> Result<u64, Error> {
        match self {
            RlpItem::Bytes(bytes) if bytes.len() <= 8 => Ok(decode_u64(bytes)),
            RlpItem::Bytes(bytes) => Err(Error::Rlp(format!(
                "integer of {} bytes does not fit u64",
                bytes.len()
            ))),
            RlpItem::List(_) => Err(Error::Rlp("expected integer, got list".to_string())),
        }
    }

    pub fn as_bool(&self) -> Result<bool, Error> {
        Ok(self.as_u64()? != 0)
    }
}

pub fn encode_list(items: &[&[u8]]) -> Vec<u8> {
    let payload: Vec<u8> = items.iter().flat_map(|item| encode_bytes(item)).collect();
    encode_list_payload(&payload)
}

/// Wrap already-encoded items in a list header.
pub fn encode_list_of_encoded(items: &[Vec<u8>]) -> Vec<u8> {
    encode_list_payload(&items.concat())
}

pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] <= consts::SINGLE_BYTE_MAX {
        return vec![bytes[0]];
    }
    let mut out = length_prefix(bytes.len(), consts::SHORT_STRING_PREFIX, consts::LONG_STRING_PREFIX);
    out.extend_from_slice(bytes);
    out
}

pub fn encode_list_payload(payload: &[u8]) -> Vec<u8> {
    let mut out = length_prefix(payload.len(), consts::SHORT_LIST_PREFIX, consts::LONG_LIST_PREFIX);
    out.extend_from_slice(payload);
    out
}

fn length_prefix(len: usize, short: u8, long: u8) -> Vec<u8> {
    if len < 56 {
        return vec![short + len as u8];
    }
    let len_bytes = encode_u64(len as u64);
    let mut out = Vec::with_capacity(1 + len_bytes.len());
    out.push(long + len_bytes.len() as u8);
    out.extend(len_bytes);
    out
}

/// Decode exactly one item; trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<RlpItem, Error> {
    let (item, consumed) = decode_item(data, 0)?;
    if consumed != data.len() {
        return Err(Error::Rlp(format!(
            "{} trailing bytes after item",
            data.len() - consumed
        )));
    }
    Ok(item)
}

/// Split off the header of the item at the front of `data`.
/// Returns (is_list, header_len, payload_len).
fn header(data: &[u8]) -> Result<(bool, usize, usize), Error> {
    let first = *data
        .first()
        .ok_or_else(|| Error::Rlp("empty data".to_string()))?;

    let (is_list, header_len, payload_len) = match first {
        b if b <= consts::SINGLE_BYTE_MAX => return Ok((false, 0, 1)),
        b if b <= consts::LONG_STRING_PREFIX => (false, 1, (b - consts::SHORT_STRING_PREFIX) as usize),
        b if b <= consts::LONG_STRING_MAX => {
            let len_of_len = (b - consts::LONG_STRING_PREFIX) as usize;
            (false, 1 + len_of_len, read_length(data, len_of_len)?)
        }
        b if b <= consts::LONG_LIST_PREFIX => (true, 1, (b - consts::SHORT_LIST_PREFIX) as usize),
        b => {
            let len_of_len = (b - consts::LONG_LIST_PREFIX) as usize;
            (true, 1 + len_of_len, read_length(data, len_of_len)?)
        }
    };

    let total = header_len
        .checked_add(payload_len)
        .ok_or_else(|| Error::Rlp("item length overflows".to_string()))?;
    if data.len() < total {
        return Err(Error::Rlp(format!("need {} bytes, have {}", total, data.len())));
    }
    Ok((is_list, header_len, payload_len))
}

fn read_length(data: &[u8], len_of_len: usize) -> Result<usize, Error> {
    if len_of_len > 8 || data.len() < 1 + len_of_len {
        return Err(Error::Rlp("truncated length prefix".to_string()));
    }
    let len = usize::try_from(decode_u64(&data[1..1 + len_of_len]))
        .map_err(|_| Error::Rlp("length overflows usize".to_string()))?;
    if len > data.len() {
        return Err(Error::Rlp(format!("length {} exceeds {} bytes of input", len, data.len())));
    }
    Ok(len)
}

fn decode_item(data: &[u8], depth: usize) -> Result<(RlpItem, usize), Error> {
    if depth > MAX_RLP_DEPTH {
        return Err(Error::Rlp("RLP nesting too deep".to_string()));
    }

    let (is_list, header_len, payload_len) = header(data)?;
    let total = header_len + payload_len;
    let payload = &data[header_len..total];

    if !is_list {
        return Ok((RlpItem::Bytes(payload.to_vec()), total));
    }

    let mut items = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let (item, consumed) = decode_item(&payload[offset..], depth + 1)?;
        items.push(item);
        offset += consumed;
    }
    Ok((RlpItem::List(items), total))
}

/// Raw encodings of each element of a top-level list, without re-encoding.
pub fn split_list(data: &[u8]) -> Result<Vec<&[u8]>, Error> {
    let (is_list, header_len, payload_len) = header(data)?;
    if !is_list {
        return Err(Error::Rlp("expected list, got bytes".to_string()));
    }
    let payload = &data[header_len..header_len + payload_len];
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let (_, h, p) = header(&payload[offset..])?;
        out.push(&payload[offset..offset + h + p]);
        offset += h + p;
    }
    Ok(out)
}
