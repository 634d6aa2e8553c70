use alloy_primitives::B256;
use devp2p::rlp::{self, RlpItem};

use crate::types::keccak;

/// Root of the Merkle-Patricia trie keyed by RLP-encoded list index.
///
/// This is how `transactions_root` is committed in the header. The trie is
/// built recursively over the sorted nibble keys; nodes shorter than 32 bytes
/// are embedded in their parent, the root is always hashed.
pub fn ordered_trie_root(items: &[Vec<u8>]) -> B256 {
    if items.is_empty() {
        return empty_trie_hash();
    }

    let mut entries: Vec<(Vec<u8>, &[u8])> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (nibbles(&RlpItem::u64(i as u64).encode()), item.as_slice()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    keccak(&encode_node(&entries, 0))
}

/// keccak256(RLP("")).
pub fn empty_trie_hash() -> B256 {
    keccak(&[0x80])
}

fn nibbles(key: &[u8]) -> Vec<u8> {
    key.iter().flat_map(|b| [b >> 4, b & 0x0f]).collect()
}

/// Hex-prefix (compact) encoding of a nibble path.
fn hex_prefix(path: &[u8], leaf: bool) -> Vec<u8> {
    let flag = if leaf { 0x20 } else { 0x00 };
    let mut out = Vec::with_capacity(path.len() / 2 + 1);
    let rest = if path.len() % 2 == 1 {
        out.push(flag | 0x10 | path[0]);
        &path[1..]
    } else {
        out.push(flag);
        path
    };
    out.extend(rest.chunks(2).map(|pair| (pair[0] << 4) | pair[1]));
    out
}

/// Length of the nibble prefix shared by every key, starting at `depth`.
/// Keys are sorted, so comparing the first and last is enough.
fn shared_prefix(entries: &[(Vec<u8>, &[u8])], depth: usize) -> usize {
    let first = &entries[0].0[depth..];
    let last = &entries[entries.len() - 1].0[depth..];
    first.iter().zip(last).take_while(|(a, b)| a == b).count()
}

/// How a child is referenced from its parent.
fn node_ref(encoded: Vec<u8>) -> Vec<u8> {
    if encoded.len() < 32 {
        encoded
    } else {
        rlp::encode_bytes(keccak(&encoded).as_slice())
    }
}

fn encode_node(entries: &[(Vec<u8>, &[u8])], depth: usize) -> Vec<u8> {
    if let [(key, value)] = entries {
        return rlp::encode_list_of_encoded(&[
            rlp::encode_bytes(&hex_prefix(&key[depth..], true)),
            rlp::encode_bytes(value),
        ]);
    }

    let shared = shared_prefix(entries, depth);
    if shared > 0 {
        let child = encode_node(entries, depth + shared);
        return rlp::encode_list_of_encoded(&[
            rlp::encode_bytes(&hex_prefix(&entries[0].0[depth..depth + shared], false)),
            node_ref(child),
        ]);
    }

    let mut rest = entries;
    let mut value: &[u8] = &[];
    if rest[0].0.len() == depth {
        value = rest[0].1;
        rest = &rest[1..];
    }

    let mut slots = Vec::with_capacity(17);
    for nibble in 0..16u8 {
        let end = rest
            .iter()
            .position(|(key, _)| key[depth] != nibble)
            .unwrap_or(rest.len());
        let (group, tail) = rest.split_at(end);
        slots.push(if group.is_empty() {
            rlp::encode_bytes(&[])
        } else {
            node_ref(encode_node(group, depth + 1))
        });
        rest = tail;
    }
    slots.push(rlp::encode_bytes(value));
    rlp::encode_list_of_encoded(&slots)
}
