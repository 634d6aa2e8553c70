use alloy_primitives::{B256, U256};

use crate::types::{BlockHeader, SealEntry};

/// Verdict of handing a block to the importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportResult {
    Success,
    /// Already queued (possibly waiting on its parent).
    AlreadyKnown,
    AlreadyInChain,
    Malformed,
    BadChain,
    FutureTimeKnown,
    FutureTimeUnknown,
    UnknownParent,
}

/// Where the importer holds a given hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Unknown,
    Bad,
    Ready,
    Importing,
    UnknownParent,
}

/// The chain as seen by sync and consensus.
pub trait ImportOracle {
    fn import(&mut self, block: &[u8]) -> ImportResult;

    /// Whether the hash is part of the stored chain.
    fn is_known(&self, hash: &B256) -> bool;

    fn block_status(&self, hash: &B256) -> QueueStatus;

    /// Height of the current best block.
    fn number(&self) -> u64;

    fn genesis_hash(&self) -> B256;

    /// Total difficulty of the current best block.
    fn total_difficulty(&self) -> U256;

    /// Header of the current best block.
    fn head(&self) -> BlockHeader;
}

/// Certifies the signature list of a committed block.
pub trait SealVerifier: Send {
    fn verify_seal(&self, header: &BlockHeader, seal: &[SealEntry]) -> bool;
}
