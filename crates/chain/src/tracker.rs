use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{B256, U256};
use tracing::{debug, info, warn};

use crate::decode::decode_block;
use crate::oracle::{ImportOracle, ImportResult, QueueStatus, SealVerifier};
use crate::types::BlockHeader;

/// How far ahead of the local clock a block timestamp may be.
pub const MAX_FUTURE_DRIFT_SECS: u64 = 15;
/// Upper bound on blocks held while waiting for their parent.
const PARKED_CAP: usize = 1024;

struct StoredBlock {
    header: BlockHeader,
    td: U256,
}

/// In-memory chain: every imported header with its total difficulty, the
/// canonical number -> hash index, and a small queue of blocks whose parent
/// has not arrived yet. Heaviest total difficulty wins the head.
pub struct ChainTracker {
    genesis_hash: B256,
    head_hash: B256,
    blocks: HashMap<B256, StoredBlock>,
    canonical: BTreeMap<u64, B256>,
    /// Blocks waiting on their parent, keyed by their own hash.
    parked: HashMap<B256, (B256, Vec<u8>)>,
    bad: HashSet<B256>,
    verifier: Option<Box<dyn SealVerifier>>,
}

impl ChainTracker {
    pub fn new(genesis: BlockHeader) -> Self {
        let genesis_hash = genesis.hash();
        let td = genesis.difficulty;
        let mut blocks = HashMap::new();
        blocks.insert(genesis_hash, StoredBlock { header: genesis, td });
        let mut canonical = BTreeMap::new();
        canonical.insert(0, genesis_hash);
        info!(hash = %genesis_hash, "chain tracker initialized from genesis");
        Self {
            genesis_hash,
            head_hash: genesis_hash,
            blocks,
            canonical,
            parked: HashMap::new(),
            bad: HashSet::new(),
            verifier: None,
        }
    }

    /// Require blocks carrying a signature list to pass `verifier`.
    pub fn set_seal_verifier(&mut self, verifier: Box<dyn SealVerifier>) {
        self.verifier = Some(verifier);
    }

    pub fn head_hash(&self) -> B256 {
        self.head_hash
    }

    pub fn head_number(&self) -> u64 {
        self.stored_head().header.number
    }

    pub fn head_td(&self) -> U256 {
        self.stored_head().td
    }

    /// Canonical hash at `number`.
    pub fn hash_at(&self, number: u64) -> Option<B256> {
        self.canonical.get(&number).copied()
    }

    pub fn header(&self, hash: &B256) -> Option<&BlockHeader> {
        self.blocks.get(hash).map(|b| &b.header)
    }

    fn stored_head(&self) -> &StoredBlock {
        // head_hash is only ever set to a key of `blocks`.
        &self.blocks[&self.head_hash]
    }

    fn import_one(&mut self, raw: &[u8]) -> ImportResult {
        let block = match decode_block(raw) {
            Ok(b) => b,
            Err(e) => {
                debug!(err = %e, "undecodable block");
                return ImportResult::Malformed;
            }
        };
        let hash = block.hash;
        let number = block.header.number;

        if self.blocks.contains_key(&hash) {
            return ImportResult::AlreadyInChain;
        }
        if self.bad.contains(&hash) || self.bad.contains(&block.header.parent_hash) {
            self.bad.insert(hash);
            return ImportResult::BadChain;
        }
        if self.parked.contains_key(&hash) {
            return ImportResult::AlreadyKnown;
        }
        if !block.body_matches_header() {
            warn!(number, hash = %hash, "body does not match header roots");
            self.bad.insert(hash);
            return ImportResult::Malformed;
        }

        match block.seal() {
            Ok(None) => {}
            Ok(Some((sealed_number, entries))) => {
                let certified = sealed_number == number
                    && self
                        .verifier
                        .as_ref()
                        .map_or(true, |v| v.verify_seal(&block.header, &entries));
                if !certified {
                    warn!(number, hash = %hash, signatures = entries.len(), "seal rejected");
                    self.bad.insert(hash);
                    return ImportResult::Malformed;
                }
            }
            Err(e) => {
                debug!(err = %e, number, "undecodable seal");
                self.bad.insert(hash);
                return ImportResult::Malformed;
            }
        }

        let parent_known = self.blocks.contains_key(&block.header.parent_hash);
        if block.header.timestamp > now_secs().saturating_add(MAX_FUTURE_DRIFT_SECS) {
            return if parent_known {
                ImportResult::FutureTimeKnown
            } else {
                ImportResult::FutureTimeUnknown
            };
        }

        let Some(parent) = self.blocks.get(&block.header.parent_hash) else {
            if self.parked.len() < PARKED_CAP {
                self.parked
                    .insert(hash, (block.header.parent_hash, raw.to_vec()));
            }
            debug!(number, hash = %hash, "parked block with unknown parent");
            return ImportResult::UnknownParent;
        };

        if parent.header.number + 1 != number {
            self.bad.insert(hash);
            return ImportResult::BadChain;
        }

        let td = parent.td + block.header.difficulty;
        self.blocks.insert(
            hash,
            StoredBlock {
                header: block.header,
                td,
            },
        );
        if td > self.head_td() {
            self.set_head(hash);
        }
        ImportResult::Success
    }

    /// Move the head and rewrite the canonical index back to the fork point.
    fn set_head(&mut self, hash: B256) {
        let mut cursor = hash;
        let head_number = self.blocks[&hash].header.number;
        self.canonical.split_off(&(head_number + 1));
        while let Some(stored) = self.blocks.get(&cursor) {
            let n = stored.header.number;
            if self.canonical.get(&n) == Some(&cursor) {
                break;
            }
            self.canonical.insert(n, cursor);
            if n == 0 {
                break;
            }
            cursor = stored.header.parent_hash;
        }
        self.head_hash = hash;
        debug!(number = head_number, hash = %hash, "new head");
    }

    /// Import parked blocks whose parent has since landed, until none are left.
    fn drain_parked(&mut self) {
        loop {
            let ready: Vec<B256> = self
                .parked
                .iter()
                .filter(|(_, (parent, _))| self.blocks.contains_key(parent))
                .map(|(hash, _)| *hash)
                .collect();
            if ready.is_empty() {
                break;
            }
            for hash in ready {
                if let Some((_, raw)) = self.parked.remove(&hash) {
                    self.import_one(&raw);
                }
            }
        }
    }
}

impl ImportOracle for ChainTracker {
    fn import(&mut self, block: &[u8]) -> ImportResult {
        let result = self.import_one(block);
        if result == ImportResult::Success {
            self.drain_parked();
        }
        result
    }

    fn is_known(&self, hash: &B256) -> bool {
        self.blocks.contains_key(hash)
    }

    fn block_status(&self, hash: &B256) -> QueueStatus {
        if self.parked.contains_key(hash) {
            QueueStatus::UnknownParent
        } else if self.bad.contains(hash) {
            QueueStatus::Bad
        } else {
            QueueStatus::Unknown
        }
    }

    fn number(&self) -> u64 {
        self.head_number()
    }

    fn genesis_hash(&self) -> B256 {
        self.genesis_hash
    }

    fn total_difficulty(&self) -> U256 {
        self.head_td()
    }

    fn head(&self) -> BlockHeader {
        self.stored_head().header.clone()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
