use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use alloy_primitives::B256;
use chain::decode::{
    assemble_block, decode_block, decode_block_body, decode_block_header, hash_raw_header, BodyKey,
};
use chain::oracle::{ImportOracle, ImportResult, QueueStatus};
use chain::types::{BlockHeader, EMPTY_LIST_RLP};
use devp2p::rlp;
use devp2p::types::{short_id, NodeId};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// How long a body request stays stamped on a record.
pub const BODY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("malformed body: {0}")]
    MalformedBody(String),
    #[error("body does not match the roots committed in header {0}")]
    BadLinkage(B256),
    #[error("block 1 does not descend from genesis")]
    NotFromGenesis,
    #[error("no buffered header commits to this body")]
    UnknownBody,
}

/// What happened to a header or block offered to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Inserted,
    /// Extended past the top on a different parent: the old run was dropped
    /// and the record starts a new one.
    Restarted,
    /// Not the session owner's data.
    Ignored,
    /// Conflicted with a record newer than the top: everything was dropped,
    /// including the offered record.
    Reset,
}

/// A candidate block being assembled during sync.
#[derive(Debug, Clone)]
struct Record {
    header_rlp: Vec<u8>,
    /// Empty until the body arrives.
    body_rlp: Vec<u8>,
    hash: B256,
    parent: B256,
    /// Index key, `None` when the body was attached on admission.
    key: Option<BodyKey>,
    peer: NodeId,
    received_at: Instant,
    body_deadline: Option<Instant>,
}

impl Record {
    fn is_complete(&self) -> bool {
        !self.header_rlp.is_empty() && !self.body_rlp.is_empty()
    }
}

/// Outcome of one `collect_ready_run` pass.
#[derive(Debug, Default)]
pub struct Collected {
    /// Headers the importer accepted as new, lowest first.
    pub imported: Vec<BlockHeader>,
    /// Highest number that is now in the chain, 0 if none.
    pub highest: u64,
    /// Verdict that stopped the pass early, if any.
    pub halted_on: Option<ImportResult>,
}

/// Reconciliation buffer: block number -> candidate record, plus a body index
/// keyed by the roots a header commits to.
///
/// The genesis hash anchors block 1; whenever block 1 is buffered the ledger
/// behaves as if genesis sat at number 0.
pub struct Ledger {
    genesis_hash: B256,
    records: BTreeMap<u64, Record>,
    bodies: HashMap<BodyKey, u64>,
    seen_heads: HashSet<B256>,
}

impl Ledger {
    pub fn new(genesis_hash: B256) -> Self {
        Self {
            genesis_hash,
            records: BTreeMap::new(),
            bodies: HashMap::new(),
            seen_heads: HashSet::new(),
        }
    }

    pub fn clear(&mut self) {
        if !self.records.is_empty() {
            debug!(records = self.records.len(), "ledger cleared");
        }
        self.records.clear();
        self.bodies.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, number: u64) -> bool {
        self.records.contains_key(&number)
    }

    /// Hash buffered at `number`.
    pub fn hash(&self, number: u64) -> Option<B256> {
        if number == 0 && self.anchored() {
            return Some(self.genesis_hash);
        }
        self.records.get(&number).map(|r| r.hash)
    }

    /// Whether a header with this hash was ever admitted.
    pub fn seen_head(&self, hash: &B256) -> bool {
        self.seen_heads.contains(hash)
    }

    /// Peer that owns the current session: the supplier of the top record.
    pub fn owner(&self) -> Option<NodeId> {
        self.records.values().next_back().map(|r| r.peer)
    }

    /// Peer that supplied the record at `number`.
    pub fn owner_of(&self, number: u64) -> Option<NodeId> {
        self.records.get(&number).map(|r| r.peer)
    }

    pub fn top_number(&self) -> u64 {
        self.records.keys().next_back().copied().unwrap_or(0)
    }

    pub fn bottom_number(&self) -> u64 {
        if self.anchored() {
            return 0;
        }
        self.records.keys().next().copied().unwrap_or(0)
    }

    /// Hash at the bottom of the buffer, zero when empty.
    pub fn bottom_hash(&self) -> B256 {
        if self.anchored() {
            return self.genesis_hash;
        }
        self.records.values().next().map_or(B256::ZERO, |r| r.hash)
    }

    fn anchored(&self) -> bool {
        self.records.contains_key(&1)
    }

    fn top_time(&self) -> Option<Instant> {
        self.records.values().next_back().map(|r| r.received_at)
    }

    /// Admit a raw header supplied by `peer`.
    pub fn insert_header(&mut self, raw: &[u8], peer: NodeId) -> Result<Admission, LedgerError> {
        self.insert_header_at(raw, peer, Instant::now())
    }

    /// Admit a full block `[header, transactions, uncles, ...]` supplied by `peer`.
    pub fn insert_block(&mut self, raw: &[u8], peer: NodeId) -> Result<Admission, LedgerError> {
        self.insert_block_at(raw, peer, Instant::now())
    }

    #[cfg(any(test, feature = "test-helpers"))]
    pub fn insert_header_with_time(
        &mut self,
        raw: &[u8],
        peer: NodeId,
        now: Instant,
    ) -> Result<Admission, LedgerError> {
        self.insert_header_at(raw, peer, now)
    }

    #[cfg(any(test, feature = "test-helpers"))]
    pub fn insert_block_with_time(
        &mut self,
        raw: &[u8],
        peer: NodeId,
        now: Instant,
    ) -> Result<Admission, LedgerError> {
        self.insert_block_at(raw, peer, now)
    }

    fn insert_header_at(
        &mut self,
        raw: &[u8],
        peer: NodeId,
        now: Instant,
    ) -> Result<Admission, LedgerError> {
        let header =
            decode_block_header(raw).map_err(|e| LedgerError::MalformedHeader(e.to_string()))?;
        let record = Record {
            header_rlp: raw.to_vec(),
            body_rlp: Vec::new(),
            hash: hash_raw_header(raw),
            parent: header.parent_hash,
            key: None,
            peer,
            received_at: now,
            body_deadline: None,
        };
        let hash = record.hash;
        let admission = self.admit(header, record)?;
        self.seen_heads.insert(hash);
        Ok(admission)
    }

    fn insert_block_at(
        &mut self,
        raw: &[u8],
        peer: NodeId,
        now: Instant,
    ) -> Result<Admission, LedgerError> {
        let block = decode_block(raw).map_err(|e| LedgerError::MalformedHeader(e.to_string()))?;
        if !block.body_matches_header() {
            return Err(LedgerError::BadLinkage(block.hash));
        }
        let record = Record {
            header_rlp: block.header_rlp,
            body_rlp: block.body_rlp,
            hash: block.hash,
            parent: block.header.parent_hash,
            key: None,
            peer,
            received_at: now,
            body_deadline: None,
        };
        self.admit(block.header, record)
    }

    fn admit(&mut self, header: BlockHeader, record: Record) -> Result<Admission, LedgerError> {
        let number = header.number;
        if number == 0 {
            return Err(LedgerError::MalformedHeader("genesis cannot be synced".into()));
        }
        if number == u64::MAX {
            return Err(LedgerError::MalformedHeader("block number out of range".into()));
        }
        if number == 1 && record.parent != self.genesis_hash {
            return Err(LedgerError::NotFromGenesis);
        }

        if number > self.top_number() {
            let mut admission = Admission::Inserted;
            if let Some(parent) = self.records.get(&(number - 1)) {
                if parent.hash != record.parent {
                    debug!(number, hash = %record.hash, "competing chain above top, restarting");
                    self.clear();
                    admission = Admission::Restarted;
                }
            }
            self.put(number, &header, record);
            return Ok(admission);
        }

        if self.owner() != Some(record.peer) {
            trace!(number, peer = %short_id(&record.peer), "record from outside the session");
            return Ok(Admission::Ignored);
        }

        let top_time = self.top_time().unwrap_or(record.received_at);

        if let Some(child) = self.records.get(&(number + 1)) {
            if child.parent != record.hash {
                if child.received_at > top_time {
                    debug!(number, "child conflict newer than top, resetting");
                    self.clear();
                    return Ok(Admission::Reset);
                }
                debug!(number, "dropping unlinked children");
                self.prune_from(number + 1);
            }
        }

        if let Some(parent) = self.records.get(&(number - 1)) {
            if parent.hash != record.parent {
                if parent.received_at > top_time {
                    debug!(number, "parent conflict newer than top, resetting");
                    self.clear();
                    return Ok(Admission::Reset);
                }
                debug!(number, "dropping unlinked ancestors");
                self.prune_below(number + 1);
            }
        }

        self.put(number, &header, record);
        Ok(Admission::Inserted)
    }

    fn put(&mut self, number: u64, header: &BlockHeader, mut record: Record) {
        if let Some(old) = self.records.remove(&number) {
            self.unindex(number, &old);
        }
        if header.has_empty_body() && record.body_rlp.is_empty() {
            record.body_rlp =
                rlp::encode_list_of_encoded(&[EMPTY_LIST_RLP.to_vec(), EMPTY_LIST_RLP.to_vec()]);
            trace!(number, "empty body attached on admission");
        } else if record.body_rlp.is_empty() {
            let key = BodyKey::of_header(header);
            if let Some(other) = self.bodies.insert(key, number) {
                // Identical bodies at different heights: latest header wins the slot.
                trace!(number, other, "body key shared across heights");
            }
            record.key = Some(key);
        }
        self.records.insert(number, record);
    }

    fn unindex(&mut self, number: u64, record: &Record) {
        if let Some(key) = record.key {
            if self.bodies.get(&key) == Some(&number) {
                self.bodies.remove(&key);
            }
        }
    }

    /// Attach a body to the header that commits to it. Returns its number.
    pub fn attach_body(&mut self, raw: &[u8]) -> Result<u64, LedgerError> {
        let body = decode_block_body(raw).map_err(|e| LedgerError::MalformedBody(e.to_string()))?;
        let key = body.key();
        let number = *self.bodies.get(&key).ok_or(LedgerError::UnknownBody)?;
        let record = self
            .records
            .get_mut(&number)
            .ok_or(LedgerError::UnknownBody)?;
        record.body_rlp = raw.to_vec();
        record.body_deadline = None;
        trace!(number, hash = %record.hash, "body attached");
        Ok(number)
    }

    /// Drop every record numbered below `number`.
    pub fn prune_below(&mut self, number: u64) {
        let kept = self.records.split_off(&number);
        let removed = std::mem::replace(&mut self.records, kept);
        for (n, record) in &removed {
            self.unindex(*n, record);
        }
    }

    /// Drop the contiguous run of records starting at `number`. Stops at the
    /// first gap.
    pub fn prune_from(&mut self, number: u64) {
        let mut n = number;
        while let Some(record) = self.records.remove(&n) {
            self.unindex(n, &record);
            n += 1;
        }
    }

    /// Hashes of contiguous records, lowest first, still waiting on a body.
    /// Each hash yielded stamps a fresh request deadline on its record.
    pub fn pending_body_requests(&mut self, limit: usize) -> impl Iterator<Item = B256> + '_ {
        let deadline = Instant::now() + BODY_REQUEST_TIMEOUT;
        let mut expected = self.records.keys().next().copied();
        self.records
            .iter_mut()
            .take_while(move |(n, _)| {
                let contiguous = Some(**n) == expected;
                expected = expected.map(|e| e + 1);
                contiguous
            })
            .filter(|(_, r)| r.body_rlp.is_empty())
            .take(limit)
            .map(move |(_, r)| {
                r.body_deadline = Some(deadline);
                r.hash
            })
    }

    /// When the body request for `number` expires, if one is outstanding.
    pub fn body_deadline(&self, number: u64) -> Option<Instant> {
        self.records.get(&number).and_then(|r| r.body_deadline)
    }

    /// First header gap above the contiguous bottom run as `(start, count)`.
    /// `(0, bottom)` when the buffer has no gap, `(0, 0)` when it is empty.
    pub fn pending_header_gap(&self) -> (u64, u64) {
        let mut keys = self.records.keys().copied();
        let Some(first) = keys.next() else {
            return (0, 0);
        };
        let mut expected = first + 1;
        for key in keys {
            if key != expected {
                return (expected, key - expected);
            }
            expected += 1;
        }
        (0, self.bottom_number())
    }

    /// Drop the bottom records the chain already holds, keeping the highest
    /// known one as the anchor of the run.
    fn discard_known_prefix(&mut self, oracle: &impl ImportOracle) {
        let mut entries = self.anchored().then_some((0, self.genesis_hash)).into_iter().chain(
            self.records.iter().map(|(n, r)| (*n, r.hash)),
        );
        let Some((mut anchor, _)) = entries.clone().next() else {
            return;
        };
        for (n, hash) in entries.by_ref() {
            if !know_hash(oracle, &hash) {
                break;
            }
            anchor = n;
        }
        if anchor > 1 {
            self.prune_below(anchor);
        }
    }

    /// Import the contiguous run of complete records from the bottom, then
    /// prune what the chain now holds.
    pub fn collect_ready_run(&mut self, oracle: &mut impl ImportOracle) -> Collected {
        self.discard_known_prefix(&*oracle);

        let mut out = Collected::default();
        let mut numbers = self.records.keys().copied().collect::<Vec<_>>().into_iter().peekable();
        // A bodiless bottom record is the known anchor of the run.
        if let Some(first) = numbers.peek().copied() {
            if self.records.get(&first).is_some_and(|r| r.body_rlp.is_empty()) {
                numbers.next();
            }
        }

        let mut expected = numbers.peek().copied();
        for number in numbers {
            if Some(number) != expected {
                break;
            }
            expected = Some(number + 1);
            let Some(record) = self.records.get(&number) else {
                break;
            };
            if !record.is_complete() {
                trace!(number, "run stops at incomplete record");
                break;
            }
            let block = match assemble_block(&record.header_rlp, &record.body_rlp) {
                Ok(b) => b,
                Err(e) => {
                    warn!(number, err = %e, "buffered body is not a list");
                    self.prune_from(number);
                    out.halted_on = Some(ImportResult::Malformed);
                    break;
                }
            };
            let hash = record.hash;

            let result = oracle.import(&block);
            trace!(number, hash = %hash, ?result, "ready run import");
            match result {
                ImportResult::Success => {
                    if let Ok(header) = decode_block_header(&record.header_rlp) {
                        out.imported.push(header);
                    }
                    out.highest = out.highest.max(number);
                }
                ImportResult::AlreadyInChain => out.highest = out.highest.max(number),
                ImportResult::AlreadyKnown => match oracle.block_status(&hash) {
                    QueueStatus::Ready | QueueStatus::Importing => {
                        out.highest = out.highest.max(number)
                    }
                    _ => {
                        out.halted_on = Some(result);
                        break;
                    }
                },
                ImportResult::Malformed => {
                    warn!(number, hash = %hash, "buffered block rejected as malformed");
                    self.prune_from(number);
                    out.halted_on = Some(result);
                    break;
                }
                ImportResult::BadChain
                | ImportResult::FutureTimeKnown
                | ImportResult::FutureTimeUnknown
                | ImportResult::UnknownParent => {
                    out.halted_on = Some(result);
                    break;
                }
            }
        }

        if out.highest == 0 {
            return out;
        }
        if out.highest >= self.top_number() {
            self.clear();
        } else {
            self.prune_below(out.highest);
        }
        out
    }
}

/// Whether the chain holds `hash` or has it queued for import.
pub fn know_hash(oracle: &impl ImportOracle, hash: &B256) -> bool {
    if hash.is_zero() {
        return false;
    }
    matches!(
        oracle.block_status(hash),
        QueueStatus::Importing | QueueStatus::Ready
    ) || oracle.is_known(hash)
}
