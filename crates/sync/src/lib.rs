pub mod ledger;
pub mod peer;

use alloy_primitives::{B256, U256};
use tracing::{debug, info, trace, warn};

use chain::decode::{decode_block, decode_block_header};
use chain::oracle::{ImportOracle, ImportResult, QueueStatus};
use chain::types::{bytes_to_u256, BlockHeader};
use devp2p::constants::{OLD_PROTOCOL_VERSION, PROTOCOL_VERSION};
use devp2p::eth::{split_new_block, Asking, HeaderStart};
use devp2p::rlp;
use devp2p::types::{short_id, NodeId};

use ledger::{know_hash, Admission, Collected, Ledger, LedgerError};
pub use peer::{ManagedPeer, SyncPeer};

/// Largest batch of headers or bodies asked of one peer.
pub const MAX_REQUEST_COUNT: u64 = 8;
/// A header gap wider than this is split in half when the local head is past it.
pub const HALVING_THRESHOLD: u64 = MAX_REQUEST_COUNT * 4;
/// How far a local import may run ahead of the session before it is dropped.
pub const STALE_SESSION_SLACK: u64 = 20;
pub const DEFAULT_NETWORK_ID: u64 = 1;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub network_id: u64,
    pub protocol_version: u32,
    /// Also accepted in the handshake.
    pub old_protocol_version: u32,
    /// Client id fragments that get a peer disabled.
    pub client_blacklist: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            network_id: DEFAULT_NETWORK_ID,
            protocol_version: PROTOCOL_VERSION,
            old_protocol_version: OLD_PROTOCOL_VERSION,
            client_blacklist: vec!["/v0.7.0/".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub protocol_version: u32,
    pub start_block_number: u64,
    pub current_block_number: u64,
    pub highest_block_number: u64,
}

/// Drives block download from peers through the [`Ledger`].
///
/// One session is active at a time, owned by the peer that supplied the top
/// of the ledger. Every entry point takes `&mut self`, so peer callbacks and
/// import notifications are serialized by whoever owns the manager.
pub struct SyncManager {
    config: SyncConfig,
    ledger: Ledger,
    /// Highest total difficulty a head request was started for.
    syncing_td: U256,
    highest_block: u64,
}

impl SyncManager {
    pub fn new(config: SyncConfig, genesis_hash: B256) -> Self {
        Self {
            config,
            ledger: Ledger::new(genesis_hash),
            syncing_td: U256::ZERO,
            highest_block: 0,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[cfg(any(test, feature = "test-helpers"))]
    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    pub fn highest_block(&self) -> u64 {
        self.highest_block
    }

    pub fn status(&self, oracle: &impl ImportOracle) -> SyncStatus {
        SyncStatus {
            state: SyncState::Idle,
            protocol_version: self.config.old_protocol_version,
            start_block_number: self.ledger.bottom_number().max(1),
            current_block_number: oracle.number(),
            highest_block_number: self.highest_block,
        }
    }

    /// Validate a peer's handshake and start syncing from it.
    pub fn on_peer_status(
        &mut self,
        oracle: &mut impl ImportOracle,
        peer: &mut impl SyncPeer,
    ) -> Vec<BlockHeader> {
        let status = peer.status();
        let reason = if status.genesis_hash != oracle.genesis_hash() {
            Some("Invalid genesis hash")
        } else if status.protocol_version != self.config.protocol_version
            && status.protocol_version != self.config.old_protocol_version
        {
            Some("Invalid protocol version.")
        } else if status.network_id != self.config.network_id {
            Some("Invalid network identifier.")
        } else if self
            .config
            .client_blacklist
            .iter()
            .any(|bad| peer.client_id().contains(bad.as_str()))
        {
            Some("Blacklisted client version.")
        } else if peer.is_banned() {
            Some("Peer banned for previous bad behaviour.")
        } else if !matches!(peer.asking(), Asking::State | Asking::Nothing) {
            Some("Peer banned for unexpected status message.")
        } else {
            None
        };

        if let Some(reason) = reason {
            peer.disable(reason);
            return Vec::new();
        }

        info!(
            peer = %short_id(&peer.id()),
            td = %peer.total_difficulty(),
            buffered = self.ledger.len(),
            "peer status accepted"
        );
        peer.set_idle();
        self.sync_peer(&*oracle, peer, false);
        self.continue_sync(oracle, peer).imported
    }

    /// Request the peer's best block if it claims more work than we are
    /// already chasing, or unconditionally when forced.
    pub fn sync_peer(&mut self, oracle: &impl ImportOracle, peer: &mut impl SyncPeer, force: bool) {
        let syncing_td = self.syncing_td.max(oracle.total_difficulty());
        if force || peer.total_difficulty() > syncing_td {
            self.syncing_td = peer.total_difficulty();
            let latest = peer.latest_hash();
            debug!(peer = %short_id(&peer.id()), force, latest = %latest, "probing peer head");
            peer.request_block_headers(HeaderStart::ByHash(latest), 1, 0, false);
        }
    }

    /// The importer has room again: query every peer again.
    pub fn on_room_available<'p, P: SyncPeer + 'p>(
        &mut self,
        oracle: &impl ImportOracle,
        peers: impl IntoIterator<Item = &'p mut P>,
    ) {
        for peer in peers {
            self.sync_peer(oracle, peer, false);
        }
    }

    /// Import what is ready, then ask the session owner for the next batch.
    pub fn continue_sync(
        &mut self,
        oracle: &mut impl ImportOracle,
        peer: &mut impl SyncPeer,
    ) -> Collected {
        let collected = self.ledger.collect_ready_run(oracle);
        if !collected.imported.is_empty() {
            info!(
                count = collected.imported.len(),
                highest = collected.highest,
                "imported buffered blocks"
            );
        }
        if self.ledger.is_empty() || self.ledger.owner() != Some(peer.id()) {
            trace!(
                peer = %short_id(&peer.id()),
                empty = self.ledger.is_empty(),
                "not continuing sync with peer"
            );
            return collected;
        }

        let local = oracle.number();
        let bottom = self.ledger.bottom_number();
        if know_hash(&*oracle, &self.ledger.bottom_hash()) {
            let bodies: Vec<B256> = self
                .ledger
                .pending_body_requests(MAX_REQUEST_COUNT as usize)
                .collect();
            if !bodies.is_empty() {
                debug!(from = bottom, count = bodies.len(), "requesting bodies");
                peer.request_block_bodies(bodies);
                return collected;
            }

            let (mut start, mut count) = self.ledger.pending_header_gap();
            let end = start + count;
            if local > end && count > HALVING_THRESHOLD {
                start += count / 2;
                count = end - start;
            }
            count = count.min(MAX_REQUEST_COUNT);
            if start > 0 && count > 0 {
                debug!(start, count, "requesting header gap");
                peer.request_block_headers(HeaderStart::ByNumber(start), count, 0, false);
            }
            return collected;
        }

        // The bottom does not connect to our chain yet: search backwards for
        // a common ancestor.
        let (start, count) = if bottom > local && local > MAX_REQUEST_COUNT {
            let start = local - MAX_REQUEST_COUNT / 2;
            (start, bottom - start)
        } else if bottom > 1 {
            (bottom / 2, bottom - bottom / 2)
        } else {
            (bottom, 0)
        };
        if count == 0 {
            debug!(bottom, local, "no ancestor search possible");
            return collected;
        }
        let count = count.min(MAX_REQUEST_COUNT);
        debug!(start, count, bottom, local, "probing for common ancestor");
        peer.request_block_headers(HeaderStart::ByNumber(start), count, 0, false);
        collected
    }

    pub fn on_block_headers(
        &mut self,
        oracle: &mut impl ImportOracle,
        peer: &mut impl SyncPeer,
        headers: &[Vec<u8>],
    ) -> Vec<BlockHeader> {
        peer.set_idle();
        debug!(peer = %short_id(&peer.id()), count = headers.len(), "block headers");
        if headers.is_empty() {
            peer.add_rating(-1);
        }

        let ahead = peer.total_difficulty() > oracle.total_difficulty();
        let local = oracle.number();
        // Highest header we already hold, with its position in `headers`.
        let mut known: Option<(u64, usize)> = None;

        for (i, raw) in headers.iter().enumerate() {
            let header = match decode_block_header(raw) {
                Ok(h) => h,
                Err(e) => {
                    debug!(err = %e, "dropping undecodable header");
                    continue;
                }
            };
            let number = header.number;
            self.highest_block = self.highest_block.max(number);

            if self.ledger.contains(number) && self.ledger.owner_of(number) == self.ledger.owner() {
                trace!(number, "header already buffered for this session");
                continue;
            }
            if !self.ledger.is_empty() || ahead || local < number {
                self.admit_header(raw, peer.id());
            }
            if know_hash(&*oracle, &header.hash()) && number > known.map_or(0, |(n, _)| n) {
                known = Some((number, i));
            }
        }

        if let Some((number, i)) = known {
            let bottom = self.ledger.bottom_number();
            if number > bottom || !know_hash(&*oracle, &self.ledger.bottom_hash()) {
                debug!(number, bottom, "anchoring session at known header");
                if number > bottom {
                    self.ledger.prune_below(number);
                }
                self.admit_header(&headers[i], peer.id());
            }
        }

        self.continue_sync(oracle, peer).imported
    }

    pub fn on_block_bodies(
        &mut self,
        oracle: &mut impl ImportOracle,
        peer: &mut impl SyncPeer,
        bodies: &[Vec<u8>],
    ) -> Vec<BlockHeader> {
        peer.set_idle();
        debug!(peer = %short_id(&peer.id()), count = bodies.len(), "block bodies");
        if bodies.is_empty() {
            peer.add_rating(-1);
        }
        for raw in bodies {
            match self.ledger.attach_body(raw) {
                Ok(number) => trace!(number, "body buffered"),
                Err(LedgerError::UnknownBody) => trace!("ignored unknown block body"),
                Err(e) => debug!(err = %e, "dropping body"),
            }
        }
        self.continue_sync(oracle, peer).imported
    }

    /// Unsolicited `[block, total difficulty]` announcement.
    pub fn on_new_block(
        &mut self,
        oracle: &mut impl ImportOracle,
        peer: &mut impl SyncPeer,
        payload: &[u8],
    ) -> Vec<BlockHeader> {
        let items = match split_new_block(payload) {
            Ok(items) if items.len() == 2 => items,
            _ => {
                peer.disable("NewBlock without 2 data fields.");
                return Vec::new();
            }
        };
        let block_raw = &items[0];
        let block = match decode_block(block_raw) {
            Ok(b) => b,
            Err(e) => {
                debug!(err = %e, "undecodable new block");
                peer.disable("Malformed block received.");
                return Vec::new();
            }
        };
        let announced_td = rlp::decode(&items[1])
            .and_then(|item| item.into_bytes())
            .map(|b| bytes_to_u256(&b))
            .unwrap_or_default();

        peer.mark_known(block.hash);
        let number = block.header.number;
        self.highest_block = self.highest_block.max(number);

        let result = oracle.import(block_raw);
        debug!(
            peer = %short_id(&peer.id()),
            number,
            hash = %block.hash,
            td = %announced_td,
            ?result,
            "new block"
        );
        let mut imported = Vec::new();
        match result {
            ImportResult::Success => {
                peer.add_rating(100);
                imported.push(block.header);
            }
            ImportResult::FutureTimeKnown
            | ImportResult::AlreadyInChain
            | ImportResult::AlreadyKnown => {}
            ImportResult::Malformed | ImportResult::BadChain => {
                peer.disable("Malformed block received.");
            }
            ImportResult::FutureTimeUnknown | ImportResult::UnknownParent => {
                let start_session = self.ledger.is_empty()
                    && (peer.total_difficulty() > oracle.total_difficulty()
                        || oracle.number() < number);
                if !self.ledger.is_empty() || start_session {
                    match self.ledger.insert_block(block_raw, peer.id()) {
                        Ok(admission) => trace!(number, ?admission, "buffered new block"),
                        Err(e) => debug!(number, err = %e, "new block not buffered"),
                    }
                    imported.extend(self.continue_sync(oracle, peer).imported);
                }
            }
        }
        imported
    }

    /// Hashes announced without bodies. Returns whether a head request was started.
    pub fn on_new_hashes(
        &mut self,
        oracle: &impl ImportOracle,
        peer: &mut impl SyncPeer,
        hashes: &[(B256, u64)],
    ) -> bool {
        if peer.is_conversing() {
            trace!("ignoring new hashes while downloading");
            return false;
        }
        let mut knowns = 0usize;
        let mut unknowns = 0usize;
        let mut max_height = 0u64;
        for (hash, number) in hashes {
            peer.add_rating(1);
            peer.mark_known(*hash);
            if know_hash(&*oracle, hash) {
                knowns += 1;
                continue;
            }
            match oracle.block_status(hash) {
                QueueStatus::Bad => {
                    warn!(hash = %hash, "announced hash is bad, bailing");
                    return false;
                }
                QueueStatus::Unknown => {
                    unknowns += 1;
                    if *number > max_height {
                        max_height = *number;
                        peer.set_latest_hash(*hash);
                    }
                }
                _ => knowns += 1,
            }
        }
        debug!(knowns, unknowns, "new hashes");
        if unknowns > 0 {
            self.sync_peer(oracle, peer, true);
            return true;
        }
        false
    }

    /// A block reached the chain by any route.
    pub fn on_block_imported(&mut self, header: &BlockHeader) {
        let number = header.number;
        let top = self.ledger.top_number();
        if number > top.saturating_add(STALE_SESSION_SLACK) {
            if !self.ledger.is_empty() {
                debug!(number, top, "local chain passed the session, dropping it");
            }
            self.ledger.clear();
            return;
        }
        if self.ledger.hash(number) != Some(header.hash()) {
            return;
        }
        self.ledger.prune_below(number);
    }

    fn admit_header(&mut self, raw: &[u8], peer: NodeId) {
        match self.ledger.insert_header(raw, peer) {
            Ok(Admission::Inserted) => {}
            Ok(admission) => debug!(?admission, peer = %short_id(&peer), "header admission"),
            Err(e) => debug!(err = %e, "header rejected"),
        }
    }
}
