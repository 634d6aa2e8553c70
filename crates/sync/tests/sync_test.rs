use std::collections::HashSet;

use alloy_primitives::{B256, U256};

use chain::oracle::ImportOracle;
use chain::tracker::ChainTracker;
use chain::trie::ordered_trie_root;
use chain::types::{encode_block, BlockHeader, EMPTY_LIST_RLP};
use devp2p::eth::{encode_new_block, Asking, EthStatus, HeaderStart};
use devp2p::rlp::{self, RlpItem};
use devp2p::types::NodeId;
use sync::{SyncConfig, SyncManager, SyncPeer, SyncState, MAX_REQUEST_COUNT};

// ---------------------------------------------------------------------------
// Mock peer
// ---------------------------------------------------------------------------

struct MockPeer {
    id: NodeId,
    status: EthStatus,
    client_id: String,
    asking: Asking,
    banned: bool,
    td: U256,
    latest: B256,
    known: HashSet<B256>,
    rating: i64,
    header_requests: Vec<(HeaderStart, u64)>,
    body_requests: Vec<Vec<B256>>,
    disabled: Option<String>,
}

impl MockPeer {
    fn new(genesis: &BlockHeader, td: u64) -> Self {
        Self {
            id: [0x11; 64],
            status: EthStatus {
                protocol_version: 63,
                network_id: 1,
                total_difficulty: U256::from(td),
                best_hash: B256::repeat_byte(0x42),
                genesis_hash: genesis.hash(),
            },
            client_id: "qpos-node/v0.1.0/linux".to_string(),
            asking: Asking::State,
            banned: false,
            td: U256::from(td),
            latest: B256::repeat_byte(0x42),
            known: HashSet::new(),
            rating: 0,
            header_requests: Vec::new(),
            body_requests: Vec::new(),
            disabled: None,
        }
    }

    fn last_header_request(&self) -> Option<(HeaderStart, u64)> {
        self.header_requests.last().copied()
    }
}

impl SyncPeer for MockPeer {
    fn id(&self) -> NodeId {
        self.id
    }
    fn status(&self) -> &EthStatus {
        &self.status
    }
    fn client_id(&self) -> &str {
        &self.client_id
    }
    fn asking(&self) -> Asking {
        self.asking
    }
    fn is_banned(&self) -> bool {
        self.banned
    }
    fn total_difficulty(&self) -> U256 {
        self.td
    }
    fn latest_hash(&self) -> B256 {
        self.latest
    }
    fn set_latest_hash(&mut self, hash: B256) {
        self.latest = hash;
    }
    fn mark_known(&mut self, hash: B256) {
        self.known.insert(hash);
    }
    fn add_rating(&mut self, delta: i64) {
        self.rating += delta;
    }
    fn set_idle(&mut self) {
        self.asking = Asking::Nothing;
    }
    fn request_block_headers(&mut self, start: HeaderStart, count: u64, _skip: u64, _reverse: bool) {
        self.asking = Asking::BlockHeaders;
        self.header_requests.push((start, count));
    }
    fn request_block_bodies(&mut self, hashes: Vec<B256>) {
        self.asking = Asking::BlockBodies;
        self.body_requests.push(hashes);
    }
    fn disable(&mut self, reason: &str) {
        self.disabled = Some(reason.to_string());
    }
}

// ---------------------------------------------------------------------------
// Chain fixtures
// ---------------------------------------------------------------------------

struct Block {
    header: BlockHeader,
    txs: Vec<Vec<u8>>,
}

impl Block {
    fn header_rlp(&self) -> Vec<u8> {
        self.header.rlp_encode()
    }

    fn body(&self) -> Vec<u8> {
        rlp::encode_list_of_encoded(&[
            rlp::encode_list_of_encoded(&self.txs),
            EMPTY_LIST_RLP.to_vec(),
        ])
    }

    fn raw(&self) -> Vec<u8> {
        encode_block(&self.header, &self.txs)
    }
}

fn genesis() -> BlockHeader {
    BlockHeader {
        gas_limit: 8_000_000,
        ..Default::default()
    }
}

fn build(parent: &BlockHeader, len: usize, salt: u8) -> Vec<Block> {
    let mut out: Vec<Block> = Vec::new();
    for i in 0..len {
        let prev = out.last().map_or(parent, |b| &b.header).clone();
        let txs = vec![RlpItem::Bytes(vec![salt, (i % 256) as u8, (i / 256) as u8]).encode()];
        let header = BlockHeader {
            parent_hash: prev.hash(),
            number: prev.number + 1,
            timestamp: prev.timestamp + 1,
            transactions_root: ordered_trie_root(&txs),
            extra_data: vec![salt],
            ..Default::default()
        };
        out.push(Block { header, txs });
    }
    out
}

fn setup(peer_td: u64) -> (SyncManager, ChainTracker, MockPeer, BlockHeader) {
    let g = genesis();
    let sync = SyncManager::new(SyncConfig::default(), g.hash());
    let chain = ChainTracker::new(g.clone());
    let peer = MockPeer::new(&g, peer_td);
    (sync, chain, peer, g)
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[test]
fn test_status_rejections_carry_reasons() {
    let reasons = [
        "Invalid genesis hash",
        "Invalid protocol version.",
        "Invalid network identifier.",
        "Blacklisted client version.",
        "Peer banned for previous bad behaviour.",
        "Peer banned for unexpected status message.",
    ];
    for (case, reason) in reasons.iter().enumerate() {
        let (mut sync, mut chain, mut peer, _) = setup(100);
        match case {
            0 => peer.status.genesis_hash = B256::repeat_byte(9),
            1 => peer.status.protocol_version = 61,
            2 => peer.status.network_id = 7,
            3 => peer.client_id = "Geth/v0.7.0/old".into(),
            4 => peer.banned = true,
            _ => peer.asking = Asking::BlockBodies,
        }
        sync.on_peer_status(&mut chain, &mut peer);
        assert_eq!(peer.disabled.as_deref(), Some(*reason));
        assert!(peer.header_requests.is_empty());
    }
}

#[test]
fn test_old_protocol_version_is_accepted() {
    let (mut sync, mut chain, mut peer, _) = setup(100);
    peer.status.protocol_version = 62;
    sync.on_peer_status(&mut chain, &mut peer);
    assert!(peer.disabled.is_none());
}

#[test]
fn test_heavier_peer_is_asked_for_its_head() {
    let (mut sync, mut chain, mut peer, _) = setup(100);
    sync.on_peer_status(&mut chain, &mut peer);
    assert_eq!(
        peer.header_requests,
        vec![(HeaderStart::ByHash(B256::repeat_byte(0x42)), 1)]
    );

    // A second peer with the same difficulty is not worth another head request.
    let mut other = MockPeer::new(&genesis(), 100);
    other.id = [0x22; 64];
    sync.on_peer_status(&mut chain, &mut other);
    assert!(other.header_requests.is_empty());
}

#[test]
fn test_lighter_peer_is_not_queried() {
    let (mut sync, mut chain, mut peer, _) = setup(1);
    sync.on_peer_status(&mut chain, &mut peer);
    assert!(peer.header_requests.is_empty());
    assert_eq!(peer.asking, Asking::Nothing);
}

// ---------------------------------------------------------------------------
// Header/body download
// ---------------------------------------------------------------------------

#[test]
fn test_full_download_from_head_request_to_import() {
    let (mut sync, mut chain, mut peer, g) = setup(100);
    let blocks = build(&g, 5, 1);

    sync.on_block_headers(&mut chain, &mut peer, &[blocks[4].header_rlp()]);
    assert_eq!(peer.last_header_request(), Some((HeaderStart::ByNumber(2), 3)));

    let middle: Vec<Vec<u8>> = blocks[1..4].iter().map(Block::header_rlp).collect();
    sync.on_block_headers(&mut chain, &mut peer, &middle);
    assert_eq!(peer.last_header_request(), Some((HeaderStart::ByNumber(1), 1)));

    sync.on_block_headers(&mut chain, &mut peer, &[blocks[0].header_rlp()]);
    let wanted: Vec<B256> = blocks.iter().map(|b| b.header.hash()).collect();
    assert_eq!(peer.body_requests.last(), Some(&wanted));

    let bodies: Vec<Vec<u8>> = blocks.iter().map(Block::body).collect();
    let imported = sync.on_block_bodies(&mut chain, &mut peer, &bodies);
    assert_eq!(imported.len(), 5);
    assert_eq!(chain.number(), 5);
    assert!(sync.ledger().is_empty());
    assert_eq!(sync.highest_block(), 5);
}

#[test]
fn test_far_ahead_header_searches_back_from_local_head() {
    let (mut sync, mut chain, mut peer, g) = setup(1_000);
    for b in build(&g, 20, 1) {
        chain.import(&b.raw());
    }
    let theirs = build(&g, 100, 2);

    sync.on_block_headers(&mut chain, &mut peer, &[theirs[99].header_rlp()]);
    assert_eq!(
        peer.last_header_request(),
        Some((HeaderStart::ByNumber(16), MAX_REQUEST_COUNT))
    );
}

#[test]
fn test_search_halves_towards_genesis_when_local_chain_is_short() {
    let (mut sync, mut chain, mut peer, g) = setup(1_000);
    for b in build(&g, 5, 1) {
        chain.import(&b.raw());
    }
    let theirs = build(&g, 100, 2);

    sync.on_block_headers(&mut chain, &mut peer, &[theirs[99].header_rlp()]);
    assert_eq!(
        peer.last_header_request(),
        Some((HeaderStart::ByNumber(50), MAX_REQUEST_COUNT))
    );
}

#[test]
fn test_known_header_anchors_the_session() {
    let (mut sync, mut chain, mut peer, g) = setup(1_000);
    let blocks = build(&g, 12, 1);
    for b in &blocks[..10] {
        chain.import(&b.raw());
    }

    sync.on_block_headers(&mut chain, &mut peer, &[blocks[11].header_rlp()]);
    // Block 10 is ours already: it becomes the bottom of the run.
    let answer: Vec<Vec<u8>> = blocks[8..10].iter().map(Block::header_rlp).collect();
    sync.on_block_headers(&mut chain, &mut peer, &answer);
    assert_eq!(sync.ledger().bottom_number(), 10);
    assert_eq!(peer.body_requests.last(), Some(&vec![blocks[9].header.hash()]));

    sync.on_block_bodies(&mut chain, &mut peer, &[blocks[9].body()]);
    assert_eq!(peer.last_header_request(), Some((HeaderStart::ByNumber(11), 1)));

    sync.on_block_headers(&mut chain, &mut peer, &[blocks[10].header_rlp()]);
    let wanted: Vec<B256> = blocks[10..12].iter().map(|b| b.header.hash()).collect();
    assert_eq!(peer.body_requests.last(), Some(&wanted));
}

#[test]
fn test_empty_responses_cost_rating() {
    let (mut sync, mut chain, mut peer, _) = setup(100);
    sync.on_block_headers(&mut chain, &mut peer, &[]);
    sync.on_block_bodies(&mut chain, &mut peer, &[]);
    assert_eq!(peer.rating, -2);
}

#[test]
fn test_unmatched_body_is_dropped() {
    let (mut sync, mut chain, mut peer, g) = setup(100);
    let blocks = build(&g, 3, 1);
    sync.on_block_headers(&mut chain, &mut peer, &[blocks[2].header_rlp()]);
    let before = sync.ledger().len();

    let stray = build(&g, 1, 9).remove(0).body();
    sync.on_block_bodies(&mut chain, &mut peer, &[stray]);
    assert_eq!(sync.ledger().len(), before);
    assert_eq!(chain.number(), 0);
}

#[test]
fn test_foreign_headers_do_not_drive_the_session() {
    let (mut sync, mut chain, mut owner, g) = setup(100);
    let blocks = build(&g, 6, 1);
    sync.on_block_headers(&mut chain, &mut owner, &[blocks[5].header_rlp()]);

    let mut stranger = MockPeer::new(&g, 100);
    stranger.id = [0x33; 64];
    sync.on_block_headers(&mut chain, &mut stranger, &[blocks[2].header_rlp()]);
    assert!(!sync.ledger().contains(3));
    assert!(stranger.header_requests.is_empty());
    assert_eq!(sync.ledger().owner(), Some(owner.id));
}

// ---------------------------------------------------------------------------
// Announcements
// ---------------------------------------------------------------------------

#[test]
fn test_new_block_success_rewards_peer() {
    let (mut sync, mut chain, mut peer, g) = setup(100);
    let block = build(&g, 1, 1).remove(0);
    let payload = encode_new_block(&block.raw(), &U256::from(2u64));

    let imported = sync.on_new_block(&mut chain, &mut peer, &payload);
    assert_eq!(imported.len(), 1);
    assert_eq!(peer.rating, 100);
    assert!(peer.known.contains(&block.header.hash()));
    assert_eq!(chain.number(), 1);
}

#[test]
fn test_new_block_shape_and_content_violations_disable() {
    let (mut sync, mut chain, mut peer, g) = setup(100);
    let block = build(&g, 1, 1).remove(0);
    let one_item = rlp::encode_list_of_encoded(&[block.raw()]);
    sync.on_new_block(&mut chain, &mut peer, &one_item);
    assert_eq!(peer.disabled.as_deref(), Some("NewBlock without 2 data fields."));

    let mut peer = MockPeer::new(&g, 100);
    let tampered = encode_block(&block.header, &[RlpItem::Bytes(b"evil".to_vec()).encode()]);
    let payload = encode_new_block(&tampered, &U256::from(2u64));
    sync.on_new_block(&mut chain, &mut peer, &payload);
    assert_eq!(peer.disabled.as_deref(), Some("Malformed block received."));
}

#[test]
fn test_orphan_new_block_starts_session_and_completes() {
    let (mut sync, mut chain, mut peer, g) = setup(1_000);
    let blocks = build(&g, 3, 1);
    let payload = encode_new_block(&blocks[2].raw(), &U256::from(4u64));

    sync.on_new_block(&mut chain, &mut peer, &payload);
    assert_eq!(sync.ledger().top_number(), 3);
    assert_eq!(peer.last_header_request(), Some((HeaderStart::ByNumber(1), 2)));

    let headers: Vec<Vec<u8>> = blocks[..2].iter().map(Block::header_rlp).collect();
    sync.on_block_headers(&mut chain, &mut peer, &headers);
    let wanted: Vec<B256> = blocks[..2].iter().map(|b| b.header.hash()).collect();
    assert_eq!(peer.body_requests.last(), Some(&wanted));

    let bodies: Vec<Vec<u8>> = blocks[..2].iter().map(Block::body).collect();
    sync.on_block_bodies(&mut chain, &mut peer, &bodies);
    assert_eq!(chain.number(), 3);
    assert!(sync.ledger().is_empty());
}

#[test]
fn test_new_hashes_request_unknown_and_track_latest() {
    let (mut sync, chain, mut peer, _) = setup(1);
    peer.asking = Asking::Nothing;
    let fresh = B256::repeat_byte(7);
    let started = sync.on_new_hashes(&chain, &mut peer, &[(chain.genesis_hash(), 0), (fresh, 9)]);
    assert!(started);
    assert_eq!(peer.rating, 2);
    assert_eq!(peer.latest, fresh);
    assert_eq!(peer.last_header_request(), Some((HeaderStart::ByHash(fresh), 1)));
}

#[test]
fn test_new_hashes_ignored_while_conversing() {
    let (mut sync, chain, mut peer, _) = setup(1);
    peer.asking = Asking::BlockHeaders;
    assert!(!sync.on_new_hashes(&chain, &mut peer, &[(B256::repeat_byte(7), 9)]));
    assert_eq!(peer.rating, 0);
}

#[test]
fn test_new_hashes_bail_on_bad_hash() {
    let (mut sync, mut chain, mut peer, g) = setup(1);
    peer.asking = Asking::Nothing;
    let block = build(&g, 1, 1).remove(0);
    let bad = encode_block(&block.header, &[RlpItem::Bytes(b"evil".to_vec()).encode()]);
    chain.import(&bad);

    let started = sync.on_new_hashes(
        &chain,
        &mut peer,
        &[(block.header.hash(), 1), (B256::repeat_byte(7), 2)],
    );
    assert!(!started);
    assert!(peer.header_requests.is_empty());
}

// ---------------------------------------------------------------------------
// Local imports and status
// ---------------------------------------------------------------------------

#[test]
fn test_local_import_far_ahead_drops_session() {
    let (mut sync, mut chain, mut peer, g) = setup(100);
    let blocks = build(&g, 30, 1);
    sync.on_block_headers(&mut chain, &mut peer, &[blocks[4].header_rlp()]);
    assert!(!sync.ledger().is_empty());

    sync.on_block_imported(&blocks[24].header);
    assert!(!sync.ledger().is_empty());
    sync.on_block_imported(&blocks[25].header);
    assert!(sync.ledger().is_empty());
}

#[test]
fn test_local_import_of_buffered_block_prunes_below() {
    let (mut sync, chain, peer, g) = setup(100);
    let blocks = build(&g, 5, 1);
    for b in blocks.iter().rev() {
        sync.ledger_mut().insert_header(&b.header_rlp(), peer.id).unwrap();
    }
    sync.on_block_imported(&build(&g, 3, 7)[2].header);
    assert_eq!(sync.ledger().len(), 5);

    sync.on_block_imported(&blocks[2].header);
    assert_eq!(sync.ledger().len(), 3);
    assert_eq!(sync.ledger().bottom_number(), 3);

    let status = sync.status(&chain);
    assert_eq!(status.state, SyncState::Idle);
    assert_eq!(status.start_block_number, 3);
    assert_eq!(status.current_block_number, 0);
}

#[test]
fn test_room_available_requeries_peers() {
    let (mut sync, chain, a, g) = setup(50);
    let mut b = MockPeer::new(&g, 80);
    b.id = [0x44; 64];
    let mut peers = vec![a, b];
    sync.on_room_available(&chain, peers.iter_mut());
    assert_eq!(peers[0].header_requests.len(), 1);
    assert_eq!(peers[1].header_requests.len(), 1);
    assert_eq!(peers[0].asking, Asking::BlockHeaders);
}
