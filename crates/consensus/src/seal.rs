use std::sync::Arc;

use alloy_primitives::U256;
use chain::oracle::{ImportOracle, ImportResult};
use chain::types::BlockHeader;
use devp2p::eth::{BLOCK_BODIES_MSG_ID, BLOCK_HEADERS_MSG_ID, NEW_BLOCK_HASHES_MSG_ID, NEW_BLOCK_MSG_ID};
use devp2p::types::{short_id, NodeId};
use tracing::{debug, info, warn};

use crate::engine::{Outbox, Qpos, SealedBlock};
use crate::miners::{MinerResolver, MinerSet, NodeListOracle, SharedPeers};
use crate::signer::Signer;

/// What block production needs from a consensus engine.
pub trait SealEngine {
    fn name(&self) -> &'static str;

    /// Whether a new block should be assembled and handed to `generate_seal`.
    fn should_seal(&self) -> bool;

    /// Fill in the consensus fields of a header built on `parent`.
    fn populate_from_parent(&self, header: &mut BlockHeader, parent: &BlockHeader);

    fn generate_seal(&mut self, block: Vec<u8>);
}

/// Binds the QPOS state machine to block production, the node list and
/// the chain importer.
pub struct QposSealEngine<S, N> {
    qpos: Qpos<S>,
    resolver: MinerResolver,
    nodes: N,
    connected: Vec<NodeId>,
    committee_peers: SharedPeers,
}

impl<S: Signer, N: NodeListOracle> QposSealEngine<S, N> {
    pub fn new(qpos: Qpos<S>, resolver: MinerResolver, nodes: N) -> Self {
        QposSealEngine {
            qpos,
            resolver,
            nodes,
            connected: Vec::new(),
            committee_peers: SharedPeers::default(),
        }
    }

    pub fn qpos(&self) -> &Qpos<S> {
        &self.qpos
    }

    pub fn qpos_mut(&mut self) -> &mut Qpos<S> {
        &mut self.qpos
    }

    pub fn resolver(&self) -> &MinerResolver {
        &self.resolver
    }

    /// Peers currently connected; only consulted when every peer is admitted
    /// as a miner.
    pub fn set_connected(&mut self, peers: Vec<NodeId>) {
        self.connected = peers;
    }

    /// Handle for a `BlockCertifier` to resolve the committee this engine
    /// signs with.
    pub fn committee_peers(&self) -> SharedPeers {
        self.committee_peers.clone()
    }

    /// Re-read the committee. A failing node list keeps the previous snapshot.
    pub fn refresh_miners(&mut self) -> Arc<MinerSet> {
        match self.resolver.resolve(&self.nodes, None, &self.connected) {
            Ok(miners) => {
                if miners != **self.qpos.miners() {
                    info!(miners = miners.len(), "miner set changed");
                }
                self.committee_peers.set(self.connected.clone());
                self.qpos.set_miners(Arc::new(miners));
            }
            Err(e) => warn!(err = %e, "node list unavailable, keeping miner set"),
        }
        self.qpos.miners().clone()
    }

    /// Sealing starts on top of `head`.
    pub fn start_sealing(&mut self, head: u64, now: u64) {
        self.refresh_miners();
        self.qpos.report_block(head, true, now);
        info!(
            head,
            miners = self.qpos.node_count(),
            leader = self.qpos.is_leader(),
            "sealing started"
        );
    }

    /// A block was imported locally, from any source.
    pub fn on_block_imported(&mut self, number: u64, now: u64) {
        self.refresh_miners();
        self.qpos.report_block(number, false, now);
    }

    pub fn tick(&mut self, now: u64) {
        self.qpos.tick(now);
    }

    pub fn on_packet(&mut self, from: NodeId, raw: &[u8], now: u64) {
        self.qpos.on_packet(from, raw, now);
    }

    /// Sync packets from non-miners are dropped once a committee is known.
    pub fn accepts_eth_packet(&self, from: &NodeId, msg_id: u8) -> bool {
        let miners = self.qpos.miners();
        if miners.is_empty() || miners.contains(from) {
            return true;
        }
        let sync_packet = matches!(
            msg_id,
            BLOCK_HEADERS_MSG_ID | BLOCK_BODIES_MSG_ID | NEW_BLOCK_MSG_ID | NEW_BLOCK_HASHES_MSG_ID
        );
        if sync_packet {
            debug!(peer = %short_id(from), msg_id, "dropping sync packet from non-miner");
        }
        !sync_packet
    }

    /// Hand a committed block to the importer. Empty bytes reset the round.
    pub fn submit_sealed(&mut self, oracle: &mut impl ImportOracle, sealed: &SealedBlock, now: u64) -> Option<ImportResult> {
        if sealed.block.is_empty() {
            self.qpos.reset(now);
            return None;
        }
        let result = oracle.import(&sealed.block);
        if result == ImportResult::Success {
            debug!(ours = sealed.ours, size = sealed.block.len(), "committed block imported");
        } else {
            warn!(ours = sealed.ours, result = ?result, "submitting committed block failed");
        }
        Some(result)
    }

    pub fn drain(&mut self) -> Outbox {
        self.qpos.drain()
    }
}

impl<S: Signer, N: NodeListOracle> SealEngine for QposSealEngine<S, N> {
    fn name(&self) -> &'static str {
        "QPOS"
    }

    fn should_seal(&self) -> bool {
        self.qpos.should_seal()
    }

    fn populate_from_parent(&self, header: &mut BlockHeader, parent: &BlockHeader) {
        header.parent_hash = parent.hash();
        header.number = parent.number + 1;
        header.state_root = parent.state_root;
        header.gas_limit = parent.gas_limit;
        header.difficulty = U256::from(1u64);
    }

    fn generate_seal(&mut self, block: Vec<u8>) {
        self.refresh_miners();
        self.qpos.propose(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::QposTimings;
    use crate::miners::StaticNodeList;
    use crate::signer::K256Signer;
    use k256::ecdsa::SigningKey;

    fn engine(list: StaticNodeList) -> QposSealEngine<K256Signer, StaticNodeList> {
        let signer = K256Signer::new(SigningKey::random(&mut rand::thread_rng()));
        let resolver = MinerResolver::new(signer.id());
        QposSealEngine::new(Qpos::new(signer, QposTimings::default()), resolver, list)
    }

    #[test]
    fn header_inherits_gas_limit_with_unit_difficulty() {
        let engine = engine(StaticNodeList::default());
        let parent = BlockHeader {
            number: 6,
            gas_limit: 8_000_000,
            difficulty: U256::from(77u64),
            ..Default::default()
        };
        let mut header = BlockHeader::default();
        engine.populate_from_parent(&mut header, &parent);
        assert_eq!(header.number, 7);
        assert_eq!(header.parent_hash, parent.hash());
        assert_eq!(header.gas_limit, 8_000_000);
        assert_eq!(header.difficulty, U256::from(1u64));
        assert_eq!(engine.name(), "QPOS");
    }

    #[test]
    fn lone_node_leads_after_start() {
        let mut engine = engine(StaticNodeList::default());
        assert!(!engine.should_seal());
        engine.start_sealing(0, 0);
        assert_eq!(engine.qpos().node_count(), 1);
        assert!(engine.should_seal());
    }

    #[test]
    fn non_miner_sync_packets_are_filtered() {
        let list = StaticNodeList::from_json(&format!(r#"[{{"id":"{}"}}]"#, hex::encode([3u8; 64]))).unwrap();
        let mut engine = engine(list);
        engine.refresh_miners();
        assert!(engine.accepts_eth_packet(&[3; 64], NEW_BLOCK_MSG_ID));
        assert!(!engine.accepts_eth_packet(&[4; 64], NEW_BLOCK_MSG_ID));
        assert!(!engine.accepts_eth_packet(&[4; 64], BLOCK_BODIES_MSG_ID));
        assert!(engine.accepts_eth_packet(&[4; 64], devp2p::eth::STATUS_MSG_ID));
    }

    #[test]
    fn connected_peers_join_when_anyone_may_mine() {
        let signer = K256Signer::new(SigningKey::random(&mut rand::thread_rng()));
        let resolver = MinerResolver::new(signer.id()).with_exnodes_anyone(true);
        let mut engine = QposSealEngine::new(
            Qpos::new(signer, QposTimings::default()),
            resolver,
            StaticNodeList::from_json(&format!(r#"[{{"id":"{}"}}]"#, hex::encode([3u8; 64]))).unwrap(),
        );
        engine.set_connected(vec![[5; 64]]);
        assert_eq!(engine.refresh_miners().len(), 3);
    }

    #[test]
    fn commit_with_connected_miner_certifies_on_import() {
        use crate::certify::BlockCertifier;
        use chain::tracker::ChainTracker;
        use devp2p::qpos::QposPacket;

        // Sorted positions of the listed miner, this node and the peer vary
        // with the keys, so cover several draws.
        for _ in 0..20 {
            let listed = K256Signer::new(SigningKey::random(&mut rand::thread_rng()));
            let peer = K256Signer::new(SigningKey::random(&mut rand::thread_rng()));
            let signer = K256Signer::new(SigningKey::random(&mut rand::thread_rng()));
            let list = StaticNodeList::from_json(&format!(r#"[{{"id":"{}"}}]"#, hex::encode(listed.id()))).unwrap();
            let resolver = MinerResolver::new(signer.id()).with_exnodes_anyone(true);
            let mut engine = QposSealEngine::new(
                Qpos::new(signer, QposTimings::default()),
                resolver.clone(),
                list.clone(),
            );
            let genesis = BlockHeader::default();
            let mut chain = ChainTracker::new(genesis.clone());
            chain.set_seal_verifier(Box::new(
                BlockCertifier::new(resolver, list).with_peers(engine.committee_peers()),
            ));

            engine.set_connected(vec![peer.id()]);
            engine.start_sealing(0, 0);
            assert_eq!(engine.qpos().node_count(), 3);
            engine
                .qpos_mut()
                .on_message(peer.id(), QposPacket::VoteAck { vote: true }, 0);
            assert!(engine.should_seal());

            let mut header = BlockHeader::default();
            engine.populate_from_parent(&mut header, &genesis);
            engine.generate_seal(chain::types::encode_block(&header, &[]));
            engine.tick(1_000);
            let ack = QposPacket::BlockVoteAck {
                vote: true,
                view: engine.qpos().view(),
                signature: peer.sign(&header.seal_hash()).unwrap(),
                target: *engine.qpos().id(),
            };
            engine.qpos_mut().on_message(peer.id(), ack, 1_100);

            let outbox = engine.drain();
            assert_eq!(outbox.sealed.len(), 1);
            assert_eq!(
                engine.submit_sealed(&mut chain, &outbox.sealed[0], 1_200),
                Some(ImportResult::Success)
            );
            assert_eq!(chain.number(), 1);
        }
    }

    #[test]
    fn empty_submission_resets_round() {
        let mut engine = engine(StaticNodeList::default());
        engine.start_sealing(0, 0);
        engine.generate_seal(chain::types::encode_block(&BlockHeader { number: 1, ..Default::default() }, &[]));
        engine.tick(1_000);
        assert!(!engine.should_seal());

        let mut chain = chain::tracker::ChainTracker::new(BlockHeader::default());
        let empty = SealedBlock { block: Vec::new(), ours: false };
        assert_eq!(engine.submit_sealed(&mut chain, &empty, 2_000), None);
        assert!(engine.should_seal());
        assert_eq!(engine.qpos().last_consensus_time(), 2_000);
    }
}
