use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use alloy_primitives::B256;
use chain::decode::{decode_block_header, hash_raw_header};
use chain::types::{seal_block, BlockHeader};
use devp2p::qpos::QposPacket;
use devp2p::rlp;
use devp2p::types::{short_id, NodeId, Signature};
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::miners::MinerSet;
use crate::quorum::{abort_reached, commit_reached, leadership_reached};
use crate::round::{Round, RoundState};
use crate::signer::{verify, Signer};
use crate::QposError;

/// Committed block hashes remembered to suppress re-delivered broadcasts.
const SEEN_BROADCASTS: usize = 64;

/// Consensus timers, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QposTimings {
    /// How long a proposal may collect acks.
    pub round_interval_ms: u64,
    /// Silence from the leader after which a follower bids for leadership.
    pub vote_timeout_ms: u64,
    /// Leader heartbeat period; also bounds the re-election jitter.
    pub heart_interval_ms: u64,
}

impl Default for QposTimings {
    fn default() -> Self {
        QposTimings {
            round_interval_ms: 20_000,
            vote_timeout_ms: 10_000,
            heart_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Send { to: NodeId, packet: QposPacket },
    /// Every listed miner except this node.
    Multicast { to: Vec<NodeId>, packet: QposPacket },
    /// Every connected peer.
    Broadcast { packet: QposPacket },
}

/// A block ready for import: committed here (`ours`) or received committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    pub block: Vec<u8>,
    pub ours: bool,
}

/// Side effects accumulated by the state machine until the owner drains them.
#[derive(Debug, Default)]
pub struct Outbox {
    pub messages: Vec<Outbound>,
    pub sealed: Vec<SealedBlock>,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.sealed.is_empty()
    }
}

/// The QPOS state machine. Single owner; time is passed in as milliseconds.
pub struct Qpos<S> {
    signer: S,
    id: NodeId,
    timings: QposTimings,
    miners: Arc<MinerSet>,
    is_leader: bool,
    view: u64,
    /// Height of the best block we know was committed.
    height: u64,
    /// Highest height claimed by a leadership bid since the last report.
    claimed_height: u64,
    reported: u64,
    round: Round,
    /// Next heartbeat (leader) or leadership bid (follower).
    vote_deadline: u64,
    leader_votes: HashSet<NodeId>,
    candidates: VecDeque<Vec<u8>>,
    seen_broadcasts: VecDeque<B256>,
    last_consensus_time: u64,
    outbox: Outbox,
}

impl<S: Signer> Qpos<S> {
    pub fn new(signer: S, timings: QposTimings) -> Self {
        let id = signer.id();
        Qpos {
            signer,
            id,
            timings,
            miners: Arc::new(MinerSet::default()),
            is_leader: false,
            view: 0,
            height: 0,
            claimed_height: 0,
            reported: 0,
            round: Round::default(),
            vote_deadline: 0,
            leader_votes: HashSet::new(),
            candidates: VecDeque::new(),
            seen_broadcasts: VecDeque::new(),
            last_consensus_time: 0,
            outbox: Outbox::default(),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn timings(&self) -> &QposTimings {
        &self.timings
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn state(&self) -> RoundState {
        self.round.state
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn miners(&self) -> &Arc<MinerSet> {
        &self.miners
    }

    pub fn miner_list(&self) -> Vec<NodeId> {
        self.miners.ids().to_vec()
    }

    pub fn node_count(&self) -> usize {
        self.miners.len()
    }

    pub fn last_consensus_time(&self) -> u64 {
        self.last_consensus_time
    }

    pub fn queued_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn set_miners(&mut self, miners: Arc<MinerSet>) {
        self.miners = miners;
    }

    pub fn drain(&mut self) -> Outbox {
        std::mem::take(&mut self.outbox)
    }

    /// A leader with no proposal in flight may seal.
    pub fn should_seal(&self) -> bool {
        self.round.state == RoundState::Initial && self.is_leader
    }

    /// Queue a candidate block; the leader proposes it on a later tick.
    pub fn propose(&mut self, block: Vec<u8>) {
        self.candidates.push_back(block);
    }

    /// A block at `number` was imported locally. Adopts it as the height,
    /// settles leadership against the current committee and resets the round.
    pub fn report_block(&mut self, number: u64, force: bool, now: u64) -> bool {
        if number <= self.reported && !force {
            trace!(number, reported = self.reported, "report ignored");
            return false;
        }
        self.reported = number;
        self.height = number;
        self.claimed_height = number;

        let alone = self.miners.is_empty() || (self.miners.len() == 1 && self.miners.contains(&self.id));
        if alone {
            self.is_leader = true;
        } else if !self.miners.contains(&self.id) && self.is_leader {
            info!(number, "no longer a miner, yielding leadership");
            self.is_leader = false;
        }
        self.reset(now);
        true
    }

    /// Abandon whatever round is in flight.
    pub fn reset(&mut self, now: u64) {
        self.round.reset();
        self.last_consensus_time = now;
        debug!(
            height = self.height,
            view = self.view,
            miners = self.miners.len(),
            leader = self.is_leader,
            "round reset"
        );
    }

    pub fn tick(&mut self, now: u64) {
        self.vote_tick(now);
        if !self.is_leader {
            return;
        }
        match self.round.state {
            RoundState::Initial => {
                let Some(block) = self.candidates.pop_front() else {
                    return;
                };
                if block.is_empty() {
                    return;
                }
                if let Err(e) = self.begin_round(block, now) {
                    warn!(err = %e, "could not start round");
                }
            }
            RoundState::WaitingVote | RoundState::Finished => {
                if now > self.round.deadline {
                    debug!(
                        number = self.round.number,
                        votes_for = self.round.votes_for(),
                        votes_against = self.round.votes_against(),
                        miners = self.miners.len(),
                        "round timed out"
                    );
                    self.reset(now);
                }
            }
        }
    }

    /// Entry point for a raw QPOS packet. Faults are logged, never returned.
    pub fn on_packet(&mut self, from: NodeId, raw: &[u8], now: u64) {
        match QposPacket::decode(raw) {
            Ok(packet) => self.on_message(from, packet, now),
            Err(e) => debug!(peer = %short_id(&from), err = %e, "undecodable qpos packet"),
        }
    }

    pub fn on_message(&mut self, from: NodeId, packet: QposPacket, now: u64) {
        let name = packet.name();
        if !self.miners.contains(&from) {
            trace!(peer = %short_id(&from), packet = name, "ignoring packet from non-miner");
            return;
        }
        trace!(peer = %short_id(&from), packet = name, view = self.view, leader = self.is_leader, "qpos packet");

        let result = match packet {
            QposPacket::BlockVote { view, signature, block } => self.on_block_vote(from, view, signature, block, now),
            QposPacket::BlockVoteAck {
                vote, view, signature, ..
            } => self.on_block_vote_ack(from, vote, view, signature, now),
            QposPacket::Heart { view } => {
                self.on_heart(from, view, now);
                Ok(())
            }
            QposPacket::Vote { view, height } => {
                self.on_vote(from, view, height, now);
                Ok(())
            }
            QposPacket::VoteAck { vote } => {
                self.on_vote_ack(from, vote);
                Ok(())
            }
            QposPacket::BroadBlock { block } => self.on_broad_block(block),
        };
        if let Err(e) = result {
            warn!(peer = %short_id(&from), packet = name, err = %e, "qpos handler failed");
        }
    }

    fn vote_tick(&mut self, now: u64) {
        if self.vote_deadline > now {
            return;
        }
        if self.is_leader {
            self.vote_deadline = now + self.timings.heart_interval_ms;
            self.multicast(QposPacket::Heart { view: self.view });
        } else {
            self.vote_deadline = now + self.timings.vote_timeout_ms;
            let Some(view) = self.view.checked_add(1) else {
                warn!(view = self.view, "view exhausted, not bidding");
                return;
            };
            self.view = view;
            self.leader_votes.clear();
            debug!(view = self.view, height = self.height, "bidding for leadership");
            self.multicast(QposPacket::Vote {
                view: self.view,
                height: self.height,
            });
        }
    }

    fn begin_round(&mut self, block: Vec<u8>, now: u64) -> Result<(), QposError> {
        let (header, _) = split_header(&block)?;
        if self.height.checked_add(1) != Some(header.number) {
            debug!(number = header.number, height = self.height, "dropping stale candidate");
            return Ok(());
        }
        let hash = header.seal_hash();
        let signature = self.signer.sign(&hash)?;
        self.round.open(block, header.number, hash, now + self.timings.round_interval_ms);
        self.round.record(self.id, true, signature);
        self.round.state = RoundState::WaitingVote;

        if self.miners.len() <= 1 {
            return self.close_round_if_decided(now);
        }
        info!(number = header.number, view = self.view, miners = self.miners.len(), "proposing block");
        self.multicast(QposPacket::BlockVote {
            view: self.view,
            signature,
            block: self.round.block.clone(),
        });
        self.vote_deadline = now + self.timings.heart_interval_ms;
        Ok(())
    }

    fn on_block_vote(
        &mut self,
        from: NodeId,
        view: u64,
        signature: Signature,
        block: Vec<u8>,
        now: u64,
    ) -> Result<(), QposError> {
        let (header, _) = split_header(&block)?;
        let hash = header.seal_hash();
        let signed = verify(&from, &signature, &hash);
        let accepted = signed && self.height.checked_add(1) == Some(header.number) && view == self.view;
        debug!(
            peer = %short_id(&from),
            number = header.number,
            height = self.height,
            view,
            our_view = self.view,
            signed,
            accepted,
            "proposal received"
        );

        if accepted {
            self.round.open(block, header.number, hash, now + self.timings.round_interval_ms);
            self.round.record(from, true, signature);
        }
        let ours = self.signer.sign(&hash)?;
        if accepted {
            self.round.record(self.id, true, ours);
        }
        self.send(
            from,
            QposPacket::BlockVoteAck {
                vote: accepted,
                view: self.view,
                signature: ours,
                target: from,
            },
        );
        self.vote_deadline = now + self.timings.vote_timeout_ms;
        Ok(())
    }

    fn on_block_vote_ack(
        &mut self,
        from: NodeId,
        vote: bool,
        view: u64,
        signature: Signature,
        now: u64,
    ) -> Result<(), QposError> {
        if self.round.state != RoundState::WaitingVote {
            trace!(peer = %short_id(&from), state = ?self.round.state, "ack outside a round");
            return Ok(());
        }
        if !verify(&from, &signature, &self.round.seal_hash) || view != self.view {
            debug!(peer = %short_id(&from), view, our_view = self.view, "ack rejected");
            return Ok(());
        }
        if !self.round.record(from, vote, signature) {
            trace!(peer = %short_id(&from), vote, "repeated verdict ignored");
            return Ok(());
        }
        debug!(
            peer = %short_id(&from),
            vote,
            votes_for = self.round.votes_for(),
            votes_against = self.round.votes_against(),
            miners = self.miners.len(),
            "ack recorded"
        );
        self.close_round_if_decided(now)
    }

    fn close_round_if_decided(&mut self, now: u64) -> Result<(), QposError> {
        let n = self.miners.len();
        if abort_reached(self.round.votes_against(), n) {
            info!(
                number = self.round.number,
                votes_against = self.round.votes_against(),
                miners = n,
                "proposal rejected"
            );
            self.reset(now);
            return Ok(());
        }
        if commit_reached(self.round.votes_for(), n) {
            let signatures = self.round.signature_list(&self.miners);
            let block = seal_block(&self.round.block, self.round.number, &signatures)?;
            info!(
                number = self.round.number,
                signatures = signatures.len(),
                miners = n,
                "proposal committed"
            );
            self.broadcast_block(block);
        }
        Ok(())
    }

    fn broadcast_block(&mut self, block: Vec<u8>) {
        if !block.is_empty() {
            if let Ok((_, hash)) = split_header(&block) {
                self.remember_broadcast(hash);
            }
            self.outbox.messages.push(Outbound::Broadcast {
                packet: QposPacket::BroadBlock { block: block.clone() },
            });
        }
        self.round.state = RoundState::Finished;
        self.outbox.sealed.push(SealedBlock { block, ours: true });
    }

    fn on_broad_block(&mut self, block: Vec<u8>) -> Result<(), QposError> {
        let (header, hash) = split_header(&block)?;
        if header.number > self.height {
            self.height = header.number;
        }
        if !self.remember_broadcast(hash) {
            trace!(number = header.number, hash = %hash, "committed block already seen");
            return Ok(());
        }
        debug!(number = header.number, hash = %hash, "committed block received");
        self.outbox.sealed.push(SealedBlock { block, ours: false });
        Ok(())
    }

    fn on_heart(&mut self, from: NodeId, view: u64, now: u64) {
        if self.is_leader && (view > self.view || (view == self.view && from > self.id)) {
            info!(peer = %short_id(&from), view, our_view = self.view, "yielding leadership");
            self.is_leader = false;
        }
        self.vote_deadline = now + self.timings.vote_timeout_ms;
    }

    fn on_vote(&mut self, from: NodeId, view: u64, height: u64, now: u64) {
        // A bid at u64::MAX would leave no view to bid with afterwards.
        let support = view > self.view && view < u64::MAX;
        if height > self.claimed_height {
            self.claimed_height = height;
        }
        if support && self.claimed_height >= self.height {
            self.view = view;
            let jitter = rand::thread_rng().gen_range(0..self.timings.heart_interval_ms.max(1));
            self.vote_deadline = now + self.timings.vote_timeout_ms + jitter;
        }
        debug!(peer = %short_id(&from), view, our_view = self.view, support, "leadership bid");
        self.send(from, QposPacket::VoteAck { vote: support });
    }

    fn on_vote_ack(&mut self, from: NodeId, vote: bool) {
        if !vote {
            return;
        }
        self.leader_votes.insert(from);
        if !self.is_leader && leadership_reached(self.leader_votes.len(), self.miners.len()) {
            info!(view = self.view, supporters = self.leader_votes.len(), "became leader");
            self.is_leader = true;
        }
    }

    fn remember_broadcast(&mut self, hash: B256) -> bool {
        if self.seen_broadcasts.contains(&hash) {
            return false;
        }
        if self.seen_broadcasts.len() == SEEN_BROADCASTS {
            self.seen_broadcasts.pop_front();
        }
        self.seen_broadcasts.push_back(hash);
        true
    }

    fn send(&mut self, to: NodeId, packet: QposPacket) {
        self.outbox.messages.push(Outbound::Send { to, packet });
    }

    fn multicast(&mut self, packet: QposPacket) {
        let to: Vec<NodeId> = self.miners.iter().filter(|id| **id != self.id).copied().collect();
        if to.is_empty() {
            return;
        }
        self.outbox.messages.push(Outbound::Multicast { to, packet });
    }
}

/// Header of a raw block and the hash of its header bytes.
pub fn split_header(block: &[u8]) -> Result<(BlockHeader, B256), QposError> {
    let parts = rlp::split_list(block)?;
    let raw = parts
        .first()
        .ok_or_else(|| QposError::Decode("block has no header".to_string()))?;
    Ok((decode_block_header(raw)?, hash_raw_header(raw)))
}
