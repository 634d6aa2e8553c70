use std::collections::{BTreeMap, BTreeSet};

use alloy_primitives::B256;
use chain::types::SealEntry;
use devp2p::types::{NodeId, Signature};

use crate::miners::MinerSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// No proposal in flight; a leader may start one.
    Initial,
    /// Proposal sent, collecting acks.
    WaitingVote,
    /// Committed, waiting for the import to reset the round.
    Finished,
}

/// Tallies for the proposal currently in flight.
#[derive(Debug, Clone)]
pub struct Round {
    pub state: RoundState,
    /// Raw proposed block.
    pub block: Vec<u8>,
    pub number: u64,
    /// Pre-seal hash every vote signs.
    pub seal_hash: B256,
    /// Milliseconds after which the round is abandoned.
    pub deadline: u64,
    votes_for: BTreeMap<NodeId, Signature>,
    votes_against: BTreeSet<NodeId>,
}

impl Default for Round {
    fn default() -> Self {
        Round {
            state: RoundState::Finished,
            block: Vec::new(),
            number: 0,
            seal_hash: B256::ZERO,
            deadline: 0,
            votes_for: BTreeMap::new(),
            votes_against: BTreeSet::new(),
        }
    }
}

impl Round {
    pub fn reset(&mut self) {
        *self = Round {
            state: RoundState::Initial,
            ..Round::default()
        };
    }

    /// Replace the tallies with a fresh proposal. The state is left alone.
    pub fn open(&mut self, block: Vec<u8>, number: u64, seal_hash: B256, deadline: u64) {
        self.block = block;
        self.number = number;
        self.seal_hash = seal_hash;
        self.deadline = deadline;
        self.votes_for.clear();
        self.votes_against.clear();
    }

    /// First verdict per voter wins.
    pub fn record(&mut self, voter: NodeId, vote: bool, signature: Signature) -> bool {
        if self.has_voted(&voter) {
            return false;
        }
        if vote {
            self.votes_for.insert(voter, signature);
        } else {
            self.votes_against.insert(voter);
        }
        true
    }

    pub fn has_voted(&self, voter: &NodeId) -> bool {
        self.votes_for.contains_key(voter) || self.votes_against.contains(voter)
    }

    pub fn votes_for(&self) -> usize {
        self.votes_for.len()
    }

    pub fn votes_against(&self) -> usize {
        self.votes_against.len()
    }

    /// `(index, signature)` for every supporting miner, indexed by its
    /// position in the sorted committee.
    pub fn signature_list(&self, miners: &MinerSet) -> Vec<SealEntry> {
        miners
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| self.votes_for.get(id).map(|sig| (idx as u64, *sig)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_round_is_finished_until_reset() {
        let mut round = Round::default();
        assert_eq!(round.state, RoundState::Finished);
        round.reset();
        assert_eq!(round.state, RoundState::Initial);
    }

    #[test]
    fn first_verdict_wins() {
        let mut round = Round::default();
        assert!(round.record([1; 64], true, [1; 65]));
        assert!(!round.record([1; 64], false, [0; 65]));
        assert!(round.record([2; 64], false, [0; 65]));
        assert!(!round.record([2; 64], true, [2; 65]));
        assert_eq!((round.votes_for(), round.votes_against()), (1, 1));
    }

    #[test]
    fn open_clears_tallies_but_keeps_state() {
        let mut round = Round::default();
        round.reset();
        round.state = RoundState::WaitingVote;
        round.record([1; 64], true, [1; 65]);
        round.open(vec![0xc0], 4, B256::repeat_byte(4), 99);
        assert_eq!(round.votes_for(), 0);
        assert_eq!(round.state, RoundState::WaitingVote);
        assert_eq!(round.number, 4);
    }

    #[test]
    fn signature_indices_follow_sorted_committee() {
        let miners = MinerSet::new([[9; 64], [1; 64], [5; 64]]);
        let mut round = Round::default();
        round.record([9; 64], true, [9; 65]);
        round.record([1; 64], true, [1; 65]);
        round.record([5; 64], false, [0; 65]);
        assert_eq!(round.signature_list(&miners), vec![(0, [1; 65]), (2, [9; 65])]);
    }
}
