use std::collections::BTreeSet;

use chain::oracle::SealVerifier;
use chain::types::{BlockHeader, SealEntry};
use tracing::{debug, warn};

use crate::miners::{MinerResolver, NodeListOracle, SharedPeers};
use crate::quorum::certification_threshold;
use crate::signer::verify;

/// Checks a committed block's signature list against the committee that
/// was in force at its parent.
pub struct BlockCertifier<O> {
    resolver: MinerResolver,
    oracle: O,
    peers: SharedPeers,
}

impl<O: NodeListOracle> BlockCertifier<O> {
    pub fn new(resolver: MinerResolver, oracle: O) -> Self {
        BlockCertifier {
            resolver,
            oracle,
            peers: SharedPeers::default(),
        }
    }

    /// Resolve committees with the peers the seal engine publishes, so
    /// blocks committed while every peer may mine index the same set.
    pub fn with_peers(mut self, peers: SharedPeers) -> Self {
        self.peers = peers;
        self
    }

    pub fn certify(&self, header: &BlockHeader, seal: &[SealEntry]) -> bool {
        let parent_number = header.number.saturating_sub(1);
        let miners = match self.resolver.resolve(&self.oracle, Some(parent_number), &self.peers.snapshot()) {
            Ok(miners) => miners,
            Err(e) => {
                warn!(err = %e, number = parent_number, "miner list unavailable");
                return false;
            }
        };

        let threshold = certification_threshold(miners.len());
        let hash = header.seal_hash();
        let mut counted = BTreeSet::new();
        for (idx, signature) in seal {
            let Some(miner) = usize::try_from(*idx).ok().and_then(|i| miners.get(i)) else {
                debug!(number = header.number, idx, "signature index out of range");
                continue;
            };
            if !verify(miner, signature, &hash) {
                debug!(number = header.number, idx, hash = %hash, "bad block signature");
                continue;
            }
            // One signature per miner.
            if !counted.insert(*idx) {
                continue;
            }
            if counted.len() >= threshold {
                return true;
            }
        }

        debug!(
            number = header.number,
            valid = counted.len(),
            threshold,
            miners = miners.len(),
            "block not certified"
        );
        false
    }
}

impl<O: NodeListOracle + Send> SealVerifier for BlockCertifier<O> {
    fn verify_seal(&self, header: &BlockHeader, seal: &[SealEntry]) -> bool {
        self.certify(header, seal)
    }
}
