//! QPOS: leader election by view-numbered bids, per-block quorum voting and
//! certification of committed blocks by their signature lists.

pub mod certify;
pub mod engine;
pub mod miners;
pub mod quorum;
pub mod round;
pub mod seal;
pub mod signer;

use thiserror::Error;

pub use certify::BlockCertifier;
pub use engine::{Outbound, Outbox, Qpos, QposTimings, SealedBlock};
pub use miners::{MinerResolver, MinerSet, NodeListOracle, NodeRecord, SharedPeers, StaticNodeList};
pub use round::RoundState;
pub use seal::{QposSealEngine, SealEngine};
pub use signer::{K256Signer, Signer};

#[derive(Debug, Error)]
pub enum QposError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("bad packet: {0}")]
    BadPacket(String),
    #[error("signature error: {0}")]
    Signature(String),
}

impl From<devp2p::error::Error> for QposError {
    fn from(e: devp2p::error::Error) -> Self {
        QposError::BadPacket(e.to_string())
    }
}

impl From<chain::decode::DecodeError> for QposError {
    fn from(e: chain::decode::DecodeError) -> Self {
        QposError::Decode(e.to_string())
    }
}
