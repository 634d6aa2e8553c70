use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("RLP error: {0}")]
    Rlp(String),
    #[error("eth error: {0}")]
    Eth(String),
    #[error("qpos packet error: {0}")]
    Qpos(String),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("peer channel closed")]
    ChannelClosed,
}
