pub mod bytes;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod eth;
pub mod peer_manager;
pub mod qpos;
pub mod rlp;
pub mod types;
