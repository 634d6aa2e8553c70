pub const CLIENT_ID: &str = "qpos-node/v0.1.0";

/// eth protocol version spoken by this node.
pub const PROTOCOL_VERSION: u32 = 63;
/// Previous protocol version still accepted at handshake.
pub const OLD_PROTOCOL_VERSION: u32 = 62;

pub const NODE_ID_LEN: usize = 64;
pub const SIGNATURE_LEN: usize = 65;

/// Capacity of the registry -> node event channel.
pub const EVENT_CHANNEL_CAP: usize = 256;
/// Capacity of each per-peer command channel.
pub const COMMAND_CHANNEL_CAP: usize = 64;
