use alloy_primitives::{B256, U256};
use devp2p::eth::{Asking, EthStatus, HeaderStart};
use devp2p::peer_manager::{PeerCommand, PeerManager, PeerState};
use devp2p::types::NodeId;

/// What the sync controller needs from one connected peer.
pub trait SyncPeer {
    fn id(&self) -> NodeId;

    /// Status announced in the handshake.
    fn status(&self) -> &EthStatus;

    fn client_id(&self) -> &str;

    fn asking(&self) -> Asking;

    fn is_conversing(&self) -> bool {
        self.asking() != Asking::Nothing
    }

    /// Whether the identity was banned for earlier misbehaviour.
    fn is_banned(&self) -> bool;

    fn total_difficulty(&self) -> U256;

    fn latest_hash(&self) -> B256;

    fn set_latest_hash(&mut self, hash: B256);

    fn mark_known(&mut self, hash: B256);

    fn add_rating(&mut self, delta: i64);

    /// Nothing outstanding any more.
    fn set_idle(&mut self);

    fn request_block_headers(&mut self, start: HeaderStart, count: u64, skip: u64, reverse: bool);

    fn request_block_bodies(&mut self, hashes: Vec<B256>);

    /// Terminal for this peer.
    fn disable(&mut self, reason: &str);
}

/// A registered peer borrowed out of the [`PeerManager`] for one handler call.
///
/// Disabling is deferred: the reason is kept until the caller hands it back
/// to the registry with [`ManagedPeer::take_disabled`].
pub struct ManagedPeer<'a> {
    id: NodeId,
    state: &'a mut PeerState,
    banned: bool,
    disabled: Option<String>,
}

impl<'a> ManagedPeer<'a> {
    pub fn new(id: NodeId, state: &'a mut PeerState, banned: bool) -> Self {
        Self {
            id,
            state,
            banned,
            disabled: None,
        }
    }

    pub fn lookup(manager: &'a mut PeerManager, id: &NodeId) -> Option<Self> {
        let banned = manager.is_banned(id);
        manager
            .peer_mut(id)
            .map(|state| ManagedPeer::new(*id, state, banned))
    }

    pub fn take_disabled(&mut self) -> Option<String> {
        self.disabled.take()
    }

    /// A disabled peer is sent nothing and stays idle.
    fn request(&mut self, asking: Asking, cmd: PeerCommand) {
        if self.disabled.is_none() {
            self.state.asking = asking;
            self.state.send(&self.id, cmd);
        }
    }
}

impl SyncPeer for ManagedPeer<'_> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn status(&self) -> &EthStatus {
        &self.state.status
    }

    fn client_id(&self) -> &str {
        &self.state.client_id
    }

    fn asking(&self) -> Asking {
        self.state.asking
    }

    fn is_banned(&self) -> bool {
        self.banned
    }

    fn total_difficulty(&self) -> U256 {
        self.state.total_difficulty
    }

    fn latest_hash(&self) -> B256 {
        self.state.latest_hash
    }

    fn set_latest_hash(&mut self, hash: B256) {
        self.state.latest_hash = hash;
    }

    fn mark_known(&mut self, hash: B256) {
        self.state.known_blocks.insert(hash);
    }

    fn add_rating(&mut self, delta: i64) {
        self.state.rating += delta;
    }

    fn set_idle(&mut self) {
        self.state.asking = Asking::Nothing;
    }

    fn request_block_headers(&mut self, start: HeaderStart, count: u64, skip: u64, reverse: bool) {
        self.request(
            Asking::BlockHeaders,
            PeerCommand::GetBlockHeaders {
                start,
                limit: count,
                skip,
                reverse,
            },
        );
    }

    fn request_block_bodies(&mut self, hashes: Vec<B256>) {
        self.request(Asking::BlockBodies, PeerCommand::GetBlockBodies { hashes });
    }

    fn disable(&mut self, reason: &str) {
        self.state.asking = Asking::Nothing;
        self.disabled.get_or_insert_with(|| reason.to_string());
    }
}
