use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alloy_primitives::{B256, U256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::EVENT_CHANNEL_CAP;
use crate::eth::{Asking, EthStatus, HeaderStart};
use crate::types::{short_id, NodeId};

/// Events pushed by the transport into the node's event loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// A session finished its status exchange. `commands` is the transport's
    /// inbox for this peer.
    Connected {
        node_id: NodeId,
        client_id: String,
        status: EthStatus,
        commands: mpsc::Sender<PeerCommand>,
    },
    Disconnected {
        node_id: NodeId,
        reason: String,
    },
    BlockHeaders {
        node_id: NodeId,
        headers: Vec<Vec<u8>>,
    },
    BlockBodies {
        node_id: NodeId,
        bodies: Vec<Vec<u8>>,
    },
    NewBlock {
        node_id: NodeId,
        payload: Vec<u8>,
    },
    NewBlockHashes {
        node_id: NodeId,
        payload: Vec<u8>,
    },
    Qpos {
        node_id: NodeId,
        packet: Vec<u8>,
    },
}

impl PeerEvent {
    pub fn node_id(&self) -> &NodeId {
        match self {
            PeerEvent::Connected { node_id, .. }
            | PeerEvent::Disconnected { node_id, .. }
            | PeerEvent::BlockHeaders { node_id, .. }
            | PeerEvent::BlockBodies { node_id, .. }
            | PeerEvent::NewBlock { node_id, .. }
            | PeerEvent::NewBlockHashes { node_id, .. }
            | PeerEvent::Qpos { node_id, .. } => node_id,
        }
    }
}

/// Commands the node hands to the transport for one peer.
#[derive(Debug, Clone)]
pub enum PeerCommand {
    GetBlockHeaders {
        start: HeaderStart,
        limit: u64,
        skip: u64,
        reverse: bool,
    },
    GetBlockBodies {
        hashes: Vec<B256>,
    },
    /// Pre-encoded NewBlock payload, shared across recipients.
    NewBlock { payload: Arc<Vec<u8>> },
    /// Pre-encoded QPOS packet, shared across recipients.
    Qpos { payload: Arc<Vec<u8>> },
    Disconnect { reason: String },
}

/// Per-peer bookkeeping owned by the node loop.
#[derive(Debug)]
pub struct PeerState {
    pub client_id: String,
    pub status: EthStatus,
    /// Best hash announced, updated by new-block/new-hash gossip.
    pub latest_hash: B256,
    pub total_difficulty: U256,
    pub asking: Asking,
    pub rating: i64,
    pub known_blocks: HashSet<B256>,
    commands: mpsc::Sender<PeerCommand>,
}

impl PeerState {
    pub fn is_conversing(&self) -> bool {
        self.asking != Asking::Nothing
    }

    /// Queue a command on this peer's transport inbox without waiting.
    pub fn send(&self, node_id: &NodeId, cmd: PeerCommand) -> bool {
        match self.commands.try_send(cmd) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %short_id(node_id), "peer command channel full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Registry of connected peers. The transport feeds it through the event
/// channel; the node loop owns it and issues commands back.
pub struct PeerManager {
    node_id: NodeId,
    peers: HashMap<NodeId, PeerState>,
    banned: HashSet<NodeId>,
    event_tx: mpsc::Sender<PeerEvent>,
}

impl PeerManager {
    pub fn new(node_id: NodeId) -> (Self, mpsc::Receiver<PeerEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        let manager = PeerManager {
            node_id,
            peers: HashMap::new(),
            banned: HashSet::new(),
            event_tx,
        };
        (manager, event_rx)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Sender handed to transports so they can deliver events.
    pub fn event_sender(&self) -> mpsc::Sender<PeerEvent> {
        self.event_tx.clone()
    }

    /// Register a peer after its status exchange. Banned peers are
    /// disconnected immediately and not registered.
    pub fn on_connected(
        &mut self,
        node_id: NodeId,
        client_id: String,
        status: EthStatus,
        commands: mpsc::Sender<PeerCommand>,
    ) -> bool {
        if self.banned.contains(&node_id) {
            let _ = commands.try_send(PeerCommand::Disconnect {
                reason: "banned".to_string(),
            });
            debug!(peer = %short_id(&node_id), "rejected banned peer");
            return false;
        }
        info!(
            peer = %short_id(&node_id),
            client = %client_id,
            network_id = status.network_id,
            "peer registered"
        );
        let state = PeerState {
            client_id,
            latest_hash: status.best_hash,
            total_difficulty: status.total_difficulty,
            status,
            asking: Asking::State,
            rating: 0,
            known_blocks: HashSet::new(),
            commands,
        };
        self.peers.insert(node_id, state);
        true
    }

    pub fn on_disconnected(&mut self, node_id: &NodeId) -> Option<PeerState> {
        self.peers.remove(node_id)
    }

    pub fn peer(&self, node_id: &NodeId) -> Option<&PeerState> {
        self.peers.get(node_id)
    }

    pub fn peer_mut(&mut self, node_id: &NodeId) -> Option<&mut PeerState> {
        self.peers.get_mut(node_id)
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut PeerState)> {
        self.peers.iter_mut()
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_banned(&self, node_id: &NodeId) -> bool {
        self.banned.contains(node_id)
    }

    pub fn send_command(&self, node_id: &NodeId, cmd: PeerCommand) -> bool {
        match self.peers.get(node_id) {
            Some(peer) => peer.send(node_id, cmd),
            None => false,
        }
    }

    /// Send to every listed peer that is connected. Returns how many accepted.
    pub fn multicast(&self, node_ids: &[NodeId], cmd: PeerCommand) -> usize {
        node_ids
            .iter()
            .filter(|id| **id != self.node_id)
            .filter(|id| self.send_command(id, cmd.clone()))
            .count()
    }

    pub fn broadcast(&self, cmd: PeerCommand) -> usize {
        self.peers
            .iter()
            .filter(|(id, peer)| peer.send(id, cmd.clone()))
            .count()
    }

    /// Ban and drop a peer. Terminal for that identity.
    pub fn disable(&mut self, node_id: &NodeId, reason: &str) {
        warn!(peer = %short_id(node_id), reason, "disabling peer");
        self.banned.insert(*node_id);
        if let Some(peer) = self.peers.remove(node_id) {
            peer.send(
                node_id,
                PeerCommand::Disconnect {
                    reason: reason.to_string(),
                },
            );
        }
    }
}
