use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::U256;
use chain::oracle::{ImportOracle, ImportResult};
use chain::tracker::ChainTracker;
use chain::types::{encode_block, BlockHeader};
use consensus::engine::split_header;
use consensus::{
    BlockCertifier, K256Signer, MinerResolver, Outbound, Qpos, QposSealEngine, QposTimings,
    SealEngine, StaticNodeList,
};
use devp2p::crypto::pubkey_to_node_id;
use devp2p::eth::{
    decode_new_block_hashes, BLOCK_BODIES_MSG_ID, BLOCK_HEADERS_MSG_ID, NEW_BLOCK_HASHES_MSG_ID,
    NEW_BLOCK_MSG_ID,
};
use devp2p::peer_manager::{PeerCommand, PeerEvent, PeerManager};
use devp2p::types::{short_id, NodeId};
use k256::ecdsa::SigningKey;
use sync::{ManagedPeer, SyncConfig, SyncManager};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;

/// Gas limit carried by the genesis header and inherited by every block.
const GENESIS_GAS_LIMIT: u64 = 8_000_000;

/// Main node orchestrator. Owns the event loop and the timers.
pub struct Node {
    config: RuntimeConfig,
}

impl Node {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Run the node: load identity and miners, start sealing, enter main loop.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("starting qpos-node");

        let nodekey_path = self.config.datadir.join("nodekey");
        let key = load_or_generate_nodekey(&nodekey_path)?;

        let nodes = match &self.config.miners_file {
            Some(path) => {
                let json = std::fs::read_to_string(path)?;
                let list = StaticNodeList::from_json(&json)?;
                info!(path = %path.display(), entries = list.records().len(), "loaded node list");
                list
            }
            None => StaticNodeList::default(),
        };

        let (mut state, mut peer_rx) = NodeState::new(&self.config, key, nodes);
        state.start(now_ms());

        info!(
            node_id = %hex::encode(state.peers.node_id()),
            network_id = self.config.network_id,
            genesis = %state.chain.genesis_hash(),
            "node is running (Ctrl+C to stop)"
        );

        let mut tick_timer = interval(Duration::from_millis(self.config.tick_ms));
        tick_timer.tick().await; // skip first immediate tick

        // Main event loop
        loop {
            tokio::select! {
                Some(event) = peer_rx.recv() => {
                    state.on_peer_event(event, now_ms());
                }
                _ = tick_timer.tick() => {
                    state.on_tick(now_ms());
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        let status = state.sync.status(&state.chain);
        info!(
            head = status.current_block_number,
            highest = status.highest_block_number,
            "node stopped"
        );
        Ok(())
    }
}

/// Everything the event loop mutates. Handlers take `now` in milliseconds.
pub struct NodeState {
    chain: ChainTracker,
    peers: PeerManager,
    sync: SyncManager,
    engine: QposSealEngine<K256Signer, StaticNodeList>,
}

impl NodeState {
    pub fn new(
        config: &RuntimeConfig,
        key: SigningKey,
        nodes: StaticNodeList,
    ) -> (Self, mpsc::Receiver<PeerEvent>) {
        let node_id = pubkey_to_node_id(&key);
        let resolver = MinerResolver::new(node_id)
            .with_ex_nodes(config.ex_nodes.clone())
            .with_exnodes_me(config.exnodes_me)
            .with_exnodes_anyone(config.exnodes_anyone);

        let signer = K256Signer::new(key);
        let engine = QposSealEngine::new(
            Qpos::new(signer, QposTimings::default()),
            resolver.clone(),
            nodes.clone(),
        );

        let mut chain = ChainTracker::new(genesis_header());
        let certifier = BlockCertifier::new(resolver, nodes).with_peers(engine.committee_peers());
        chain.set_seal_verifier(Box::new(certifier));

        let (peers, peer_rx) = PeerManager::new(node_id);
        let sync = SyncManager::new(
            SyncConfig {
                network_id: config.network_id,
                client_blacklist: config.client_blacklist.clone(),
                ..SyncConfig::default()
            },
            chain.genesis_hash(),
        );

        (
            NodeState {
                chain,
                peers,
                sync,
                engine,
            },
            peer_rx,
        )
    }

    /// Resolve the committee and start sealing on the current head.
    pub fn start(&mut self, now: u64) {
        for ex in self.engine.resolver().ex_nodes() {
            info!(peer = %short_id(ex), "required peer");
        }
        self.engine.start_sealing(self.chain.number(), now);
        self.flush(now);
    }

    pub fn on_peer_event(&mut self, event: PeerEvent, now: u64) {
        let imported = match event {
            PeerEvent::Connected {
                node_id,
                client_id,
                status,
                commands,
            } => {
                if !self.peers.on_connected(node_id, client_id, status, commands) {
                    return;
                }
                self.engine.set_connected(self.peers.peer_ids());
                self.with_peer(&node_id, |sync, chain, peer| sync.on_peer_status(chain, peer))
            }
            PeerEvent::Disconnected { node_id, reason } => {
                debug!(peer = %short_id(&node_id), reason = %reason, peers = self.peers.peer_count(), "peer disconnected");
                self.peers.on_disconnected(&node_id);
                self.engine.set_connected(self.peers.peer_ids());
                Vec::new()
            }
            PeerEvent::BlockHeaders { node_id, headers } => {
                if !self.engine.accepts_eth_packet(&node_id, BLOCK_HEADERS_MSG_ID) {
                    return;
                }
                debug!(peer = %short_id(&node_id), count = headers.len(), "received block headers");
                self.with_peer(&node_id, |sync, chain, peer| sync.on_block_headers(chain, peer, &headers))
            }
            PeerEvent::BlockBodies { node_id, bodies } => {
                if !self.engine.accepts_eth_packet(&node_id, BLOCK_BODIES_MSG_ID) {
                    return;
                }
                debug!(peer = %short_id(&node_id), count = bodies.len(), "received block bodies");
                self.with_peer(&node_id, |sync, chain, peer| sync.on_block_bodies(chain, peer, &bodies))
            }
            PeerEvent::NewBlock { node_id, payload } => {
                if !self.engine.accepts_eth_packet(&node_id, NEW_BLOCK_MSG_ID) {
                    return;
                }
                self.with_peer(&node_id, |sync, chain, peer| sync.on_new_block(chain, peer, &payload))
            }
            PeerEvent::NewBlockHashes { node_id, payload } => {
                if !self.engine.accepts_eth_packet(&node_id, NEW_BLOCK_HASHES_MSG_ID) {
                    return;
                }
                let hashes = match decode_new_block_hashes(&payload) {
                    Ok(h) => h,
                    Err(e) => {
                        debug!(peer = %short_id(&node_id), err = %e, "undecodable block hashes");
                        return;
                    }
                };
                self.with_peer(&node_id, |sync, chain, peer| {
                    sync.on_new_hashes(&*chain, peer, &hashes);
                    Vec::new()
                })
            }
            PeerEvent::Qpos { node_id, packet } => {
                self.engine.on_packet(node_id, &packet, now);
                Vec::new()
            }
        };
        self.on_imported(&imported, now);
        self.flush(now);
    }

    pub fn on_tick(&mut self, now: u64) {
        if self.engine.should_seal() && self.engine.qpos().queued_candidates() == 0 {
            let parent = self.chain.head();
            let mut header = BlockHeader {
                timestamp: (now / 1000).max(parent.timestamp),
                ..Default::default()
            };
            self.engine.populate_from_parent(&mut header, &parent);
            self.engine.generate_seal(encode_block(&header, &[]));
        }
        self.engine.tick(now);
        self.flush(now);
    }

    /// Run a sync handler against one registered peer, then apply any
    /// disable it asked for.
    fn with_peer<F>(&mut self, id: &NodeId, f: F) -> Vec<BlockHeader>
    where
        F: FnOnce(&mut SyncManager, &mut ChainTracker, &mut ManagedPeer<'_>) -> Vec<BlockHeader>,
    {
        let Some(mut peer) = ManagedPeer::lookup(&mut self.peers, id) else {
            debug!(peer = %short_id(id), "event from unregistered peer");
            return Vec::new();
        };
        let imported = f(&mut self.sync, &mut self.chain, &mut peer);
        let disabled = peer.take_disabled();
        if let Some(reason) = disabled {
            self.peers.disable(id, &reason);
            self.engine.set_connected(self.peers.peer_ids());
        }
        imported
    }

    /// Blocks landed in the chain: settle sync, report the new height to
    /// consensus and let every peer be queried again.
    fn on_imported(&mut self, headers: &[BlockHeader], now: u64) {
        let Some(highest) = headers.iter().map(|h| h.number).max() else {
            return;
        };
        for header in headers {
            self.sync.on_block_imported(header);
        }
        self.engine.on_block_imported(highest, now);

        let mut peers: Vec<ManagedPeer<'_>> = self
            .peers
            .peers_mut()
            .map(|(id, state)| ManagedPeer::new(*id, state, false))
            .collect();
        self.sync.on_room_available(&self.chain, peers.iter_mut());
    }

    /// Deliver what consensus produced: packets to the transport, committed
    /// blocks to the chain.
    fn flush(&mut self, now: u64) {
        let outbox = self.engine.drain();
        for message in outbox.messages {
            match message {
                Outbound::Send { to, packet } => {
                    let payload = Arc::new(packet.encode());
                    self.peers.send_command(&to, PeerCommand::Qpos { payload });
                }
                Outbound::Multicast { to, packet } => {
                    let payload = Arc::new(packet.encode());
                    let sent = self.peers.multicast(&to, PeerCommand::Qpos { payload });
                    debug!(packet = packet.name(), miners = to.len(), sent, "multicast");
                }
                Outbound::Broadcast { packet } => {
                    let payload = Arc::new(packet.encode());
                    let sent = self.peers.broadcast(PeerCommand::Qpos { payload });
                    debug!(packet = packet.name(), sent, "broadcast");
                }
            }
        }

        let mut imported = Vec::new();
        for sealed in outbox.sealed {
            if self.engine.submit_sealed(&mut self.chain, &sealed, now) != Some(ImportResult::Success) {
                continue;
            }
            match split_header(&sealed.block) {
                Ok((header, _)) => {
                    info!(number = header.number, ours = sealed.ours, "sealed block imported");
                    imported.push(header);
                }
                Err(e) => warn!(err = %e, "imported block without a readable header"),
            }
        }
        self.on_imported(&imported, now);
    }
}

/// Deterministic genesis shared by every node of a network.
pub fn genesis_header() -> BlockHeader {
    BlockHeader {
        gas_limit: GENESIS_GAS_LIMIT,
        difficulty: U256::from(1u64),
        extra_data: b"qpos genesis".to_vec(),
        ..Default::default()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn load_or_generate_nodekey(path: &Path) -> Result<SigningKey, Box<dyn std::error::Error>> {
    if path.exists() {
        let hex_str = std::fs::read_to_string(path)?.trim().to_string();
        let bytes = hex::decode(&hex_str)?;
        if bytes.len() != 32 {
            return Err(format!("nodekey must be 32 bytes, got {}", bytes.len()).into());
        }
        let key = SigningKey::from_slice(&bytes)?;
        info!(path = %path.display(), "loaded existing node key");
        Ok(key)
    } else {
        let key = SigningKey::random(&mut rand::thread_rng());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(key.to_bytes().as_slice()))?;
        info!(path = %path.display(), node_id = %short_id(&pubkey_to_node_id(&key)), "generated new node key");
        Ok(key)
    }
}
