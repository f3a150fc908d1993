use crate::message::{ClusterMessage, MessageType, Payload};
use crate::ring::ConsistentHashRing;
use crate::transport::{self, Transport};
use async_trait::async_trait;
use dashmap::DashMap;
use meshos_common::{
    ClusterConfig, MeshError, NodeId, NodeInfo, NodeRole, NodeState, ResourceUsage, Result,
    VectorClock, now_millis,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Membership change notifications consumed by memory, the filesystem,
/// and the scheduler.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Joined(NodeInfo),
    Left(NodeId),
    Failed(NodeId),
}

/// Handler for one or more message types, registered before the node
/// starts serving.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Produce a reply payload, or `None` if the message is not handled.
    async fn handle(&self, message: &ClusterMessage) -> Option<Payload>;
}

/// Cluster-wide view reported by `status()`.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub node_id: NodeId,
    pub state: NodeState,
    pub role: NodeRole,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub active_nodes: usize,
    pub total_nodes: usize,
}

/// Transport and membership for one node.
///
/// Owns the listener, the roster, the hash ring, and the per-node vector
/// clock. Everything else in the system talks to peers through
/// [`ClusterNode::send_message`] and learns about membership churn from
/// the event channel.
pub struct ClusterNode {
    config: ClusterConfig,
    local_id: NodeId,
    local: RwLock<NodeInfo>,
    roster: DashMap<NodeId, NodeInfo>,
    ring: RwLock<ConsistentHashRing>,
    clock: Mutex<VectorClock>,
    transport: Transport,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    events_tx: broadcast::Sender<MembershipEvent>,
    cluster_key: RwLock<Option<u64>>,
    /// (term, leader) as last reported by the consensus engine
    consensus_view: RwLock<(u64, Option<NodeId>)>,
    cancel: CancellationToken,
}

impl ClusterNode {
    pub fn new(config: ClusterConfig) -> Self {
        let local_id = NodeId::new();
        let local = NodeInfo::new(local_id, config.bind_addr);
        let (events_tx, _) = broadcast::channel(256);

        let roster = DashMap::new();
        roster.insert(local_id, local.clone());

        Self {
            transport: Transport::new(config.rpc_timeout()),
            ring: RwLock::new(ConsistentHashRing::new(config.virtual_nodes)),
            local: RwLock::new(local),
            clock: Mutex::new(VectorClock::new()),
            handlers: RwLock::new(HashMap::new()),
            cluster_key: RwLock::new(None),
            consensus_view: RwLock::new((0, None)),
            cancel: CancellationToken::new(),
            events_tx,
            roster,
            local_id,
            config,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn local_info(&self) -> NodeInfo {
        self.local.read().clone()
    }

    /// Address the node is actually listening on (set once started).
    pub fn addr(&self) -> SocketAddr {
        self.local.read().address
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Register a handler for a message type. Later registrations for the
    /// same type replace earlier ones; the table is expected to be frozen
    /// before `start`.
    pub fn register_handler(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().insert(kind, handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events_tx.subscribe()
    }

    /// All nodes currently considered Active, including the local one.
    pub fn active_nodes(&self) -> Vec<NodeInfo> {
        self.roster
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every known node regardless of state, including the local one.
    pub fn all_nodes(&self) -> Vec<NodeInfo> {
        self.roster.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Active peers, excluding the local node.
    pub fn active_peers(&self) -> Vec<NodeId> {
        self.roster
            .iter()
            .filter(|entry| entry.value().is_active() && *entry.key() != self.local_id)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn node_info(&self, node: NodeId) -> Option<NodeInfo> {
        self.roster.get(&node).map(|entry| entry.value().clone())
    }

    /// Node owning a key on the hash ring.
    pub fn node_for(&self, key: &str) -> Option<NodeId> {
        self.ring.read().get_node(key)
    }

    /// First `count` distinct owners of a key, for replica placement.
    pub fn nodes_for(&self, key: &str, count: usize) -> Vec<NodeId> {
        self.ring.read().get_nodes(key, count)
    }

    /// Snapshot of the local vector clock.
    pub fn clock_snapshot(&self) -> VectorClock {
        self.clock.lock().clone()
    }

    /// Tick the local clock and return the new snapshot. Every locally
    /// originated event goes through this.
    pub fn tick_clock(&self) -> VectorClock {
        let mut clock = self.clock.lock();
        clock.tick(self.local_id);
        clock.clone()
    }

    /// Record a remote clock: pointwise max plus a local tick.
    pub fn observe_clock(&self, other: &VectorClock) {
        self.clock.lock().observe(self.local_id, other);
    }

    pub fn update_local_usage(&self, usage: ResourceUsage) {
        self.local.write().usage = usage;
        if let Some(mut entry) = self.roster.get_mut(&self.local_id) {
            entry.usage = usage;
        }
    }

    /// Called by the consensus engine when the local role changes.
    pub fn set_local_role(&self, role: NodeRole) {
        self.local.write().role = role;
        if let Some(mut entry) = self.roster.get_mut(&self.local_id) {
            entry.role = role;
        }
    }

    /// Called by the consensus engine when term or leader change.
    pub fn set_consensus_view(&self, term: u64, leader: Option<NodeId>) {
        *self.consensus_view.write() = (term, leader);
    }

    pub fn consensus_view(&self) -> (u64, Option<NodeId>) {
        *self.consensus_view.read()
    }

    pub fn status(&self) -> ClusterStatus {
        let local = self.local.read();
        let (term, leader) = *self.consensus_view.read();
        ClusterStatus {
            node_id: self.local_id,
            state: local.state,
            role: local.role,
            term,
            leader,
            active_nodes: self.active_nodes().len(),
            total_nodes: self.roster.len(),
        }
    }

    /// Bind the listener and start the accept and discovery loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        {
            self.local.write().address = addr;
            if let Some(mut entry) = self.roster.get_mut(&self.local_id) {
                entry.address = addr;
            }
        }
        info!("node {} listening on {addr}", self.local_id);

        let node = self.clone();
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = node.cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            // Connections beyond the bound are refused rather
                            // than queued.
                            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                                warn!("connection limit reached, refusing peer");
                                continue;
                            };
                            let node = node.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                node.receive_loop(stream).await;
                            });
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
            }
        });

        let node = self.clone();
        tokio::spawn(async move {
            node.discovery_loop().await;
        });

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Create a new cluster and become its sole Active member.
    pub fn create_cluster(&self, name: &str) -> Result<()> {
        let key = xxh3_64(name.as_bytes());
        *self.cluster_key.write() = Some(key);
        self.set_local_state(NodeState::Active);
        self.ring.write().add_node(self.local_id);
        info!("created cluster '{name}' as {}", self.local_id);
        Ok(())
    }

    /// Join an existing cluster through a known member.
    ///
    /// Returns the (term, leader) carried by the roster snapshot so the
    /// consensus engine can adopt them.
    pub async fn join_cluster(
        self: &Arc<Self>,
        name: &str,
        seed: SocketAddr,
    ) -> Result<(u64, Option<NodeId>)> {
        let key = xxh3_64(name.as_bytes());
        self.set_local_state(NodeState::Joining);

        let request = ClusterMessage::new(
            self.local_id,
            None,
            self.tick_clock(),
            Payload::JoinRequest {
                node: self.local_info(),
                cluster_key: key,
            },
        );
        let reply = self.transport.request_addr(seed, &request).await?;
        self.observe_clock(&reply.clock);

        match reply.payload {
            Payload::JoinAccepted {
                roster,
                leader,
                term,
            } => {
                *self.cluster_key.write() = Some(key);
                {
                    let mut ring = self.ring.write();
                    ring.add_node(self.local_id);
                    for info in &roster {
                        if info.id != self.local_id {
                            ring.add_node(info.id);
                        }
                    }
                }
                for info in roster {
                    if info.id != self.local_id {
                        let _ = self.events_tx.send(MembershipEvent::Joined(info.clone()));
                        self.roster.insert(info.id, info);
                    }
                }
                self.set_local_state(NodeState::Active);
                info!(
                    "joined cluster '{name}' via {seed}, {} known nodes",
                    self.roster.len()
                );

                // Announce ourselves to every member so their rosters and
                // rings pick us up without waiting for gossip.
                let hello = Payload::Hello {
                    node: self.local_info(),
                    cluster_key: key,
                };
                for peer in self.active_peers() {
                    let node = self.clone();
                    let hello = hello.clone();
                    tokio::spawn(async move {
                        node.send_message(peer, hello).await;
                    });
                }

                Ok((term, leader))
            }
            Payload::Ack { detail, .. } => Err(MeshError::Cluster(
                detail.unwrap_or_else(|| "join rejected".into()),
            )),
            other => Err(MeshError::Protocol(format!(
                "unexpected join reply: {:?}",
                other.kind()
            ))),
        }
    }

    /// Announce departure and stop participating.
    pub async fn leave_cluster(self: &Arc<Self>) {
        self.set_local_state(NodeState::Leaving);
        self.broadcast(Payload::LeaveNotice {
            node: self.local_id,
        });
        // Give the notices a moment to go out before the loops stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.set_local_state(NodeState::Disconnected);
    }

    /// Send a payload to a peer and wait for its reply.
    ///
    /// Returns `None` on any transport error or timeout. `None` means the
    /// outcome is unknown — the remote side may still have applied the
    /// effect — so callers must retry idempotently or leave the state
    /// unresolved, never assume failure.
    pub async fn send_message(&self, dest: NodeId, payload: Payload) -> Option<Payload> {
        let addr = match self.roster.get(&dest) {
            Some(entry) => entry.value().address,
            None => {
                debug!("send to unknown node {dest}");
                return None;
            }
        };

        let message = ClusterMessage::new(self.local_id, Some(dest), self.tick_clock(), payload);
        match self.transport.request(dest, addr, &message).await {
            Ok(reply) => {
                self.observe_clock(&reply.clock);
                if let Some(mut entry) = self.roster.get_mut(&dest) {
                    entry.mark_seen();
                }
                Some(reply.payload)
            }
            Err(e) => {
                debug!("rpc to {dest} failed: {e}");
                None
            }
        }
    }

    /// Fire-and-forget a payload to every active peer.
    pub fn broadcast(self: &Arc<Self>, payload: Payload) {
        for peer in self.active_peers() {
            let node = self.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                node.send_message(peer, payload).await;
            });
        }
    }

    fn set_local_state(&self, state: NodeState) {
        self.local.write().state = state;
        if let Some(mut entry) = self.roster.get_mut(&self.local_id) {
            entry.state = state;
        }
    }

    fn update_peer(&self, info: NodeInfo) {
        if info.id == self.local_id {
            return;
        }
        let is_new = !self.roster.contains_key(&info.id);
        self.ring.write().add_node(info.id);
        if is_new {
            let _ = self.events_tx.send(MembershipEvent::Joined(info.clone()));
        }
        self.roster.insert(info.id, info);
    }

    fn remove_peer(&self, node: NodeId) {
        if self.roster.remove(&node).is_some() {
            self.ring.write().remove_node(&node);
            self.transport.disconnect(&node);
            let _ = self.events_tx.send(MembershipEvent::Left(node));
            info!("node {node} left the cluster");
        }
    }

    /// Mark a peer Failed, drop it from the ring, and notify subscribers.
    /// Returns true if the peer was not already Failed.
    fn mark_failed(&self, node: NodeId) -> bool {
        if node == self.local_id {
            return false;
        }
        let newly_failed = match self.roster.get_mut(&node) {
            Some(mut entry) => {
                let was = entry.state;
                entry.state = NodeState::Failed;
                was != NodeState::Failed
            }
            None => false,
        };
        if !newly_failed {
            return false;
        }

        warn!("node {node} declared failed");
        self.ring.write().remove_node(&node);
        self.transport.disconnect(&node);
        let _ = self.events_tx.send(MembershipEvent::Failed(node));
        true
    }

    /// Periodic discovery: ping peers, declare the silent ones failed.
    async fn discovery_loop(self: Arc<Self>) {
        let period = Duration::from_millis(self.config.discovery_interval_ms);
        let failure_timeout = self.config.node_failure_timeout_ms;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = now_millis();
            let peers: Vec<NodeInfo> = self
                .roster
                .iter()
                .filter(|entry| *entry.key() != self.local_id)
                .map(|entry| entry.value().clone())
                .collect();

            for peer in peers {
                let silent_for = now.saturating_sub(peer.last_seen);
                match peer.state {
                    NodeState::Active | NodeState::Joining | NodeState::Syncing
                        if silent_for > failure_timeout =>
                    {
                        if self.mark_failed(peer.id) {
                            self.broadcast(Payload::NodeFailed { node: peer.id });
                        }
                    }
                    NodeState::Active => {
                        let node = self.clone();
                        tokio::spawn(async move {
                            if let Some(Payload::Pong { node: info }) =
                                node.send_message(peer.id, Payload::Ping).await
                            {
                                if let Some(mut entry) = node.roster.get_mut(&info.id) {
                                    entry.usage = info.usage;
                                    entry.role = info.role;
                                    entry.mark_seen();
                                }
                            }
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut stream: TcpStream) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                framed = transport::read_frame(&mut stream) => match framed {
                    Ok(message) => message,
                    Err(_) => break, // peer closed or sent garbage
                }
            };

            trace!(
                "recv {:?} from {}",
                message.kind(),
                message.source
            );
            if let Some(reply) = self.process_message(&message).await {
                let reply = ClusterMessage::new(
                    self.local_id,
                    Some(message.source),
                    self.tick_clock(),
                    reply,
                );
                if transport::write_frame(&mut stream, &reply).await.is_err() {
                    break;
                }
            }
        }
    }

    async fn process_message(&self, message: &ClusterMessage) -> Option<Payload> {
        self.observe_clock(&message.clock);
        if let Some(mut entry) = self.roster.get_mut(&message.source) {
            entry.mark_seen();
        }

        match &message.payload {
            Payload::Ping => Some(Payload::Pong {
                node: self.local_info(),
            }),
            Payload::Hello { node, cluster_key } => {
                if !self.cluster_key_matches(*cluster_key) {
                    return Some(Payload::nack("cluster key mismatch"));
                }
                self.update_peer(node.clone());
                Some(Payload::ack())
            }
            Payload::Info { node } => {
                self.update_peer(node.clone());
                Some(Payload::ack())
            }
            Payload::JoinRequest { node, cluster_key } => {
                if !self.cluster_key_matches(*cluster_key) {
                    warn!("rejecting join from {}: wrong cluster key", node.id);
                    return Some(Payload::nack("cluster key mismatch"));
                }
                let mut info = node.clone();
                info.state = NodeState::Active;
                info.mark_seen();
                self.update_peer(info);

                let (term, leader) = self.consensus_view();
                Some(Payload::JoinAccepted {
                    roster: self.roster.iter().map(|e| e.value().clone()).collect(),
                    leader,
                    term,
                })
            }
            Payload::LeaveNotice { node } => {
                self.remove_peer(*node);
                Some(Payload::ack())
            }
            Payload::NodeFailed { node } => {
                self.mark_failed(*node);
                Some(Payload::ack())
            }
            Payload::StateUpdate { usage, .. } => {
                if let Some(mut entry) = self.roster.get_mut(&message.source) {
                    entry.usage = *usage;
                    entry.mark_seen();
                }
                // Also routed to subsystems (the memory manager records
                // free-memory reports).
                match self.dispatch(message).await {
                    Some(reply) => Some(reply),
                    None => Some(Payload::ack()),
                }
            }
            _ => self.dispatch(message).await,
        }
    }

    async fn dispatch(&self, message: &ClusterMessage) -> Option<Payload> {
        let handler = {
            let handlers = self.handlers.read();
            handlers.get(&message.kind()).cloned()
        };
        match handler {
            Some(handler) => handler.handle(message).await,
            None => {
                debug!("no handler for {:?}, dropping", message.kind());
                None
            }
        }
    }

    fn cluster_key_matches(&self, key: u64) -> bool {
        match *self.cluster_key.read() {
            Some(local) => local == key,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_cluster_activates_the_local_node() {
        let node = ClusterNode::new(ClusterConfig::default());
        node.create_cluster("demo").unwrap();

        let status = node.status();
        assert_eq!(status.state, NodeState::Active);
        assert_eq!(status.active_nodes, 1);
        assert_eq!(status.total_nodes, 1);
        assert_eq!(node.node_for("anything"), Some(node.local_id()));
    }

    #[test]
    fn clock_ticks_on_every_local_event() {
        let node = ClusterNode::new(ClusterConfig::default());
        let before = node.clock_snapshot().get(node.local_id());
        node.tick_clock();
        node.tick_clock();
        assert_eq!(node.clock_snapshot().get(node.local_id()), before + 2);
    }
}
