use crate::message::{ClusterMessage, MessageType, Payload};
use crate::node::{ClusterNode, MessageHandler};
use async_trait::async_trait;
use futures::future::join_all;
use meshos_common::{NodeId, NodeRole};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ElectionState {
    term: u64,
    role: NodeRole,
    /// (term, candidate) of the vote cast in that term, if any
    voted_for: Option<(u64, NodeId)>,
    leader: Option<NodeId>,
}

/// Leader election over the cluster transport.
///
/// Follower -> Candidate -> Leader with monotonically increasing terms
/// and randomized election timeouts. There is no replicated log: the
/// engine answers "who is leader" and nothing else, and in-flight
/// leader-only operations must re-check `is_leader` before committing
/// side effects.
pub struct ConsensusEngine {
    node: Arc<ClusterNode>,
    state: Mutex<ElectionState>,
    last_heartbeat: Mutex<Instant>,
    timeout_range: (u64, u64),
    heartbeat_interval: Duration,
}

impl ConsensusEngine {
    pub fn new(node: Arc<ClusterNode>) -> Arc<Self> {
        let config = node.config();
        let timeout_range = (
            config.election_timeout_min_ms,
            config.election_timeout_max_ms,
        );
        let heartbeat_interval = config.heartbeat_interval();
        Arc::new(Self {
            state: Mutex::new(ElectionState {
                term: 0,
                role: NodeRole::Follower,
                voted_for: None,
                leader: None,
            }),
            last_heartbeat: Mutex::new(Instant::now()),
            timeout_range,
            heartbeat_interval,
            node,
        })
    }

    /// Register this engine in the node's handler table.
    pub fn register(self: &Arc<Self>) {
        let handler: Arc<dyn MessageHandler> = Arc::new(ConsensusHandler(self.clone()));
        self.node
            .register_handler(MessageType::VoteRequest, handler.clone());
        self.node
            .register_handler(MessageType::Heartbeat, handler.clone());
        self.node
            .register_handler(MessageType::AppendEntries, handler);
    }

    /// Start the election timer and the heartbeat loop.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.election_loop().await;
        });

        let engine = self.clone();
        tokio::spawn(async move {
            engine.heartbeat_loop().await;
        });
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == NodeRole::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.lock().leader
    }

    pub fn role(&self) -> NodeRole {
        self.state.lock().role
    }

    /// Bootstrap leadership when creating a single-member cluster; there
    /// is nobody to vote.
    pub fn assume_leadership(&self) {
        let term = {
            let mut state = self.state.lock();
            state.term = state.term.max(1);
            state.role = NodeRole::Leader;
            state.leader = Some(self.node.local_id());
            state.term
        };
        self.node.set_local_role(NodeRole::Leader);
        self.node
            .set_consensus_view(term, Some(self.node.local_id()));
        info!("bootstrapped as leader for term {term}");
    }

    /// Adopt the term and leader carried by a join reply.
    pub fn observe_leader(&self, term: u64, leader: Option<NodeId>) {
        let mut state = self.state.lock();
        if term >= state.term {
            state.term = term;
            state.role = NodeRole::Follower;
            state.leader = leader;
            drop(state);
            self.node.set_local_role(NodeRole::Follower);
            self.node.set_consensus_view(term, leader);
            *self.last_heartbeat.lock() = Instant::now();
        }
    }

    async fn election_loop(self: Arc<Self>) {
        let cancel = self.node.cancellation_token();
        loop {
            let timeout = {
                let (min, max) = self.timeout_range;
                Duration::from_millis(rand::thread_rng().gen_range(min..=max))
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(timeout) => {}
            }

            if self.is_leader() {
                continue;
            }
            if !self.node.local_info().is_active() {
                continue;
            }
            if self.last_heartbeat.lock().elapsed() < timeout {
                continue;
            }

            self.run_election().await;
        }
    }

    async fn run_election(self: &Arc<Self>) {
        let local_id = self.node.local_id();
        let (term, voters) = {
            let mut state = self.state.lock();
            state.term += 1;
            state.role = NodeRole::Candidate;
            state.voted_for = Some((state.term, local_id));
            state.leader = None;
            (state.term, self.node.active_peers())
        };
        self.node.set_local_role(NodeRole::Candidate);
        self.node.set_consensus_view(term, None);
        debug!("starting election for term {term}");

        let members = voters.len() + 1;
        let needed = members / 2 + 1;
        let mut votes = 1usize; // own vote

        let requests = voters.into_iter().map(|peer| {
            let node = self.node.clone();
            async move {
                node.send_message(
                    peer,
                    Payload::VoteRequest {
                        term,
                        candidate: local_id,
                    },
                )
                .await
            }
        });

        for reply in join_all(requests).await.into_iter().flatten() {
            if let Payload::VoteReply {
                term: reply_term,
                granted,
                ..
            } = reply
            {
                if reply_term > term {
                    self.step_down(reply_term);
                    return;
                }
                if granted && reply_term == term {
                    votes += 1;
                }
            }
        }

        // A heartbeat may have arrived while votes were in flight.
        {
            let state = self.state.lock();
            if state.term != term || state.role != NodeRole::Candidate {
                return;
            }
        }

        if votes >= needed {
            self.become_leader(term, votes, members);
        } else {
            debug!("election for term {term} lost ({votes}/{members} votes)");
            let mut state = self.state.lock();
            if state.term == term && state.role == NodeRole::Candidate {
                state.role = NodeRole::Follower;
                drop(state);
                self.node.set_local_role(NodeRole::Follower);
            }
        }
    }

    fn become_leader(self: &Arc<Self>, term: u64, votes: usize, members: usize) {
        {
            let mut state = self.state.lock();
            if state.term != term || state.role != NodeRole::Candidate {
                return;
            }
            state.role = NodeRole::Leader;
            state.leader = Some(self.node.local_id());
        }
        self.node.set_local_role(NodeRole::Leader);
        self.node
            .set_consensus_view(term, Some(self.node.local_id()));
        info!("won election for term {term} ({votes}/{members} votes)");
        self.send_heartbeats(term);
    }

    fn step_down(&self, term: u64) {
        let mut state = self.state.lock();
        if term > state.term {
            state.term = term;
        }
        state.role = NodeRole::Follower;
        drop(state);
        self.node.set_local_role(NodeRole::Follower);
        *self.last_heartbeat.lock() = Instant::now();
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let cancel = self.node.cancellation_token();
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.is_leader() {
                continue;
            }
            self.send_heartbeats(self.current_term());
        }
    }

    fn send_heartbeats(&self, term: u64) {
        let leader = self.node.local_id();
        for peer in self.node.active_peers() {
            let node = self.node.clone();
            tokio::spawn(async move {
                node.send_message(peer, Payload::Heartbeat { term, leader })
                    .await;
            });
        }
    }

    fn handle_vote_request(&self, term: u64, candidate: NodeId) -> Payload {
        let voter = self.node.local_id();
        let mut state = self.state.lock();

        if term > state.term {
            state.term = term;
            state.role = NodeRole::Follower;
        }

        let granted = term >= state.term
            && match state.voted_for {
                Some((voted_term, voted_candidate)) if voted_term == term => {
                    voted_candidate == candidate
                }
                _ => true,
            };

        if granted {
            state.voted_for = Some((term, candidate));
            state.role = NodeRole::Follower;
        }
        let current = state.term;
        drop(state);

        if granted {
            // Granting a vote resets our own election timer.
            *self.last_heartbeat.lock() = Instant::now();
            self.node.set_local_role(NodeRole::Follower);
            debug!("granted vote to {candidate} for term {term}");
        }

        Payload::VoteReply {
            term: current,
            granted,
            voter,
        }
    }

    fn handle_heartbeat(&self, term: u64, leader: NodeId) -> Payload {
        let mut state = self.state.lock();
        if term < state.term {
            let current = state.term;
            drop(state);
            return Payload::nack(format!("stale term {term} < {current}"));
        }

        let was_leader = state.role == NodeRole::Leader;
        state.term = term;
        state.leader = Some(leader);
        if leader != self.node.local_id() {
            state.role = NodeRole::Follower;
        }
        drop(state);

        if was_leader && leader != self.node.local_id() {
            warn!("yielding leadership to {leader} for term {term}");
        }
        if leader != self.node.local_id() {
            self.node.set_local_role(NodeRole::Follower);
        }
        self.node.set_consensus_view(term, Some(leader));
        *self.last_heartbeat.lock() = Instant::now();

        Payload::ack()
    }
}

struct ConsensusHandler(Arc<ConsensusEngine>);

#[async_trait]
impl MessageHandler for ConsensusHandler {
    async fn handle(&self, message: &ClusterMessage) -> Option<Payload> {
        match &message.payload {
            Payload::VoteRequest { term, candidate } => {
                Some(self.0.handle_vote_request(*term, *candidate))
            }
            Payload::Heartbeat { term, leader } => Some(self.0.handle_heartbeat(*term, *leader)),
            // Leadership-only consensus: acknowledged with the same term
            // rules as a heartbeat, never carrying entries.
            Payload::AppendEntries { term, leader } => {
                Some(self.0.handle_heartbeat(*term, *leader))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshos_common::ClusterConfig;

    fn engine() -> Arc<ConsensusEngine> {
        let node = Arc::new(ClusterNode::new(ClusterConfig::default()));
        node.create_cluster("consensus-tests").unwrap();
        ConsensusEngine::new(node)
    }

    #[test]
    fn grants_one_vote_per_term() {
        let engine = engine();
        let a = NodeId::new();
        let b = NodeId::new();

        match engine.handle_vote_request(3, a) {
            Payload::VoteReply { granted, term, .. } => {
                assert!(granted);
                assert_eq!(term, 3);
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        // Second candidate in the same term is refused...
        match engine.handle_vote_request(3, b) {
            Payload::VoteReply { granted, .. } => assert!(!granted),
            other => panic!("unexpected reply: {other:?}"),
        }

        // ...but the original candidate may retry.
        match engine.handle_vote_request(3, a) {
            Payload::VoteReply { granted, .. } => assert!(granted),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn stale_vote_requests_are_refused() {
        let engine = engine();
        let candidate = NodeId::new();
        engine.handle_vote_request(5, candidate);

        match engine.handle_vote_request(2, NodeId::new()) {
            Payload::VoteReply { granted, term, .. } => {
                assert!(!granted);
                assert_eq!(term, 5);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_with_higher_term_demotes_a_leader() {
        let engine = engine();
        engine.assume_leadership();
        assert!(engine.is_leader());

        let other = NodeId::new();
        engine.handle_heartbeat(7, other);

        assert!(!engine.is_leader());
        assert_eq!(engine.leader_id(), Some(other));
        assert_eq!(engine.current_term(), 7);
    }

    #[test]
    fn stale_heartbeats_are_rejected() {
        let engine = engine();
        engine.handle_heartbeat(9, NodeId::new());

        match engine.handle_heartbeat(4, NodeId::new()) {
            Payload::Ack { ok, .. } => assert!(!ok),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(engine.current_term(), 9);
    }
}
