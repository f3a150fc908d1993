use meshos_cluster::{ClusterNode, ConsensusEngine};
use meshos_common::{ClusterConfig, NodeId, NodeRole, NodeState};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> ClusterConfig {
    ClusterConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        discovery_interval_ms: 200,
        node_failure_timeout_ms: 1_500,
        heartbeat_interval_ms: 50,
        rpc_timeout_ms: 300,
        ..ClusterConfig::default()
    }
}

async fn spawn_node() -> (Arc<ClusterNode>, Arc<ConsensusEngine>) {
    let node = Arc::new(ClusterNode::new(test_config()));
    let consensus = ConsensusEngine::new(node.clone());
    consensus.register();
    node.start().await.unwrap();
    consensus.start();
    (node, consensus)
}

#[tokio::test]
async fn cluster_bootstrap_and_join() {
    let (a, a_consensus) = spawn_node().await;
    a.create_cluster("demo").unwrap();
    a_consensus.assume_leadership();

    let status = a.status();
    assert_eq!(status.state, NodeState::Active);
    assert_eq!(status.role, NodeRole::Leader);
    assert_eq!(status.active_nodes, 1);

    let (b, b_consensus) = spawn_node().await;
    let (term, leader) = b.join_cluster("demo", a.addr()).await.unwrap();
    b_consensus.observe_leader(term, leader);

    // Let the hello announcement and a heartbeat round land.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(a.status().active_nodes, 2);
    assert_eq!(b.status().active_nodes, 2);

    let leaders = [a.status(), b.status()]
        .iter()
        .filter(|s| s.role == NodeRole::Leader)
        .count();
    assert_eq!(leaders, 1, "exactly one node reports Leader");
    assert_eq!(b.status().leader, Some(a.local_id()));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn join_with_wrong_cluster_name_is_rejected() {
    let (a, a_consensus) = spawn_node().await;
    a.create_cluster("demo").unwrap();
    a_consensus.assume_leadership();

    let (b, _) = spawn_node().await;
    let result = b.join_cluster("other-cluster", a.addr()).await;
    assert!(result.is_err());

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn at_most_one_leader_per_term() {
    let (seed, seed_consensus) = spawn_node().await;
    seed.create_cluster("election").unwrap();
    seed_consensus.assume_leadership();

    let mut others = Vec::new();
    for _ in 0..4 {
        let (node, consensus) = spawn_node().await;
        let (term, leader) = node.join_cluster("election", seed.addr()).await.unwrap();
        consensus.observe_leader(term, leader);
        others.push((node, consensus));
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    for (node, _) in &others {
        assert_eq!(node.status().active_nodes, 5);
    }

    // Sample every node's view and record which node claims Leader for
    // which term; a term must never have two claimants.
    let mut leaders_by_term: HashMap<u64, HashSet<NodeId>> = HashMap::new();
    let mut sample = |statuses: Vec<(NodeId, u64, NodeRole)>| {
        for (id, term, role) in statuses {
            if role == NodeRole::Leader {
                leaders_by_term.entry(term).or_default().insert(id);
            }
        }
    };

    for _ in 0..20 {
        let mut statuses = vec![{
            let s = seed.status();
            (s.node_id, s.term, s.role)
        }];
        for (node, _) in &others {
            let s = node.status();
            statuses.push((s.node_id, s.term, s.role));
        }
        sample(statuses);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Kill the current leader and let the survivors elect a new one.
    let initial_term = seed.status().term;
    seed.shutdown();

    let mut elected = false;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut statuses = Vec::new();
        for (node, _) in &others {
            let s = node.status();
            statuses.push((s.node_id, s.term, s.role));
        }
        elected = statuses
            .iter()
            .any(|(_, term, role)| *role == NodeRole::Leader && *term > initial_term);
        sample(statuses);
        if elected {
            break;
        }
    }
    assert!(elected, "a new leader emerges after the old one dies");

    for (term, claimants) in &leaders_by_term {
        assert!(
            claimants.len() <= 1,
            "term {term} had {} leaders: {claimants:?}",
            claimants.len()
        );
    }

    for (node, _) in &others {
        node.shutdown();
    }
}
