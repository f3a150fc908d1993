use meshos_cluster::{ClusterNode, ConsensusEngine};
use meshos_common::ClusterConfig;
use meshos_dfs::{DistributedFilesystem, MemoryStorage};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> ClusterConfig {
    ClusterConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        discovery_interval_ms: 200,
        sync_interval_ms: 300,
        rpc_timeout_ms: 500,
        heartbeat_interval_ms: 50,
        ..ClusterConfig::default()
    }
}

type Node = (
    Arc<ClusterNode>,
    Arc<ConsensusEngine>,
    Arc<DistributedFilesystem>,
);

async fn spawn_node() -> Node {
    let node = Arc::new(ClusterNode::new(test_config()));
    let consensus = ConsensusEngine::new(node.clone());
    consensus.register();
    let fs = DistributedFilesystem::new(node.clone(), consensus.clone(), Arc::new(MemoryStorage::new()));
    fs.register();
    node.start().await.unwrap();
    consensus.start();
    fs.start();
    (node, consensus, fs)
}

#[tokio::test]
async fn writes_replicate_to_every_ring_owner() {
    let (a_node, a_consensus, a_fs) = spawn_node().await;
    a_node.create_cluster("dfs-demo").unwrap();
    a_consensus.assume_leadership();

    let (b_node, b_consensus, b_fs) = spawn_node().await;
    let (term, leader) = b_node.join_cluster("dfs-demo", a_node.addr()).await.unwrap();
    b_consensus.observe_leader(term, leader);

    let (c_node, c_consensus, c_fs) = spawn_node().await;
    let (term, leader) = c_node.join_cluster("dfs-demo", a_node.addr()).await.unwrap();
    c_consensus.observe_leader(term, leader);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(a_node.status().active_nodes, 3);

    a_fs.create("/x", b"replicated payload").unwrap();

    // With replication_factor 3 and 3 active nodes, every node ends up
    // holding the file within a sync interval or two.
    let mut converged = false;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let on_b = b_fs.read("/x").await.ok();
        let on_c = c_fs.read("/x").await.ok();
        let replicas = a_fs
            .get_file_info("/x")
            .map(|meta| meta.replicas.len())
            .unwrap_or(0);
        if on_b.as_deref() == Some(b"replicated payload".as_ref())
            && on_c.as_deref() == Some(b"replicated payload".as_ref())
            && replicas == 3
        {
            converged = true;
            break;
        }
    }
    assert!(converged, "write should reach all three replicas");

    let replicas = a_fs.get_file_info("/x").unwrap().replicas;
    for node in [a_node.local_id(), b_node.local_id(), c_node.local_id()] {
        assert!(replicas.contains(&node), "missing replica {node}");
    }

    a_node.shutdown();
    b_node.shutdown();
    c_node.shutdown();
}

#[tokio::test]
async fn distributed_locks_route_through_the_leader() {
    let (a_node, a_consensus, a_fs) = spawn_node().await;
    a_node.create_cluster("locks").unwrap();
    a_consensus.assume_leadership();

    let (b_node, b_consensus, b_fs) = spawn_node().await;
    let (term, leader) = b_node.join_cluster("locks", a_node.addr()).await.unwrap();
    b_consensus.observe_leader(term, leader);

    tokio::time::sleep(Duration::from_millis(300)).await;

    // B takes the lock through leader A.
    b_fs.acquire_lock("/shared/config", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(
        a_fs.lock_holders(),
        vec![("/shared/config".to_string(), b_node.local_id())]
    );

    // The leader itself now cannot take it.
    let denied = a_fs
        .acquire_lock("/shared/config", Duration::from_millis(300))
        .await;
    assert!(denied.is_err());

    // Release by B frees it for A.
    b_fs.release_lock("/shared/config").await.unwrap();
    a_fs.acquire_lock("/shared/config", Duration::from_secs(1))
        .await
        .unwrap();

    a_node.shutdown();
    b_node.shutdown();
}
