use meshos_common::{ClusterConfig, NodeRole, NodeState, ProcessSpec, ProcessState};
use meshos_scheduler::{SchedulingPolicy, SubmitOptions};
use meshos_server::NodeRuntime;
use std::time::Duration;

fn test_config() -> ClusterConfig {
    ClusterConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        discovery_interval_ms: 200,
        sync_interval_ms: 300,
        rpc_timeout_ms: 500,
        heartbeat_interval_ms: 50,
        scheduler_tick_ms: 100,
        ..ClusterConfig::default()
    }
}

#[tokio::test]
async fn two_node_runtime_end_to_end() {
    let a = NodeRuntime::new(test_config()).unwrap();
    a.start().await.unwrap();
    a.create_cluster("demo").unwrap();

    let status = a.get_cluster_status();
    assert_eq!(status.state, NodeState::Active);
    assert_eq!(status.role, NodeRole::Leader);
    assert_eq!(status.active_nodes, 1);

    let b = NodeRuntime::new(test_config()).unwrap();
    b.start().await.unwrap();
    b.join_cluster("demo", a.node().addr()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.get_cluster_status().active_nodes, 2);
    assert_eq!(b.get_cluster_status().active_nodes, 2);
    let leaders = [a.get_cluster_status(), b.get_cluster_status()]
        .iter()
        .filter(|s| s.role == NodeRole::Leader)
        .count();
    assert_eq!(leaders, 1);

    // A write on A becomes readable on B.
    a.filesystem().create("/etc/issue", b"meshos 0.1").unwrap();
    let mut replicated = false;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if b.filesystem().read("/etc/issue").await.as_deref().ok() == Some(b"meshos 0.1".as_ref())
        {
            replicated = true;
            break;
        }
    }
    assert!(replicated);

    // A pinned process runs locally through the real executor.
    a.scheduler().set_policy(SchedulingPolicy::Affinity);
    let pid = a.scheduler().submit(
        ProcessSpec::new("echo", vec!["scheduled".into()]),
        SubmitOptions {
            affinity: Some(a.node().local_id()),
            data_path: None,
        },
    );
    let mut completed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if a.scheduler().get_process(pid).map(|p| p.state) == Some(ProcessState::Completed) {
            completed = true;
            break;
        }
    }
    assert!(completed, "pinned process should complete locally");

    let stats = a.get_memory_stats();
    assert!(stats.total > 0);
    assert_eq!(a.monitor().health().nodes_active, 2);
    assert!(a.get_replication_status().contains_key("/etc/issue"));

    a.shutdown().await;
    b.shutdown().await;
}
