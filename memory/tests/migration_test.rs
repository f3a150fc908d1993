use meshos_cluster::ClusterNode;
use meshos_common::{AccessMode, ClusterConfig};
use meshos_memory::{DistributedMemoryManager, HeapAllocator, PageState};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> ClusterConfig {
    ClusterConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        discovery_interval_ms: 200,
        rpc_timeout_ms: 500,
        ..ClusterConfig::default()
    }
}

async fn spawn_node(capacity: u64) -> (Arc<ClusterNode>, Arc<DistributedMemoryManager>) {
    let node = Arc::new(ClusterNode::new(test_config()));
    let manager = DistributedMemoryManager::new(node.clone(), Arc::new(HeapAllocator::new(capacity)));
    manager.register();
    node.start().await.unwrap();
    manager.start();
    (node, manager)
}

#[tokio::test]
async fn hot_remote_page_migrates_to_the_reader() {
    let (a_node, a_mem) = spawn_node(1024 * 1024).await;
    a_node.create_cluster("memdemo").unwrap();

    let (b_node, b_mem) = spawn_node(1024 * 1024).await;
    b_node.join_cluster("memdemo", a_node.addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A owns the page locally.
    let segment = a_mem
        .allocate(1, 4096, AccessMode::ReadWrite, false)
        .await
        .unwrap();
    let page_id = segment.pages[0];
    a_mem.write_page(page_id, b"hot bytes").await.unwrap();

    // B maps it remotely and reads past the migration threshold (10).
    b_mem
        .attach_remote_page(page_id, a_node.local_id(), AccessMode::ReadWrite)
        .unwrap();
    for _ in 0..11 {
        let bytes = b_mem.read_page(page_id).await.unwrap();
        assert_eq!(&bytes[..9], b"hot bytes");
    }

    // The migration worker pulls the page local to B...
    let mut owned = false;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(page) = b_mem.page(page_id) {
            if page.state == PageState::Local && page.owner == b_node.local_id() {
                owned = true;
                break;
            }
        }
    }
    assert!(owned, "page should become Local on the hot reader");

    // ...and the old owner drops its copy, keeping ownership unique.
    let mut released = false;
    for _ in 0..30 {
        if a_mem.page(page_id).is_none() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(released, "previous owner should free the migrated page");

    let bytes = b_mem.read_page(page_id).await.unwrap();
    assert_eq!(&bytes[..9], b"hot bytes");

    a_node.shutdown();
    b_node.shutdown();
}

#[tokio::test]
async fn allocation_spills_to_the_peer_with_free_memory() {
    let (a_node, a_mem) = spawn_node(1024 * 1024).await;
    a_node.create_cluster("spill").unwrap();

    // B has no local capacity at all.
    let (b_node, b_mem) = spawn_node(0).await;
    b_node.join_cluster("spill", a_node.addr()).await.unwrap();

    // Wait for A's free-memory report to reach B.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let segment = b_mem
        .allocate(9, 4096, AccessMode::ReadWrite, false)
        .await
        .unwrap();
    let page_id = segment.pages[0];

    let page = b_mem.page(page_id).unwrap();
    assert_eq!(page.state, PageState::Remote);
    assert_eq!(page.owner, a_node.local_id());

    // Write-through lands on the owner.
    b_mem.write_page(page_id, b"spilled").await.unwrap();
    let bytes = a_mem.read_page(page_id).await.unwrap();
    assert_eq!(&bytes[..7], b"spilled");

    a_node.shutdown();
    b_node.shutdown();
}
