use crate::allocator::LocalAllocator;
use crate::page::{MemorySegment, PageDescriptor, PageState};
use async_trait::async_trait;
use dashmap::DashMap;
use meshos_cluster::{ClusterMessage, ClusterNode, MembershipEvent, MessageHandler, MessageType, Payload};
use meshos_common::{AccessMode, MeshError, NodeId, PageId, Pid, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Aggregate memory view exposed to the monitor and operator tooling
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub local_pages: usize,
    pub remote_pages: usize,
    pub shared_pages: usize,
    pub cached_pages: usize,
    pub pressure: f64,
}

struct MigrationOutcome {
    owner: NodeId,
    state: PageState,
    virtual_addr: u64,
}

/// Page-granular distributed shared memory.
///
/// Allocation prefers local pages and spills to the peers reporting the
/// most free memory. Remote pages are fetched on read and cached; pages
/// read often enough are pulled local. Writes to shared pages invalidate
/// replicas before re-replicating (write-invalidate, not multi-writer
/// merge).
pub struct DistributedMemoryManager {
    node: Arc<ClusterNode>,
    allocator: Arc<dyn LocalAllocator>,
    pages: DashMap<PageId, PageDescriptor>,
    segments: DashMap<Uuid, MemorySegment>,
    remote_cache: DashMap<PageId, Vec<u8>>,
    access_counts: DashMap<PageId, u32>,
    /// Last reported free bytes per peer, fed by StateUpdate messages
    free_reports: DashMap<NodeId, u64>,
    migration_tx: mpsc::UnboundedSender<PageId>,
    migration_rx: Mutex<Option<mpsc::UnboundedReceiver<PageId>>>,
    page_size: usize,
    pressure_threshold: f64,
    migrate_threshold: u32,
}

impl DistributedMemoryManager {
    pub fn new(node: Arc<ClusterNode>, allocator: Arc<dyn LocalAllocator>) -> Arc<Self> {
        let config = node.config();
        let (migration_tx, migration_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            page_size: config.page_size,
            pressure_threshold: config.memory_pressure_threshold,
            migrate_threshold: config.remote_access_migration_threshold,
            pages: DashMap::new(),
            segments: DashMap::new(),
            remote_cache: DashMap::new(),
            access_counts: DashMap::new(),
            free_reports: DashMap::new(),
            migration_rx: Mutex::new(Some(migration_rx)),
            migration_tx,
            allocator,
            node,
        })
    }

    /// Register the standalone handler. The combined node runtime wires
    /// its own routing table instead of calling this.
    pub fn register(self: &Arc<Self>) {
        let handler: Arc<dyn MessageHandler> = Arc::new(MemoryMessageHandler(self.clone()));
        for kind in [MessageType::Read, MessageType::Write, MessageType::StateUpdate] {
            self.node.register_handler(kind, handler.clone());
        }
    }

    /// Start the migration worker, eviction loop, report loop, and the
    /// membership watcher.
    pub fn start(self: &Arc<Self>) {
        let cancel = self.node.cancellation_token();

        // Hot pages queued for migration-to-local.
        let manager = self.clone();
        let mut rx = self
            .migration_rx
            .lock()
            .take()
            .expect("memory manager started twice");
        let worker_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let page_id = tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(page_id) => page_id,
                        None => break,
                    }
                };
                let local = manager.node.local_id();
                if let Err(e) = manager.migrate_page(page_id, local).await {
                    warn!("migration of hot page {page_id} failed: {e}");
                }
            }
        });

        let manager = self.clone();
        let eviction_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                manager.node.config().discovery_interval_ms,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = eviction_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                manager.evict_if_pressured().await;
            }
        });

        let manager = self.clone();
        let report_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                manager.node.config().discovery_interval_ms,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = report_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                manager.publish_report();
            }
        });

        let manager = self.clone();
        let mut events = self.node.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(MembershipEvent::Failed(node)) | Ok(MembershipEvent::Left(node)) => {
                            manager.forget_peer(node);
                        }
                        Ok(MembershipEvent::Joined(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            }
        });
    }

    /// Allocate `size` bytes for a process, local pages first, spilling
    /// the remainder to the peers with the most reported free memory.
    ///
    /// Nothing survives a failure: every page placed before the error is
    /// freed again before the error is returned.
    pub async fn allocate(
        &self,
        process_id: Pid,
        size: usize,
        access_mode: AccessMode,
        shared: bool,
    ) -> Result<MemorySegment> {
        if size == 0 {
            return Err(MeshError::Protocol("zero-size allocation".into()));
        }
        let page_count = size.div_ceil(self.page_size);
        let local_budget = self.allocator.free_memory() as usize / self.page_size;
        let local_count = page_count.min(local_budget);
        let local_id = self.node.local_id();

        let mut created: Vec<PageId> = Vec::with_capacity(page_count);
        let mut remote_placed: Vec<(PageId, NodeId)> = Vec::new();
        let mut base_addr = 0u64;

        for i in 0..local_count {
            match self.allocator.malloc(self.page_size) {
                Ok(addr) => {
                    if i == 0 {
                        base_addr = addr;
                    }
                    let mut page = PageDescriptor::new_local(local_id, addr, access_mode);
                    if shared {
                        page.state = PageState::Shared;
                    }
                    created.push(page.page_id);
                    self.pages.insert(page.page_id, page);
                }
                Err(e) => {
                    self.rollback(&created, &remote_placed);
                    return Err(e);
                }
            }
        }

        for _ in local_count..page_count {
            let Some(target) = self.most_free_peer() else {
                self.rollback(&created, &remote_placed);
                return Err(MeshError::InsufficientMemory {
                    requested: size as u64,
                    available: self.allocator.free_memory(),
                });
            };

            let page_id = Uuid::new_v4();
            let reply = self
                .node
                .send_message(
                    target,
                    Payload::PagePush {
                        page_id,
                        shared,
                        bytes: vec![0u8; self.page_size],
                    },
                )
                .await;

            match reply {
                Some(Payload::Ack { ok: true, .. }) => {
                    if let Some(mut report) = self.free_reports.get_mut(&target) {
                        *report = report.saturating_sub(self.page_size as u64);
                    }
                    self.pages
                        .insert(page_id, PageDescriptor::new_remote(page_id, target, access_mode));
                    created.push(page_id);
                    remote_placed.push((page_id, target));
                }
                _ => {
                    // Unknown outcome: the peer may have placed the page,
                    // so a best-effort free keeps nothing partial alive.
                    let node = self.node.clone();
                    tokio::spawn(async move {
                        node.send_message(target, Payload::PageFree { page_id }).await;
                    });
                    self.rollback(&created, &remote_placed);
                    return Err(MeshError::InsufficientMemory {
                        requested: size as u64,
                        available: self.allocator.free_memory(),
                    });
                }
            }
        }

        let segment = MemorySegment {
            segment_id: Uuid::new_v4(),
            process_id,
            base_addr,
            size,
            pages: created,
            shared,
        };
        self.segments.insert(segment.segment_id, segment.clone());
        debug!(
            "allocated {} pages ({} local) for process {process_id}",
            segment.pages.len(),
            local_count
        );
        Ok(segment)
    }

    /// Free one segment and every page it owns.
    pub fn free_segment(&self, segment_id: Uuid) -> Result<()> {
        let (_, segment) = self
            .segments
            .remove(&segment_id)
            .ok_or_else(|| MeshError::Protocol(format!("unknown segment {segment_id}")))?;
        for page_id in segment.pages {
            self.free_page(page_id);
        }
        Ok(())
    }

    /// Free every segment belonging to a process.
    pub fn free_process(&self, process_id: Pid) {
        let segment_ids: Vec<Uuid> = self
            .segments
            .iter()
            .filter(|entry| entry.value().process_id == process_id)
            .map(|entry| *entry.key())
            .collect();
        for segment_id in segment_ids {
            let _ = self.free_segment(segment_id);
        }
    }

    /// Map a page owned by a peer into the local page table as an empty
    /// shell. Reads fetch from the owner; enough of them pull the page
    /// local.
    pub fn attach_remote_page(
        &self,
        page_id: PageId,
        owner: NodeId,
        access_mode: AccessMode,
    ) -> Result<()> {
        if self.pages.contains_key(&page_id) {
            return Ok(());
        }
        self.pages
            .insert(page_id, PageDescriptor::new_remote(page_id, owner, access_mode));
        Ok(())
    }

    pub async fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let desc = self
            .pages
            .get(&page_id)
            .map(|entry| entry.value().clone())
            .ok_or(MeshError::PageNotFound(page_id))?;

        match desc.state {
            PageState::Local | PageState::Shared => {
                let bytes = self.allocator.read(desc.virtual_addr, self.page_size)?;
                if let Some(mut entry) = self.pages.get_mut(&page_id) {
                    entry.touch();
                }
                Ok(bytes)
            }
            PageState::Remote => {
                if let Some(cached) = self.remote_cache.get(&page_id) {
                    let bytes = cached.value().clone();
                    drop(cached);
                    self.note_remote_access(page_id);
                    return Ok(bytes);
                }

                match self
                    .node
                    .send_message(desc.owner, Payload::PageRead { page_id })
                    .await
                {
                    Some(Payload::PageData {
                        bytes: Some(bytes), ..
                    }) => {
                        self.remote_cache.insert(page_id, bytes.clone());
                        if let Some(mut entry) = self.pages.get_mut(&page_id) {
                            entry.touch();
                        }
                        self.note_remote_access(page_id);
                        Ok(bytes)
                    }
                    Some(Payload::PageData { bytes: None, .. }) => {
                        Err(MeshError::PageInvalid(page_id))
                    }
                    _ => Err(MeshError::PeerUnreachable { node: desc.owner }),
                }
            }
            PageState::Migrating => Err(MeshError::PageMigrating(page_id)),
            PageState::Invalid => Err(MeshError::PageInvalid(page_id)),
        }
    }

    pub async fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        let desc = self
            .pages
            .get(&page_id)
            .map(|entry| entry.value().clone())
            .ok_or(MeshError::PageNotFound(page_id))?;

        match desc.state {
            PageState::Local => {
                self.allocator.write(desc.virtual_addr, data)?;
                if let Some(mut entry) = self.pages.get_mut(&page_id) {
                    entry.dirty = true;
                    entry.touch();
                }
                Ok(())
            }
            PageState::Shared => {
                // Write-invalidate: replicas drop their copies first, the
                // local write lands, then fresh bytes are pushed back out.
                let local_id = self.node.local_id();
                for replica in desc.replicas.iter().filter(|r| **r != local_id) {
                    let node = self.node.clone();
                    let replica = *replica;
                    tokio::spawn(async move {
                        node.send_message(replica, Payload::PageInvalidate { page_id })
                            .await;
                    });
                }

                self.allocator.write(desc.virtual_addr, data)?;
                if let Some(mut entry) = self.pages.get_mut(&page_id) {
                    entry.dirty = true;
                    entry.touch();
                }

                let bytes = data.to_vec();
                for replica in desc.replicas.iter().filter(|r| **r != local_id) {
                    let node = self.node.clone();
                    let replica = *replica;
                    let bytes = bytes.clone();
                    let shared = true;
                    tokio::spawn(async move {
                        node.send_message(
                            replica,
                            Payload::PagePush {
                                page_id,
                                shared,
                                bytes,
                            },
                        )
                        .await;
                    });
                }
                Ok(())
            }
            PageState::Remote => {
                match self
                    .node
                    .send_message(
                        desc.owner,
                        Payload::PageWrite {
                            page_id,
                            bytes: data.to_vec(),
                        },
                    )
                    .await
                {
                    Some(Payload::Ack { ok: true, .. }) => {
                        self.remote_cache.insert(page_id, data.to_vec());
                        if desc.access_mode == AccessMode::Exclusive {
                            let _ = self.migration_tx.send(page_id);
                        }
                        Ok(())
                    }
                    Some(Payload::Ack { ok: false, detail }) => Err(MeshError::Protocol(
                        detail.unwrap_or_else(|| "remote write refused".into()),
                    )),
                    // Unknown outcome: the owner may have applied the write.
                    _ => Err(MeshError::PeerUnreachable { node: desc.owner }),
                }
            }
            PageState::Migrating => Err(MeshError::PageMigrating(page_id)),
            PageState::Invalid => Err(MeshError::PageInvalid(page_id)),
        }
    }

    /// Move a page to `target`, which may be the local node.
    ///
    /// The page sits in `Migrating` only for the duration of this call; a
    /// failure leaves it `Invalid` and the caller must re-allocate.
    pub async fn migrate_page(&self, page_id: PageId, target: NodeId) -> Result<()> {
        let desc = {
            let mut entry = self
                .pages
                .get_mut(&page_id)
                .ok_or(MeshError::PageNotFound(page_id))?;
            match entry.state {
                PageState::Migrating => return Err(MeshError::PageMigrating(page_id)),
                PageState::Invalid => return Err(MeshError::PageInvalid(page_id)),
                _ => {}
            }
            if entry.owner == target {
                entry.touch();
                return Ok(());
            }
            let snapshot = entry.value().clone();
            entry.state = PageState::Migrating;
            snapshot
        };

        match self.transfer(&desc, target).await {
            Ok(outcome) => {
                if let Some(mut entry) = self.pages.get_mut(&page_id) {
                    entry.owner = outcome.owner;
                    entry.state = outcome.state;
                    entry.virtual_addr = outcome.virtual_addr;
                    entry.dirty = false;
                    entry.touch();
                }
                self.remote_cache.remove(&page_id);
                self.access_counts.remove(&page_id);
                debug!("page {page_id} migrated to {target}");
                Ok(())
            }
            Err(e) => {
                if let Some(mut entry) = self.pages.get_mut(&page_id) {
                    entry.state = PageState::Invalid;
                }
                warn!("migration of {page_id} to {target} failed: {e}");
                Err(e)
            }
        }
    }

    async fn transfer(&self, desc: &PageDescriptor, target: NodeId) -> Result<MigrationOutcome> {
        let local_id = self.node.local_id();

        // Fetch the content from wherever the page currently lives.
        let bytes = if desc.owner == local_id {
            self.allocator.read(desc.virtual_addr, self.page_size)?
        } else {
            match self
                .node
                .send_message(
                    desc.owner,
                    Payload::PageRead {
                        page_id: desc.page_id,
                    },
                )
                .await
            {
                Some(Payload::PageData {
                    bytes: Some(bytes), ..
                }) => bytes,
                _ => {
                    return Err(MeshError::MigrationFailed {
                        page: desc.page_id,
                        reason: "content fetch from owner failed".into(),
                    })
                }
            }
        };

        if target == local_id {
            let addr = self
                .allocator
                .malloc(self.page_size)
                .map_err(|e| MeshError::MigrationFailed {
                    page: desc.page_id,
                    reason: e.to_string(),
                })?;
            self.allocator.write(addr, &bytes)?;

            if desc.owner != local_id {
                let node = self.node.clone();
                let owner = desc.owner;
                let page_id = desc.page_id;
                tokio::spawn(async move {
                    node.send_message(owner, Payload::PageFree { page_id }).await;
                });
            }
            Ok(MigrationOutcome {
                owner: local_id,
                state: PageState::Local,
                virtual_addr: addr,
            })
        } else {
            let shared = desc.state == PageState::Shared;
            match self
                .node
                .send_message(
                    target,
                    Payload::PagePush {
                        page_id: desc.page_id,
                        shared,
                        bytes,
                    },
                )
                .await
            {
                Some(Payload::Ack { ok: true, .. }) => {
                    if desc.owner == local_id && desc.virtual_addr != 0 {
                        let _ = self.allocator.free(desc.virtual_addr);
                    }
                    Ok(MigrationOutcome {
                        owner: target,
                        state: PageState::Remote,
                        virtual_addr: 0,
                    })
                }
                _ => Err(MeshError::MigrationFailed {
                    page: desc.page_id,
                    reason: format!("target {target} rejected the page"),
                }),
            }
        }
    }

    /// Pin a page, excluding it from eviction.
    pub fn retain_page(&self, page_id: PageId) {
        if let Some(mut entry) = self.pages.get_mut(&page_id) {
            entry.ref_count += 1;
        }
    }

    pub fn release_page(&self, page_id: PageId) {
        if let Some(mut entry) = self.pages.get_mut(&page_id) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    /// Record a peer's free-memory report; normally fed by StateUpdate
    /// messages.
    pub fn record_peer_memory(&self, node: NodeId, free: u64) {
        self.free_reports.insert(node, free);
    }

    pub fn get_memory_stats(&self) -> MemoryStats {
        let total = self.allocator.total_memory();
        let free = self.allocator.free_memory();
        let used = total - free;

        let mut local_pages = 0;
        let mut remote_pages = 0;
        let mut shared_pages = 0;
        for entry in self.pages.iter() {
            match entry.value().state {
                PageState::Local => local_pages += 1,
                PageState::Remote => remote_pages += 1,
                PageState::Shared => shared_pages += 1,
                _ => {}
            }
        }

        MemoryStats {
            total,
            used,
            free,
            local_pages,
            remote_pages,
            shared_pages,
            cached_pages: self.remote_cache.len(),
            pressure: if total == 0 {
                0.0
            } else {
                used as f64 / total as f64
            },
        }
    }

    /// Best-effort byte snapshot of every page of a process, for
    /// checkpointing.
    pub async fn snapshot_process(&self, process_id: Pid) -> Vec<u8> {
        let mut blob = Vec::new();
        let page_ids: Vec<PageId> = self
            .segments
            .iter()
            .filter(|entry| entry.value().process_id == process_id)
            .flat_map(|entry| entry.value().pages.clone())
            .collect();
        for page_id in page_ids {
            match self.read_page(page_id).await {
                Ok(bytes) => blob.extend_from_slice(&bytes),
                Err(e) => warn!("checkpoint skipping page {page_id}: {e}"),
            }
        }
        blob
    }

    /// Page descriptor lookup, for tests and diagnostics.
    pub fn page(&self, page_id: PageId) -> Option<PageDescriptor> {
        self.pages.get(&page_id).map(|entry| entry.value().clone())
    }

    /// Serve inbound page traffic. Returns `None` for payloads that are
    /// not memory concerns so a router can try the next subsystem.
    pub async fn handle_message(&self, message: &ClusterMessage) -> Option<Payload> {
        match &message.payload {
            Payload::PageRead { page_id } => Some(Payload::PageData {
                page_id: *page_id,
                bytes: self.serve_page(*page_id, message.source),
            }),
            Payload::PageWrite { page_id, bytes } => {
                Some(match self.apply_remote_write(*page_id, bytes) {
                    Ok(()) => Payload::ack(),
                    Err(e) => Payload::nack(e.to_string()),
                })
            }
            Payload::PagePush {
                page_id,
                shared,
                bytes,
            } => Some(match self.accept_page(*page_id, *shared, bytes) {
                Ok(()) => Payload::ack(),
                Err(e) => Payload::nack(e.to_string()),
            }),
            Payload::PageInvalidate { page_id } => {
                self.remote_cache.remove(page_id);
                Some(Payload::ack())
            }
            Payload::PageFree { page_id } => {
                self.free_page(*page_id);
                Some(Payload::ack())
            }
            Payload::StateUpdate { free_memory, .. } => {
                self.record_peer_memory(message.source, *free_memory);
                Some(Payload::ack())
            }
            _ => None,
        }
    }

    fn serve_page(&self, page_id: PageId, requester: NodeId) -> Option<Vec<u8>> {
        let desc = self.pages.get(&page_id)?.value().clone();
        if desc.owner != self.node.local_id()
            || !matches!(desc.state, PageState::Local | PageState::Shared)
        {
            return None;
        }
        let bytes = self.allocator.read(desc.virtual_addr, self.page_size).ok()?;
        if desc.state == PageState::Shared {
            if let Some(mut entry) = self.pages.get_mut(&page_id) {
                if !entry.replicas.contains(&requester) {
                    entry.replicas.push(requester);
                }
            }
        }
        Some(bytes)
    }

    fn apply_remote_write(&self, page_id: PageId, bytes: &[u8]) -> Result<()> {
        let desc = self
            .pages
            .get(&page_id)
            .map(|entry| entry.value().clone())
            .ok_or(MeshError::PageNotFound(page_id))?;
        if !matches!(desc.state, PageState::Local | PageState::Shared) {
            return Err(MeshError::PageInvalid(page_id));
        }
        self.allocator.write(desc.virtual_addr, bytes)?;
        if let Some(mut entry) = self.pages.get_mut(&page_id) {
            entry.dirty = true;
            entry.touch();
        }
        Ok(())
    }

    /// Accept a page pushed by a peer: a spill placement, a migration, or
    /// the re-replication of a shared page we already track remotely.
    fn accept_page(&self, page_id: PageId, shared: bool, bytes: &[u8]) -> Result<()> {
        if let Some(mut entry) = self.pages.get_mut(&page_id) {
            return match entry.state {
                PageState::Local | PageState::Shared => {
                    self.allocator.write(entry.virtual_addr, bytes)?;
                    entry.touch();
                    Ok(())
                }
                PageState::Remote => {
                    drop(entry);
                    self.remote_cache.insert(page_id, bytes.to_vec());
                    Ok(())
                }
                _ => Err(MeshError::PageInvalid(page_id)),
            };
        }

        let addr = self.allocator.malloc(self.page_size)?;
        self.allocator.write(addr, bytes)?;
        let mut page = PageDescriptor::new_local(self.node.local_id(), addr, AccessMode::ReadWrite);
        page.page_id = page_id;
        if shared {
            page.state = PageState::Shared;
        }
        self.pages.insert(page_id, page);
        Ok(())
    }

    fn free_page(&self, page_id: PageId) {
        if let Some((_, desc)) = self.pages.remove(&page_id) {
            match desc.state {
                PageState::Local | PageState::Shared => {
                    let _ = self.allocator.free(desc.virtual_addr);
                }
                PageState::Remote => {
                    let node = self.node.clone();
                    let owner = desc.owner;
                    tokio::spawn(async move {
                        node.send_message(owner, Payload::PageFree { page_id }).await;
                    });
                }
                _ => {
                    if desc.virtual_addr != 0 {
                        let _ = self.allocator.free(desc.virtual_addr);
                    }
                }
            }
        }
        self.remote_cache.remove(&page_id);
        self.access_counts.remove(&page_id);
    }

    fn rollback(&self, created: &[PageId], remote_placed: &[(PageId, NodeId)]) {
        for page_id in created {
            if let Some((_, desc)) = self.pages.remove(page_id) {
                if matches!(desc.state, PageState::Local | PageState::Shared) {
                    let _ = self.allocator.free(desc.virtual_addr);
                }
            }
        }
        for (page_id, target) in remote_placed {
            let node = self.node.clone();
            let page_id = *page_id;
            let target = *target;
            tokio::spawn(async move {
                node.send_message(target, Payload::PageFree { page_id }).await;
            });
        }
    }

    fn most_free_peer(&self) -> Option<NodeId> {
        let page_size = self.page_size as u64;
        self.free_reports
            .iter()
            .filter(|entry| *entry.key() != self.node.local_id() && *entry.value() >= page_size)
            .max_by_key(|entry| *entry.value())
            .map(|entry| *entry.key())
    }

    fn note_remote_access(&self, page_id: PageId) {
        let mut count = self.access_counts.entry(page_id).or_insert(0);
        *count += 1;
        let hot = *count > self.migrate_threshold;
        if hot {
            *count = 0;
        }
        drop(count);
        if hot {
            debug!("page {page_id} is hot, queueing migration");
            let _ = self.migration_tx.send(page_id);
        }
    }

    async fn evict_if_pressured(&self) {
        let total = self.allocator.total_memory();
        if total == 0 {
            return;
        }
        let used = total - self.allocator.free_memory();
        let pressure = used as f64 / total as f64;
        if pressure <= self.pressure_threshold {
            return;
        }

        let mut candidates: Vec<(u64, PageId)> = self
            .pages
            .iter()
            .filter(|entry| {
                let page = entry.value();
                page.state == PageState::Local && !page.dirty && page.ref_count == 0
            })
            .map(|entry| (entry.value().last_access, *entry.key()))
            .collect();
        if candidates.is_empty() {
            return;
        }

        let Some(target) = self.most_free_peer() else {
            warn!("memory pressure {pressure:.2} but no peer can take pages");
            return;
        };

        candidates.sort_unstable();
        let take = (candidates.len() / 4).max(1);
        info!("memory pressure {pressure:.2}, evicting {take} pages to {target}");
        for (_, page_id) in candidates.into_iter().take(take) {
            if let Err(e) = self.migrate_page(page_id, target).await {
                warn!("eviction of {page_id} failed: {e}");
            }
        }
    }

    fn publish_report(self: &Arc<Self>) {
        let mut usage = self.node.local_info().usage;
        usage.memory_total = self.allocator.total_memory();
        usage.memory_used = usage.memory_total - self.allocator.free_memory();
        self.node.update_local_usage(usage);
        self.node.broadcast(Payload::StateUpdate {
            usage,
            free_memory: self.allocator.free_memory(),
        });
    }

    fn forget_peer(&self, node: NodeId) {
        self.free_reports.remove(&node);
        // Pages owned by a dead peer are gone; mark the shells Invalid so
        // readers re-allocate instead of hanging on fetches.
        for mut entry in self.pages.iter_mut() {
            if entry.value().owner == node && entry.value().state == PageState::Remote {
                entry.state = PageState::Invalid;
            }
        }
    }
}

struct MemoryMessageHandler(Arc<DistributedMemoryManager>);

#[async_trait]
impl MessageHandler for MemoryMessageHandler {
    async fn handle(&self, message: &ClusterMessage) -> Option<Payload> {
        self.0.handle_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HeapAllocator;
    use meshos_common::ClusterConfig;

    fn manager_with_capacity(capacity: u64) -> Arc<DistributedMemoryManager> {
        let node = Arc::new(ClusterNode::new(ClusterConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..ClusterConfig::default()
        }));
        node.create_cluster("memory-tests").unwrap();
        DistributedMemoryManager::new(node, Arc::new(HeapAllocator::new(capacity)))
    }

    #[tokio::test]
    async fn local_allocation_and_io() {
        let manager = manager_with_capacity(1024 * 1024);
        let segment = manager
            .allocate(1, 8192, AccessMode::ReadWrite, false)
            .await
            .unwrap();
        assert_eq!(segment.pages.len(), 2);

        let page_id = segment.pages[0];
        manager.write_page(page_id, b"kernel data").await.unwrap();
        let bytes = manager.read_page(page_id).await.unwrap();
        assert_eq!(&bytes[..11], b"kernel data");

        let stats = manager.get_memory_stats();
        assert_eq!(stats.local_pages, 2);
        assert_eq!(stats.remote_pages, 0);
    }

    #[tokio::test]
    async fn failed_allocation_leaves_no_partial_pages() {
        // Room for one page, no peers to spill to.
        let manager = manager_with_capacity(4096);
        let result = manager.allocate(1, 3 * 4096, AccessMode::ReadWrite, false).await;
        assert!(matches!(result, Err(MeshError::InsufficientMemory { .. })));

        let stats = manager.get_memory_stats();
        assert_eq!(stats.local_pages, 0);
        assert_eq!(stats.used, 0);
    }

    #[tokio::test]
    async fn freeing_a_segment_releases_memory() {
        let manager = manager_with_capacity(1024 * 1024);
        let segment = manager
            .allocate(7, 4096, AccessMode::ReadWrite, false)
            .await
            .unwrap();
        assert!(manager.get_memory_stats().used >= 4096);

        manager.free_segment(segment.segment_id).unwrap();
        assert_eq!(manager.get_memory_stats().used, 0);
        assert!(manager.page(segment.pages[0]).is_none());
    }

    #[tokio::test]
    async fn every_live_page_has_exactly_one_owner() {
        let manager = manager_with_capacity(1024 * 1024);
        let segment = manager
            .allocate(3, 4 * 4096, AccessMode::ReadWrite, false)
            .await
            .unwrap();

        for page_id in &segment.pages {
            let page = manager.page(*page_id).unwrap();
            assert_eq!(page.owner, manager.node.local_id());
            assert_eq!(page.state, PageState::Local);
        }
    }
}
