use meshos_common::{MeshError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Local memory collaborator. The node's own allocator is out of scope
/// for the coordination layer; the manager only needs this surface.
pub trait LocalAllocator: Send + Sync {
    /// Allocate a zeroed block and return its virtual address.
    fn malloc(&self, size: usize) -> Result<u64>;

    /// Release a block previously returned by `malloc`.
    fn free(&self, addr: u64) -> Result<()>;

    /// Read up to `len` bytes from a block.
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// Overwrite the prefix of a block.
    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;

    fn free_memory(&self) -> u64;

    fn total_memory(&self) -> u64;
}

struct HeapState {
    blocks: HashMap<u64, Vec<u8>>,
    next_addr: u64,
    used: u64,
}

/// Heap-backed allocator used when no host allocator is wired in.
pub struct HeapAllocator {
    capacity: u64,
    state: Mutex<HeapState>,
}

impl HeapAllocator {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(HeapState {
                blocks: HashMap::new(),
                next_addr: 0x1000,
                used: 0,
            }),
        }
    }
}

impl LocalAllocator for HeapAllocator {
    fn malloc(&self, size: usize) -> Result<u64> {
        let mut state = self.state.lock();
        let requested = size as u64;
        if state.used + requested > self.capacity {
            return Err(MeshError::InsufficientMemory {
                requested,
                available: self.capacity - state.used,
            });
        }
        let addr = state.next_addr;
        state.next_addr += requested.max(1);
        state.used += requested;
        state.blocks.insert(addr, vec![0u8; size]);
        Ok(addr)
    }

    fn free(&self, addr: u64) -> Result<()> {
        let mut state = self.state.lock();
        match state.blocks.remove(&addr) {
            Some(block) => {
                state.used -= block.len() as u64;
                Ok(())
            }
            None => Err(MeshError::Protocol(format!(
                "free of unallocated address {addr:#x}"
            ))),
        }
    }

    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let block = state.blocks.get(&addr).ok_or_else(|| {
            MeshError::Protocol(format!("read of unallocated address {addr:#x}"))
        })?;
        Ok(block[..len.min(block.len())].to_vec())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let block = state.blocks.get_mut(&addr).ok_or_else(|| {
            MeshError::Protocol(format!("write to unallocated address {addr:#x}"))
        })?;
        if data.len() > block.len() {
            return Err(MeshError::Protocol(format!(
                "write of {} bytes overflows block of {}",
                data.len(),
                block.len()
            )));
        }
        block[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn free_memory(&self) -> u64 {
        self.capacity - self.state.lock().used
    }

    fn total_memory(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_accounts_capacity() {
        let alloc = HeapAllocator::new(1024);
        let addr = alloc.malloc(512).unwrap();
        assert_eq!(alloc.free_memory(), 512);

        alloc.free(addr).unwrap();
        assert_eq!(alloc.free_memory(), 1024);
    }

    #[test]
    fn malloc_rejects_over_capacity() {
        let alloc = HeapAllocator::new(100);
        assert!(matches!(
            alloc.malloc(200),
            Err(MeshError::InsufficientMemory { .. })
        ));
    }

    #[test]
    fn write_then_read_round_trips() {
        let alloc = HeapAllocator::new(4096);
        let addr = alloc.malloc(64).unwrap();
        alloc.write(addr, b"hello").unwrap();

        let bytes = alloc.read(addr, 5).unwrap();
        assert_eq!(&bytes, b"hello");
    }

    #[test]
    fn oversized_write_is_refused() {
        let alloc = HeapAllocator::new(4096);
        let addr = alloc.malloc(4).unwrap();
        assert!(alloc.write(addr, b"too long").is_err());
    }
}
