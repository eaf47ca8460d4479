//! Device allocator capability and the host-backed implementation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::MemoryError;

/// Opaque device address, handed to runtimes that launch kernels over FFI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// One device allocation. Released when dropped.
pub trait DeviceBlock: Send {
    /// Size of the allocation in bytes
    fn len(&self) -> usize;

    /// Check if the allocation is zero-sized
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy host bytes into the block. `src` must match the block size exactly.
    fn copy_from_host(&mut self, src: &[u8]) -> Result<(), MemoryError>;

    /// Copy the block into host bytes. `dst` must match the block size exactly.
    fn copy_to_host(&self, dst: &mut [u8]) -> Result<(), MemoryError>;

    /// Device address of the first byte
    fn device_ptr(&self) -> DevicePtr;
}

/// Allocates device blocks
pub trait DeviceAllocator: Send + Sync {
    /// Allocate `bytes` of device memory
    fn allocate(&self, bytes: usize) -> Result<Box<dyn DeviceBlock>, MemoryError>;
}

#[derive(Debug, Default)]
struct HostStats {
    live_blocks: AtomicUsize,
    live_bytes: AtomicUsize,
}

/// Device memory backed by host RAM, for CPU runtimes and tests
#[derive(Debug, Clone, Default)]
pub struct HostAllocator {
    /// Maximum bytes live at once (None = unbounded)
    budget: Option<usize>,
    stats: Arc<HostStats>,
}

impl HostAllocator {
    /// Create an unbounded host allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator that fails once `budget` bytes are live
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            stats: Arc::default(),
        }
    }

    /// Number of blocks currently allocated
    pub fn live_blocks(&self) -> usize {
        self.stats.live_blocks.load(Ordering::Acquire)
    }

    /// Bytes currently allocated
    pub fn live_bytes(&self) -> usize {
        self.stats.live_bytes.load(Ordering::Acquire)
    }
}

impl DeviceAllocator for HostAllocator {
    fn allocate(&self, bytes: usize) -> Result<Box<dyn DeviceBlock>, MemoryError> {
        if bytes == 0 {
            warn!("Zero-size device allocation requested");
        }

        match self.budget {
            // Check and reserve in one step
            Some(budget) => {
                self.stats
                    .live_bytes
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                        live.checked_add(bytes).filter(|&total| total <= budget)
                    })
                    .map_err(|live| MemoryError::OutOfMemory {
                        requested: bytes,
                        available: budget.saturating_sub(live),
                    })?;
            }
            None => {
                self.stats.live_bytes.fetch_add(bytes, Ordering::AcqRel);
            }
        }
        self.stats.live_blocks.fetch_add(1, Ordering::AcqRel);
        trace!("Allocated {} bytes of host-backed device memory", bytes);

        Ok(Box::new(HostBlock {
            data: vec![0u8; bytes].into_boxed_slice(),
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// Block handed out by [`HostAllocator`]
#[derive(Debug)]
pub struct HostBlock {
    data: Box<[u8]>,
    stats: Arc<HostStats>,
}

impl DeviceBlock for HostBlock {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn copy_from_host(&mut self, src: &[u8]) -> Result<(), MemoryError> {
        if src.len() != self.data.len() {
            return Err(MemoryError::SizeMismatch {
                expected: self.data.len(),
                actual: src.len(),
            });
        }
        self.data.copy_from_slice(src);
        Ok(())
    }

    fn copy_to_host(&self, dst: &mut [u8]) -> Result<(), MemoryError> {
        if dst.len() != self.data.len() {
            return Err(MemoryError::SizeMismatch {
                expected: self.data.len(),
                actual: dst.len(),
            });
        }
        dst.copy_from_slice(&self.data);
        Ok(())
    }

    fn device_ptr(&self) -> DevicePtr {
        DevicePtr(self.data.as_ptr() as u64)
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        self.stats.live_blocks.fetch_sub(1, Ordering::AcqRel);
        self.stats.live_bytes.fetch_sub(self.data.len(), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let allocator = HostAllocator::new();
        let block = allocator.allocate(64).unwrap();

        assert_eq!(block.len(), 64);
        assert_eq!(allocator.live_blocks(), 1);
        assert_eq!(allocator.live_bytes(), 64);

        drop(block);
        assert_eq!(allocator.live_blocks(), 0);
        assert_eq!(allocator.live_bytes(), 0);
    }

    #[test]
    fn test_copy_roundtrip() {
        let allocator = HostAllocator::new();
        let mut block = allocator.allocate(4).unwrap();

        block.copy_from_host(&[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        block.copy_to_host(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_copy_size_mismatch() {
        let allocator = HostAllocator::new();
        let mut block = allocator.allocate(4).unwrap();

        assert_eq!(
            block.copy_from_host(&[1, 2, 3]),
            Err(MemoryError::SizeMismatch { expected: 4, actual: 3 })
        );
        let mut out = [0u8; 8];
        assert!(block.copy_to_host(&mut out).is_err());
    }

    #[test]
    fn test_budget_exhausted() {
        let allocator = HostAllocator::with_budget(100);
        let _a = allocator.allocate(60).unwrap();

        let err = allocator.allocate(60).err().unwrap();
        assert_eq!(err, MemoryError::OutOfMemory { requested: 60, available: 40 });
        assert_eq!(allocator.live_blocks(), 1);
    }

    #[test]
    fn test_budget_holds_across_threads() {
        let allocator = HostAllocator::with_budget(300);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .filter_map(|_| allocator.allocate(10).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let blocks: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(blocks.len(), 30);
        assert_eq!(allocator.live_bytes(), 300);
        assert_eq!(allocator.live_blocks(), 30);

        drop(blocks);
        assert_eq!(allocator.live_bytes(), 0);
    }
}
