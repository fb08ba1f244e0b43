//! Block device abstraction
//!
//! Everything above this module addresses storage as fixed-size blocks.
//! Implementations must be safe to share between threads; a single block
//! write is expected to be atomic with respect to concurrent reads.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::config::is_valid_block_size;
use strata_common::{BlockAddress, BlockKind, Error, Result};

/// Fixed-size block device
pub trait BlockStore: Send + Sync {
    /// Size of every block in bytes
    fn block_size(&self) -> u32;

    /// Number of addressable blocks
    fn block_count(&self) -> u64;

    /// Read one whole block
    fn read(&self, kind: BlockKind, address: BlockAddress) -> Result<Vec<u8>>;

    /// Write one block. Shorter payloads are zero padded.
    fn write(&self, kind: BlockKind, address: BlockAddress, data: &[u8]) -> Result<()>;

    /// Flush everything written so far to durable storage
    fn sync(&self) -> Result<()>;

    /// Human-readable location of a block, for diagnostics
    fn physical_location(&self, address: BlockAddress) -> String;
}

/// Store I/O counters
#[derive(Debug, Default)]
pub struct StoreStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub syncs: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl StoreStats {
    pub(crate) fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reject addresses and payloads a store cannot hold
pub(crate) fn check_access(
    block_size: u32,
    block_count: u64,
    address: BlockAddress,
    len: usize,
) -> Result<()> {
    if address >= block_count {
        return Err(Error::AddressOutOfRange {
            address,
            block_count,
        });
    }
    if len > block_size as usize {
        return Err(Error::storage(format!(
            "payload of {len} bytes exceeds block size {block_size}"
        )));
    }
    Ok(())
}

/// RAM-backed store. Blocks never written read back as zeros.
pub struct MemoryStore {
    block_size: u32,
    block_count: u64,
    blocks: RwLock<HashMap<BlockAddress, Vec<u8>>>,
    stats: StoreStats,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new(block_size: u32, block_count: u64) -> Result<Self> {
        if !is_valid_block_size(block_size) {
            return Err(Error::Configuration(format!(
                "unsupported block size {block_size}"
            )));
        }
        Ok(Self {
            block_size,
            block_count,
            blocks: RwLock::new(HashMap::new()),
            stats: StoreStats::default(),
        })
    }

    /// Number of blocks that hold data
    pub fn resident_blocks(&self) -> usize {
        self.blocks.read().len()
    }

    /// Get statistics
    pub const fn stats(&self) -> &StoreStats {
        &self.stats
    }
}

impl BlockStore for MemoryStore {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read(&self, _kind: BlockKind, address: BlockAddress) -> Result<Vec<u8>> {
        check_access(self.block_size, self.block_count, address, 0)?;
        let size = self.block_size as usize;
        self.stats.record_read(size);
        Ok(self
            .blocks
            .read()
            .get(&address)
            .cloned()
            .unwrap_or_else(|| vec![0u8; size]))
    }

    fn write(&self, _kind: BlockKind, address: BlockAddress, data: &[u8]) -> Result<()> {
        check_access(self.block_size, self.block_count, address, data.len())?;
        let mut block = vec![0u8; self.block_size as usize];
        block[..data.len()].copy_from_slice(data);
        self.blocks.write().insert(address, block);
        self.stats.record_write(data.len());
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.stats.record_sync();
        Ok(())
    }

    fn physical_location(&self, address: BlockAddress) -> String {
        format!("memory:{address}")
    }
}
