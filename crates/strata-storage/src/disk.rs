//! File-backed block store
//!
//! Blocks are laid out back to back: block `n` lives at byte offset
//! `n * block_size`. Works on regular files and raw block devices.

use crate::layout::{DatabaseHeader, HEADER_SIZE};
use crate::raw_io::{AlignedBuffer, RawFile, SECTOR_ALIGNMENT};
use crate::store::{BlockStore, StoreStats, check_access};
use std::path::Path;
use std::sync::atomic::Ordering;
use strata_common::config::is_valid_block_size;
use strata_common::{BlockAddress, BlockKind, Error, Result, StorageConfig};
use tracing::info;

/// Block store over a single file or device
pub struct FileStore {
    file: RawFile,
    block_size: u32,
    block_count: u64,
    stats: StoreStats,
}

impl FileStore {
    /// Create a zero-filled store. The caller formats it.
    pub fn create(
        path: impl AsRef<Path>,
        block_size: u32,
        block_count: u64,
        direct_io: bool,
    ) -> Result<Self> {
        if !is_valid_block_size(block_size) {
            return Err(Error::Configuration(format!(
                "unsupported block size {block_size}"
            )));
        }
        let file = RawFile::create(&path, u64::from(block_size) * block_count, direct_io)?;
        if file.size() < u64::from(block_size) * block_count {
            return Err(Error::storage(format!(
                "{} holds {} bytes, {} blocks of {block_size} bytes do not fit",
                file.path(),
                file.size(),
                block_count
            )));
        }

        info!(
            "Created store {} ({} blocks of {} bytes)",
            file.path(),
            block_count,
            block_size
        );
        Ok(Self {
            file,
            block_size,
            block_count,
            stats: StoreStats::default(),
        })
    }

    /// Create a store sized by a configuration
    pub fn create_with_config(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        Self::create(path, config.block_size, config.block_count, config.direct_io)
    }

    /// Open a formatted store; geometry comes from its header
    pub fn open(path: impl AsRef<Path>, direct_io: bool) -> Result<Self> {
        let file = RawFile::open(&path, direct_io)?;

        let mut buf = AlignedBuffer::new(HEADER_SIZE.next_multiple_of(SECTOR_ALIGNMENT));
        file.read_at(0, buf.as_mut_slice())?;
        let header = DatabaseHeader::decode(buf.as_slice())?;

        let needed = u64::from(header.block_size) * header.block_count;
        if file.size() < needed {
            return Err(Error::invalid_store(format!(
                "{} is {} bytes, header describes {needed}",
                file.path(),
                file.size()
            )));
        }

        info!(
            "Opened store {} ('{}', {} blocks of {} bytes)",
            file.path(),
            header.name,
            header.block_count,
            header.block_size
        );
        Ok(Self {
            file,
            block_size: header.block_size,
            block_count: header.block_count,
            stats: StoreStats::default(),
        })
    }

    pub fn path(&self) -> &str {
        self.file.path()
    }

    /// Get statistics
    pub const fn stats(&self) -> &StoreStats {
        &self.stats
    }

    const fn offset_of(&self, address: BlockAddress) -> u64 {
        address * self.block_size as u64
    }
}

impl BlockStore for FileStore {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read(&self, _kind: BlockKind, address: BlockAddress) -> Result<Vec<u8>> {
        check_access(self.block_size, self.block_count, address, 0)?;
        let mut buf = AlignedBuffer::new(self.block_size as usize);
        self.file.read_at(self.offset_of(address), buf.as_mut_slice())?;
        self.stats.record_read(buf.len());
        Ok(buf.as_slice().to_vec())
    }

    fn write(&self, _kind: BlockKind, address: BlockAddress, data: &[u8]) -> Result<()> {
        check_access(self.block_size, self.block_count, address, data.len())?;
        let mut buf = AlignedBuffer::new(self.block_size as usize);
        buf.copy_from(data);
        self.file.write_at(self.offset_of(address), buf.as_slice())?;
        self.stats.record_write(buf.len());
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.stats.record_sync();
        self.file.sync()
    }

    fn physical_location(&self, address: BlockAddress) -> String {
        format!("{}@{}", self.file.path(), self.offset_of(address))
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if self.stats.writes.load(Ordering::Relaxed) > 0 {
            let _ = self.file.sync();
        }
    }
}
