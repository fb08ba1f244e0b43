//! Write-ahead journal log
//!
//! A transaction describes one committed stage: runs of addresses that
//! become used, runs that become free, and the blocks it overwrites. Before
//! anything live is touched the transaction writes the before-image of every
//! overwritten block to a backup block and chains 32-byte records through
//! log blocks. The head of the chain is then recorded in a journal sector;
//! a non-zero sector cell means "in flight".
//!
//! Record format (little-endian):
//! ```text
//! +------------+-------------+------+----------+--------+---------+-----------+
//! | next_block | next_offset | kind | reserved | CRC32C | primary | secondary |
//! | 8B         | 2B          | 1B   | 1B       | 4B     | 8B      | 8B        |
//! +------------+-------------+------+----------+--------+---------+-----------+
//! ```
//!
//! Recovery rolls in-flight transactions back: it restores before-images and
//! undoes bitmap changes. Every step is idempotent, so recovery can itself be
//! interrupted and rerun. A transaction that fails while being applied is
//! rolled back the same way before the error is returned.

use crate::allocator::Allocator;
use crate::layout::Geometry;
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_common::{
    AllocationStrategy, BlockAddress, BlockKind, Error, OperationId, Result,
};
use tracing::{debug, error, info, warn};

/// Encoded record size
pub const LOG_RECORD_SIZE: usize = 32;

/// First governed address of group 0
const FIRST_GOVERNED: BlockAddress = 3;

/// Record kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogKind {
    /// `primary` starts a run of `secondary` addresses that became used
    AllocateRun = 0,
    /// `primary` starts a run of `secondary` addresses that became free
    DeallocateRun = 1,
    /// Block `primary` holds the before-image of block `secondary`
    UpdateBlock = 3,
}

impl LogKind {
    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::AllocateRun),
            1 => Some(Self::DeallocateRun),
            3 => Some(Self::UpdateBlock),
            _ => None,
        }
    }
}

/// One journal record plus its forward link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    /// Block of the next record, 0 ends the chain
    pub next_block: BlockAddress,
    /// Byte offset of the next record within `next_block`
    pub next_offset: u16,
    pub kind: LogKind,
    pub primary: u64,
    pub secondary: u64,
}

impl LogRecord {
    const CHECKSUM_OFFSET: usize = 12;

    pub const fn new(kind: LogKind, primary: u64, secondary: u64) -> Self {
        Self {
            next_block: 0,
            next_offset: 0,
            kind,
            primary,
            secondary,
        }
    }

    /// Serialize a record
    pub fn encode(&self) -> [u8; LOG_RECORD_SIZE] {
        let mut buf = [0u8; LOG_RECORD_SIZE];
        {
            let mut cursor = &mut buf[..];
            cursor.put_u64_le(self.next_block);
            cursor.put_u16_le(self.next_offset);
            cursor.put_u8(self.kind as u8);
            cursor.put_u8(0);
            cursor.put_u32_le(0);
            cursor.put_u64_le(self.primary);
            cursor.put_u64_le(self.secondary);
        }
        let crc = Self::checksum(&buf);
        buf[Self::CHECKSUM_OFFSET..Self::CHECKSUM_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse and verify a record
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < LOG_RECORD_SIZE {
            return Err(Error::corrupt("log record truncated"));
        }

        let mut buf = &data[..LOG_RECORD_SIZE];
        let next_block = buf.get_u64_le();
        let next_offset = buf.get_u16_le();
        let kind = buf.get_u8();
        let _reserved = buf.get_u8();
        let stored_crc = buf.get_u32_le();
        let primary = buf.get_u64_le();
        let secondary = buf.get_u64_le();

        if Self::checksum(&data[..LOG_RECORD_SIZE]) != stored_crc {
            return Err(Error::corrupt("log record CRC mismatch"));
        }
        let kind = LogKind::from_u8(kind)
            .ok_or_else(|| Error::corrupt(format!("unknown log record kind {kind}")))?;

        Ok(Self {
            next_block,
            next_offset,
            kind,
            primary,
            secondary,
        })
    }

    /// CRC32C over the record with the checksum field skipped
    fn checksum(record: &[u8]) -> u32 {
        let crc = crc32c::crc32c(&record[..Self::CHECKSUM_OFFSET]);
        crc32c::crc32c_append(crc, &record[Self::CHECKSUM_OFFSET + 4..LOG_RECORD_SIZE])
    }
}

/// A contiguous run of addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub start: BlockAddress,
    pub length: u64,
}

impl Extent {
    #[must_use]
    pub const fn new(start: BlockAddress, length: u64) -> Self {
        Self { start, length }
    }

    /// Addresses covered by the run
    pub fn addresses(&self) -> impl Iterator<Item = BlockAddress> + use<> {
        self.start..self.start + self.length
    }
}

/// Compress an ascending address list into runs
pub fn compress_runs(sorted: &[BlockAddress]) -> Vec<Extent> {
    let mut runs: Vec<Extent> = Vec::new();
    for &address in sorted {
        match runs.last_mut() {
            Some(run) if run.start + run.length == address => run.length += 1,
            _ => runs.push(Extent::new(address, 1)),
        }
    }
    runs
}

/// A block write held back until its stage commits
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedWrite {
    pub kind: BlockKind,
    pub data: Vec<u8>,
}

/// Outcome of a recovery pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub sectors_scanned: usize,
    pub transactions_rolled_back: usize,
    pub blocks_restored: usize,
    pub runs_reverted: usize,
}

impl RecoveryReport {
    fn absorb(&mut self, other: Self) {
        self.transactions_rolled_back += other.transactions_rolled_back;
        self.blocks_restored += other.blocks_restored;
        self.runs_reverted += other.runs_reverted;
    }
}

/// Log and backup blocks reserved for one transaction. Unused or released
/// blocks go back to the allocator on drop.
struct Reservation<'a> {
    allocator: &'a Allocator,
    op: OperationId,
    addresses: Vec<BlockAddress>,
}

impl Reservation<'_> {
    /// Keep the blocks out of the allocator; recovery still needs them
    fn retain_for_recovery(&mut self) -> Vec<BlockAddress> {
        std::mem::take(&mut self.addresses)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.allocator.return_allocations(self.op, &self.addresses);
    }
}

/// Write-ahead journal over an allocator's store
pub struct JournalLog {
    allocator: Arc<Allocator>,
    /// Serializes journal sector read-modify-write
    sector_lock: Mutex<()>,
}

impl JournalLog {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self {
            allocator,
            sector_lock: Mutex::new(()),
        }
    }

    fn geometry(&self) -> &Geometry {
        self.allocator.geometry()
    }

    fn records_per_block(&self) -> usize {
        self.allocator.block_size() as usize / LOG_RECORD_SIZE
    }

    /// Journal sector closest to `hint`
    ///
    /// The hint's group is rounded to the nearest journal group, ties
    /// rounding down and never past the last group.
    pub fn nearest_sector(&self, hint: BlockAddress) -> BlockAddress {
        let geometry = self.geometry();
        let frequency = u64::from(self.allocator.header().journal_frequency);
        if frequency == 0 {
            return geometry.group_address(0) + 1;
        }

        let group_count = geometry.group_count();
        let address = if hint <= 1 { FIRST_GOVERNED } else { hint };
        let group = geometry.locate(address).group.min(group_count - 1);

        let diff = group % frequency;
        let rounded = if diff * 2 > frequency && group + (frequency - diff) < group_count {
            group + (frequency - diff)
        } else {
            group - diff
        };
        geometry.group_address(rounded) + 1
    }

    /// Every journal sector of the store
    pub fn sector_addresses(&self) -> Vec<BlockAddress> {
        let geometry = self.geometry();
        let frequency = self.allocator.header().journal_frequency;
        if frequency == 0 {
            return vec![geometry.group_address(0) + 1];
        }
        (0..geometry.group_count())
            .step_by(frequency as usize)
            .map(|group| geometry.group_address(group) + 1)
            .collect()
    }

    /// Commit one stage
    ///
    /// `allocations` and `deallocations` must be ascending. Only when this
    /// returns `Ok` is the stage durable. A failure after the sector cell was
    /// set rolls the stage back at once; if that rollback fails too, the cell
    /// stays for recovery at the next startup and the log and backup blocks
    /// are pinned as used.
    pub fn run_transaction(
        &self,
        hint: BlockAddress,
        allocations: &[BlockAddress],
        deallocations: &[BlockAddress],
        writes: &BTreeMap<BlockAddress, StagedWrite>,
    ) -> Result<()> {
        let alloc_runs = compress_runs(allocations);
        let dealloc_runs = compress_runs(deallocations);
        let record_count = alloc_runs.len() + dealloc_runs.len() + writes.len();
        if record_count == 0 {
            return Ok(());
        }

        let store = self.allocator.store();
        let block_size = self.allocator.block_size() as usize;
        let per_block = self.records_per_block();
        let log_blocks = record_count.div_ceil(per_block);

        let op = OperationId::new();
        let reserved = self.allocator.allocate(
            op,
            hint,
            AllocationStrategy::JournalAllocation,
            log_blocks + writes.len(),
        )?;
        let mut reservation = Reservation {
            allocator: &self.allocator,
            op,
            addresses: reserved,
        };
        let log_addresses = reservation.addresses[..log_blocks].to_vec();

        let mut records = Vec::with_capacity(record_count);
        records.extend(
            alloc_runs
                .iter()
                .map(|run| LogRecord::new(LogKind::AllocateRun, run.start, run.length)),
        );
        records.extend(
            dealloc_runs
                .iter()
                .map(|run| LogRecord::new(LogKind::DeallocateRun, run.start, run.length)),
        );

        // before-images, backups taken from the back of the reservation
        for (i, &target) in writes.keys().enumerate() {
            let backup = reservation.addresses[reservation.addresses.len() - 1 - i];
            let before = store.read(BlockKind::Unknown, target)?;
            store.write(BlockKind::JournalBackup, backup, &before)?;
            records.push(LogRecord::new(LogKind::UpdateBlock, backup, target));
        }

        let mut log = vec![vec![0u8; block_size]; log_blocks];
        let total = records.len();
        for (i, record) in records.iter_mut().enumerate() {
            if i + 1 < total {
                record.next_block = log_addresses[(i + 1) / per_block];
                record.next_offset = (((i + 1) % per_block) * LOG_RECORD_SIZE) as u16;
            }
            let slot = (i % per_block) * LOG_RECORD_SIZE;
            log[i / per_block][slot..slot + LOG_RECORD_SIZE].copy_from_slice(&record.encode());
        }
        for (address, block) in log_addresses.iter().zip(&log) {
            store.write(BlockKind::JournalLog, *address, block)?;
        }
        store.sync()?;

        let head = log_addresses[0];
        let sector = self.nearest_sector(hint);
        let cell = self.set_cell(sector, head)?;
        debug!(
            %op,
            sector,
            cell,
            head,
            records = records.len(),
            "transaction logged"
        );

        if let Err(e) = self
            .apply(allocations, deallocations, writes)
            .and_then(|()| self.clear_cell(sector, cell))
        {
            self.abort(op, sector, cell, head, &mut reservation);
            return Err(e);
        }

        debug!(
            %op,
            allocated = allocations.len(),
            freed = deallocations.len(),
            written = writes.len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Undo a logged transaction whose apply or commit failed
    fn abort(
        &self,
        op: OperationId,
        sector: BlockAddress,
        cell: usize,
        head: BlockAddress,
        reservation: &mut Reservation<'_>,
    ) {
        let rolled_back = self
            .replay_chain(head)
            .and_then(|_| self.clear_cell(sector, cell));
        match rolled_back {
            Ok(()) => warn!(%op, sector, head, "transaction rolled back after a failed apply"),
            Err(e) => {
                error!(
                    %op,
                    sector,
                    head,
                    "rollback failed, transaction left for recovery: {e}"
                );
                let kept = reservation.retain_for_recovery();
                if let Err(e) = self
                    .allocator
                    .mark_on_disk(&kept, true)
                    .and_then(|()| self.allocator.store().sync())
                {
                    error!(%op, blocks = kept.len(), "failed to pin journal blocks: {e}");
                }
            }
        }
    }

    /// Perform the live mutations of a logged transaction
    fn apply(
        &self,
        allocations: &[BlockAddress],
        deallocations: &[BlockAddress],
        writes: &BTreeMap<BlockAddress, StagedWrite>,
    ) -> Result<()> {
        let store = self.allocator.store();
        self.allocator.mark_on_disk(allocations, true)?;
        self.allocator.mark_on_disk(deallocations, false)?;
        for (&address, write) in writes {
            store.write(write.kind, address, &write.data)?;
        }
        store.sync()
    }

    fn set_cell(&self, sector: BlockAddress, head: BlockAddress) -> Result<usize> {
        let store = self.allocator.store();
        let _guard = self.sector_lock.lock();

        let mut block = store.read(BlockKind::JournalSector, sector)?;
        let cell = block
            .chunks_exact(8)
            .position(|c| c.iter().all(|&b| b == 0))
            .ok_or(Error::JournalSectorFull { sector })?;
        block[cell * 8..cell * 8 + 8].copy_from_slice(&head.to_le_bytes());

        store.write(BlockKind::JournalSector, sector, &block)?;
        store.sync()?;
        Ok(cell)
    }

    fn clear_cell(&self, sector: BlockAddress, cell: usize) -> Result<()> {
        let store = self.allocator.store();
        let _guard = self.sector_lock.lock();

        let mut block = store.read(BlockKind::JournalSector, sector)?;
        block[cell * 8..cell * 8 + 8].fill(0);
        store.write(BlockKind::JournalSector, sector, &block)?;
        store.sync()
    }

    /// Heads of the in-flight chains recorded in a sector
    pub fn pending_heads(&self, sector: BlockAddress) -> Result<Vec<BlockAddress>> {
        let block = self.allocator.store().read(BlockKind::JournalSector, sector)?;
        Ok(block
            .chunks_exact(8)
            .map(|mut c| c.get_u64_le())
            .filter(|&head| head != 0)
            .collect())
    }

    /// Roll back every in-flight transaction. Must run before any allocation.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let store = self.allocator.store();
        let mut report = RecoveryReport::default();

        for sector in self.sector_addresses() {
            report.sectors_scanned += 1;
            let _guard = self.sector_lock.lock();
            let mut block = store.read(BlockKind::JournalSector, sector)?;

            let mut dirty = false;
            for cell in 0..block.len() / 8 {
                let mut raw = &block[cell * 8..cell * 8 + 8];
                let head = raw.get_u64_le();
                if head == 0 {
                    continue;
                }
                report.absorb(self.replay_chain(head)?);
                block[cell * 8..cell * 8 + 8].fill(0);
                dirty = true;
            }

            if dirty {
                store.write(BlockKind::JournalSector, sector, &block)?;
                store.sync()?;
            }
        }

        if report.transactions_rolled_back > 0 {
            info!(
                "Journal recovery rolled back {} transactions ({} blocks restored, {} runs reverted)",
                report.transactions_rolled_back, report.blocks_restored, report.runs_reverted
            );
        } else {
            debug!(sectors = report.sectors_scanned, "journal clean");
        }
        Ok(report)
    }

    /// Undo the transaction whose chain starts at `head`
    ///
    /// Used runs are cleared, freed runs set again and before-images copied
    /// back. The chain's own log and backup blocks are cleared as well, in
    /// case they were pinned. Running it twice leaves the same state as
    /// running it once.
    pub fn replay_chain(&self, head: BlockAddress) -> Result<RecoveryReport> {
        let store = self.allocator.store();
        let per_block = self.records_per_block();
        let max_records = self.allocator.block_count() as usize * per_block;

        let mut to_clear = Vec::new();
        let mut to_set = Vec::new();
        let mut journal_blocks = vec![head];
        let mut report = RecoveryReport {
            transactions_rolled_back: 1,
            ..RecoveryReport::default()
        };

        let mut block_address = head;
        let mut offset = 0usize;
        let mut block = store.read(BlockKind::JournalLog, block_address)?;
        for _ in 0..max_records {
            if offset + LOG_RECORD_SIZE > block.len() {
                return Err(Error::corrupt(format!(
                    "log record offset {offset} past end of block {block_address}"
                )));
            }
            let record = LogRecord::decode(&block[offset..offset + LOG_RECORD_SIZE])?;
            match record.kind {
                LogKind::AllocateRun => {
                    to_clear.extend(Extent::new(record.primary, record.secondary).addresses());
                    report.runs_reverted += 1;
                }
                LogKind::DeallocateRun => {
                    to_set.extend(Extent::new(record.primary, record.secondary).addresses());
                    report.runs_reverted += 1;
                }
                LogKind::UpdateBlock => {
                    let before = store.read(BlockKind::JournalBackup, record.primary)?;
                    store.write(BlockKind::Unknown, record.secondary, &before)?;
                    journal_blocks.push(record.primary);
                    report.blocks_restored += 1;
                }
            }

            if record.next_block == 0 {
                to_clear.append(&mut journal_blocks);
                to_clear.sort_unstable();
                self.allocator.mark_on_disk(&to_clear, false)?;
                self.allocator.mark_on_disk(&to_set, true)?;
                store.sync()?;
                debug!(
                    head,
                    restored = report.blocks_restored,
                    runs = report.runs_reverted,
                    "rolled back transaction"
                );
                return Ok(report);
            }
            if record.next_block != block_address {
                block_address = record.next_block;
                journal_blocks.push(block_address);
                block = store.read(BlockKind::JournalLog, block_address)?;
            }
            offset = usize::from(record.next_offset);
        }

        Err(Error::corrupt(format!("log chain at {head} does not terminate")))
    }
}
