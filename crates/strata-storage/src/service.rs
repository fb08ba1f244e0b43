//! Services handed to running stages
//!
//! - [`SafeService`]: overwrites of committed blocks are staged and go
//!   through the journal log when the stage commits
//! - [`NonSafeService`]: every write hits the store immediately; bitmaps are
//!   updated once the whole operation has run

use crate::allocator::Allocator;
use crate::context::AllocationContext;
use crate::journal_log::{JournalLog, StagedWrite};
use crate::operation::{ReadService, Service};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strata_common::{BlockAddress, BlockKind, Result};
use tracing::debug;

/// Allocations and frees recorded by one stage
#[derive(Debug, Default)]
struct PendingBitmaps {
    allocations: BTreeSet<BlockAddress>,
    deallocations: BTreeSet<BlockAddress>,
}

impl PendingBitmaps {
    /// Split into (allocate, free, reported-freed). An address both
    /// allocated and freed in one stage appears in neither list but is still
    /// reported freed.
    fn drain(
        &mut self,
        consumed: &[BlockAddress],
    ) -> (Vec<BlockAddress>, Vec<BlockAddress>, Vec<BlockAddress>) {
        let mut allocations = std::mem::take(&mut self.allocations);
        allocations.extend(consumed.iter().copied());
        let deallocations = std::mem::take(&mut self.deallocations);

        let freed: Vec<_> = deallocations.iter().copied().collect();
        let allocate = allocations.difference(&deallocations).copied().collect();
        let free = deallocations.difference(&allocations).copied().collect();
        (allocate, free, freed)
    }
}

/// Service whose stages commit atomically through the journal log
pub struct SafeService {
    allocator: Arc<Allocator>,
    log: Arc<JournalLog>,
    context: AllocationContext,
    pending: PendingBitmaps,
    staged: BTreeMap<BlockAddress, StagedWrite>,
}

impl SafeService {
    pub fn new(allocator: Arc<Allocator>, log: Arc<JournalLog>, context: AllocationContext) -> Self {
        Self {
            allocator,
            log,
            context,
            pending: PendingBitmaps::default(),
            staged: BTreeMap::new(),
        }
    }

    /// Commit everything the current stage did
    pub fn commit(&mut self) -> Result<()> {
        let consumed = self.context.consumed();
        let (allocate, free, freed) = self.pending.drain(&consumed);

        self.log
            .run_transaction(self.context.hint(), &allocate, &free, &self.staged)?;
        debug!(
            op = %self.context.operation_id(),
            allocated = allocate.len(),
            freed = freed.len(),
            staged = self.staged.len(),
            "stage committed"
        );

        self.staged.clear();
        self.context.seal();
        self.allocator.memory_freed(&freed);
        Ok(())
    }

    /// Writes waiting for the next commit
    pub fn staged_writes(&self) -> usize {
        self.staged.len()
    }
}

impl ReadService for SafeService {
    fn block_size(&self) -> u32 {
        self.allocator.block_size()
    }

    fn read(&self, kind: BlockKind, address: BlockAddress) -> Result<Vec<u8>> {
        if let Some(write) = self.staged.get(&address) {
            let mut block = write.data.clone();
            block.resize(self.allocator.block_size() as usize, 0);
            return Ok(block);
        }
        self.allocator.store().read(kind, address)
    }
}

impl Service for SafeService {
    fn allocate(&mut self, address: BlockAddress) {
        self.pending.allocations.insert(address);
    }

    fn deallocate(&mut self, address: BlockAddress) {
        self.pending.deallocations.insert(address);
    }

    fn write(&mut self, kind: BlockKind, address: BlockAddress, data: &[u8]) -> Result<()> {
        if self.context.is_allocated(address) {
            return self.allocator.store().write(kind, address, data);
        }
        crate::store::check_access(
            self.allocator.block_size(),
            self.allocator.block_count(),
            address,
            data.len(),
        )?;
        self.staged.insert(
            address,
            StagedWrite {
                kind,
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    fn allocation_context(&mut self) -> &mut AllocationContext {
        &mut self.context
    }
}

/// Service that writes straight to the store
pub struct NonSafeService {
    allocator: Arc<Allocator>,
    context: AllocationContext,
    pending: PendingBitmaps,
}

impl NonSafeService {
    pub fn new(allocator: Arc<Allocator>, context: AllocationContext) -> Self {
        Self {
            allocator,
            context,
            pending: PendingBitmaps::default(),
        }
    }

    /// Apply recorded bitmap changes, release the reservation and report
    /// freed blocks
    ///
    /// Consumed addresses are sealed before anything touches the bitmaps, so
    /// a failed update leaves them out of the cache rather than free twice.
    pub fn finish(self) -> Result<()> {
        let Self {
            allocator,
            mut context,
            mut pending,
        } = self;

        let consumed = context.consumed();
        let (allocate, free, freed) = pending.drain(&consumed);
        let op = context.operation_id();
        context.seal();
        drop(context);

        allocator.mark_on_disk(&allocate, true)?;
        allocator.mark_on_disk(&free, false)?;
        allocator.store().sync()?;
        allocator.memory_freed(&freed);

        debug!(
            %op,
            allocated = allocate.len(),
            freed = freed.len(),
            "non-safe operation finished"
        );
        Ok(())
    }
}

impl ReadService for NonSafeService {
    fn block_size(&self) -> u32 {
        self.allocator.block_size()
    }

    fn read(&self, kind: BlockKind, address: BlockAddress) -> Result<Vec<u8>> {
        self.allocator.store().read(kind, address)
    }
}

impl Service for NonSafeService {
    fn allocate(&mut self, address: BlockAddress) {
        self.pending.allocations.insert(address);
    }

    fn deallocate(&mut self, address: BlockAddress) {
        self.pending.deallocations.insert(address);
    }

    fn write(&mut self, kind: BlockKind, address: BlockAddress, data: &[u8]) -> Result<()> {
        self.allocator.store().write(kind, address, data)
    }

    fn allocation_context(&mut self) -> &mut AllocationContext {
        &mut self.context
    }
}
