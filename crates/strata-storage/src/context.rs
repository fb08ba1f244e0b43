//! Per-operation block reservation
//!
//! An [`AllocationContext`] owns the addresses reserved for one operation
//! and hands them out in ascending order. Every address handed out is
//! remembered as consumed so the service can mark it used when the stage
//! commits. Addresses reserved in the current stage are not yet reachable
//! from committed state, so writes to them skip the journal.

use crate::allocator::Allocator;
use crate::layout::{LINK_HEADER_SIZE, NODE_FLAG_LEAF, NODE_HEADER_SIZE};
use crate::operation::Prepared;
use bytes::BufMut;
use std::sync::Arc;
use strata_common::{AllocationStrategy, BlockAddress, BlockKind, Error, OperationId, Result};
use tracing::debug;

/// Blocks reserved for a stream, first block first
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockChain {
    pub addresses: Vec<BlockAddress>,
}

impl BlockChain {
    /// Address of the first block
    pub fn first(&self) -> BlockAddress {
        self.addresses[0]
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Whether the block at `index` directly follows its predecessor on disk
    pub fn is_sequential(&self, index: usize) -> bool {
        index > 0
            && index < self.addresses.len()
            && self.addresses[index] == self.addresses[index - 1] + 1
    }
}

pub struct AllocationContext {
    allocator: Arc<Allocator>,
    op: OperationId,
    /// Reserved and not yet handed out, ascending
    available: Vec<BlockAddress>,
    /// Every address reserved and not yet committed, ascending
    all_allocations: Vec<BlockAddress>,
    /// Handed out since the last commit
    consumed: Vec<BlockAddress>,
    hint: BlockAddress,
    allow_dynamic: bool,
    top_up: usize,
    granted: usize,
}

impl AllocationContext {
    /// Reserve the blocks an operation asked for in its prepare phase
    pub fn new(allocator: Arc<Allocator>, prepared: &Prepared, top_up: usize) -> Result<Self> {
        let op = OperationId::new();
        let available = allocator.allocate(
            op,
            prepared.hint,
            AllocationStrategy::Normal,
            prepared.blocks_required,
        )?;
        let hint = available.last().copied().unwrap_or(prepared.hint);
        debug!(
            %op,
            reserved = available.len(),
            dynamic = prepared.allow_dynamic,
            "allocation context opened"
        );

        Ok(Self {
            allocator,
            op,
            all_allocations: available.clone(),
            granted: available.len(),
            available,
            consumed: Vec::new(),
            hint,
            allow_dynamic: prepared.allow_dynamic,
            top_up: top_up.max(1),
        })
    }

    pub const fn operation_id(&self) -> OperationId {
        self.op
    }

    pub fn block_size(&self) -> u32 {
        self.allocator.block_size()
    }

    /// Highest address granted so far, or the prepare hint before any grant.
    /// Transactions place their journal sector near it.
    pub const fn hint(&self) -> BlockAddress {
        self.hint
    }

    /// Reserved addresses not yet handed out
    pub fn available(&self) -> &[BlockAddress] {
        &self.available
    }

    /// Addresses handed out since the last commit, ascending
    pub fn consumed(&self) -> Vec<BlockAddress> {
        let mut consumed = self.consumed.clone();
        consumed.sort_unstable();
        consumed
    }

    /// Hand out the smallest reserved address greater than `prev`, wrapping
    /// around to the smallest overall. `prev == 0` takes the smallest.
    pub fn allocate(&mut self, prev: BlockAddress) -> Result<BlockAddress> {
        if self.available.is_empty() {
            self.top_up()?;
        }

        let mut idx = if prev == 0 {
            0
        } else {
            self.available.partition_point(|&a| a <= prev)
        };
        if idx == self.available.len() {
            idx = 0;
        }

        let address = self.available.remove(idx);
        self.consumed.push(address);
        Ok(address)
    }

    /// Hand out the smallest reserved address
    pub fn allocate_block(&mut self) -> Result<BlockAddress> {
        self.allocate(0)
    }

    /// Reserve enough blocks for a stream of `byte_size` bytes
    ///
    /// The first block loses [`LINK_HEADER_SIZE`] bytes to its link header.
    /// A later block carries a link header only when it does not directly
    /// follow its predecessor.
    pub fn create_block_stream(&mut self, byte_size: u64) -> Result<BlockChain> {
        let block_size = u64::from(self.block_size());
        let link = LINK_HEADER_SIZE as u64;

        let first = self.allocate(0)?;
        let mut addresses = vec![first];
        let mut remaining = byte_size.saturating_sub(block_size - link);

        while remaining > 0 {
            let prev = addresses[addresses.len() - 1];
            let next = self.allocate(prev)?;
            let capacity = if next == prev + 1 {
                block_size
            } else {
                block_size - link
            };
            remaining = remaining.saturating_sub(capacity);
            addresses.push(next);
        }

        Ok(BlockChain { addresses })
    }

    /// Allocate and write an empty leaf node, returning its address
    pub fn create_empty_btree(&mut self) -> Result<BlockAddress> {
        let address = self.allocate(0)?;

        let mut node = Vec::with_capacity(self.block_size() as usize);
        node.put_u32_le(NODE_FLAG_LEAF);
        node.put_u32_le(0);
        debug_assert_eq!(node.len(), NODE_HEADER_SIZE);
        node.resize(self.block_size() as usize, 0);

        self.allocator
            .store()
            .write(BlockKind::BTree, address, &node)?;
        Ok(address)
    }

    /// Whether `address` was reserved by this operation and not yet committed
    pub fn is_allocated(&self, address: BlockAddress) -> bool {
        self.all_allocations.binary_search(&address).is_ok()
    }

    /// Forget the addresses consumed by a committed stage. They are now
    /// reachable, so later overwrites must go through the journal.
    pub fn seal(&mut self) {
        if self.consumed.is_empty() {
            return;
        }
        self.consumed.sort_unstable();
        let consumed = std::mem::take(&mut self.consumed);
        self.all_allocations
            .retain(|a| consumed.binary_search(a).is_err());
    }

    fn top_up(&mut self) -> Result<()> {
        if !self.allow_dynamic {
            return Err(Error::AllocationExhausted {
                granted: self.granted,
            });
        }

        let more = self.allocator.allocate(
            self.op,
            self.hint,
            AllocationStrategy::DynamicAllocation,
            self.top_up,
        )?;
        debug!(op = %self.op, count = more.len(), "allocation context grew");

        self.granted += more.len();
        if let Some(&last) = more.last() {
            self.hint = self.hint.max(last);
        }
        self.available.extend_from_slice(&more);
        self.available.sort_unstable();
        self.all_allocations.extend(more);
        self.all_allocations.sort_unstable();
        Ok(())
    }
}

impl Drop for AllocationContext {
    /// Unused addresses and those handed out by a stage that never committed
    /// both go back. Committed addresses were removed by `seal`.
    fn drop(&mut self) {
        let mut unused = std::mem::take(&mut self.available);
        unused.append(&mut self.consumed);
        unused.sort_unstable();
        self.allocator.return_allocations(self.op, &unused);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::formatted_store;

    fn allocator() -> Arc<Allocator> {
        Arc::new(Allocator::new(formatted_store(9000, 0)).unwrap())
    }

    #[test]
    fn test_allocate_follows_prev() {
        let alloc = allocator();
        let mut ctx = AllocationContext::new(alloc, &Prepared::new(0, 4), 5).unwrap();
        assert_eq!(ctx.available(), &[4, 5, 6, 7]);

        assert_eq!(ctx.allocate(5).unwrap(), 6);
        assert_eq!(ctx.allocate(0).unwrap(), 4);
        // nothing above 7 is left, wrap to the smallest
        assert_eq!(ctx.allocate(7).unwrap(), 5);
        assert_eq!(ctx.available(), &[7]);
        assert_eq!(ctx.consumed(), vec![4, 5, 6]);
    }

    #[test]
    fn test_exhausted_without_dynamic() {
        let alloc = allocator();
        let mut ctx = AllocationContext::new(alloc, &Prepared::new(0, 1), 5).unwrap();
        ctx.allocate_block().unwrap();

        let err = ctx.allocate_block().unwrap_err();
        assert!(matches!(err, Error::AllocationExhausted { granted: 1 }));
    }

    #[test]
    fn test_dynamic_top_up_keeps_pool_sorted() {
        let alloc = allocator();
        let prepared = Prepared::new(0, 2).with_dynamic(true);
        let mut ctx = AllocationContext::new(alloc, &prepared, 5).unwrap();

        let mut handed = Vec::new();
        for _ in 0..9 {
            handed.push(ctx.allocate_block().unwrap());
            assert!(ctx.available().windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(handed, (4..13).collect::<Vec<_>>());
        // two top-ups of five after the initial two
        assert_eq!(ctx.available().len(), 3);
        assert!(handed.iter().all(|&a| ctx.is_allocated(a)));
    }

    #[test]
    fn test_stream_sizing() {
        let alloc = allocator();
        let prepared = Prepared::new(0, 0).with_dynamic(true);
        let mut ctx = AllocationContext::new(alloc, &prepared, 5).unwrap();

        let one = ctx.create_block_stream(512 - 12).unwrap();
        assert_eq!(one.len(), 1);

        let two = ctx.create_block_stream(512 - 11).unwrap();
        assert_eq!(two.len(), 2);
        assert!(two.is_sequential(1));

        // contiguous blocks carry a full block each
        let three = ctx.create_block_stream(500 + 512 + 512).unwrap();
        assert_eq!(three.len(), 3);

        let empty = ctx.create_block_stream(0).unwrap();
        assert_eq!(empty.len(), 1);
    }

    #[test]
    fn test_stream_gap_costs_link_header() {
        let alloc = allocator();
        let mut ctx = AllocationContext::new(alloc, &Prepared::new(0, 4), 5).unwrap();
        // leave a hole after the first block
        assert_eq!(ctx.allocate(4).unwrap(), 5);

        // 4, then 6 (not sequential, 500 bytes), then 7 (512 bytes)
        let chain = ctx.create_block_stream(500 + 500 + 1).unwrap();
        assert_eq!(chain.addresses, vec![4, 6, 7]);
        assert!(!chain.is_sequential(1));
        assert!(chain.is_sequential(2));
    }

    #[test]
    fn test_empty_btree_node() {
        let alloc = allocator();
        let store = alloc.store().clone();
        let mut ctx = AllocationContext::new(alloc, &Prepared::new(0, 1), 5).unwrap();

        let root = ctx.create_empty_btree().unwrap();
        let node = store.read(BlockKind::BTree, root).unwrap();
        assert_eq!(&node[..4], &NODE_FLAG_LEAF.to_le_bytes());
        assert_eq!(&node[4..8], &0u32.to_le_bytes());
    }

    #[test]
    fn test_seal_forgets_committed_addresses() {
        let alloc = allocator();
        let mut ctx = AllocationContext::new(alloc, &Prepared::new(0, 3), 5).unwrap();
        let a = ctx.allocate_block().unwrap();

        ctx.seal();
        assert!(!ctx.is_allocated(a));
        assert!(ctx.consumed().is_empty());
        // still reserved, not yet handed out
        assert!(ctx.is_allocated(ctx.available()[0]));
    }

    #[test]
    fn test_drop_returns_unused() {
        let alloc = allocator();
        let before = alloc.free_blocks().unwrap();
        {
            let mut ctx =
                AllocationContext::new(alloc.clone(), &Prepared::new(0, 6), 5).unwrap();
            ctx.allocate_block().unwrap();
            assert_eq!(alloc.locked_groups(ctx.operation_id()), vec![0]);
        }
        // never sealed, so the handed-out block comes back too
        assert_eq!(alloc.free_blocks().unwrap(), before);
    }

    #[test]
    fn test_drop_keeps_sealed_addresses() {
        let alloc = allocator();
        let before = alloc.free_blocks().unwrap();
        {
            let mut ctx =
                AllocationContext::new(alloc.clone(), &Prepared::new(0, 6), 5).unwrap();
            ctx.allocate_block().unwrap();
            ctx.seal();
            ctx.allocate_block().unwrap();
        }
        assert_eq!(alloc.free_blocks().unwrap(), before - 1);
    }

    #[test]
    fn test_hint_follows_grants() {
        let alloc = allocator();
        let prepared = Prepared::new(0, 2).with_dynamic(true);
        let mut ctx = AllocationContext::new(alloc, &prepared, 5).unwrap();
        assert_eq!(ctx.hint(), 5);

        for _ in 0..3 {
            ctx.allocate_block().unwrap();
        }
        assert_eq!(ctx.hint(), 10);
    }
}
