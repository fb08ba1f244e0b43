//! Free-block allocator
//!
//! Free space is tracked per allocation group. A group's bitmap is scanned
//! the first time the group is visited and the resulting free offsets are
//! cached; from then on the cache, not the on-disk bitmap, decides what can
//! be handed out. On-disk bits only change when a journal or service
//! applies a committed stage.
//!
//! Groups handed to an operation stay locked to it until the operation
//! returns its reservation. Locks are advisory: forced strategies may still
//! claim free offsets from groups locked by others.

use crate::bitmap::AllocationBitmap;
use crate::layout::{DatabaseHeader, Geometry};
use crate::store::BlockStore;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use strata_common::{
    AllocationStrategy, BlockAddress, BlockKind, Error, OperationId, Result,
};
use tracing::{debug, warn};

/// Cached scan of one group
#[derive(Debug)]
struct GroupInfo {
    address: BlockAddress,
    /// Free offsets, ascending
    free: Vec<u32>,
    locked_by: Option<OperationId>,
}

#[derive(Debug, Default)]
struct AllocatorState {
    groups: BTreeMap<u64, GroupInfo>,
    locks: HashMap<OperationId, Vec<u64>>,
}

/// Block allocator over a formatted store
pub struct Allocator {
    store: Arc<dyn BlockStore>,
    geometry: Geometry,
    header: DatabaseHeader,
    state: Mutex<AllocatorState>,
    /// Serializes read-modify-write of on-disk bitmaps
    bitmap_lock: Mutex<()>,
}

impl Allocator {
    /// Read the header and build an allocator with an empty cache
    pub fn new(store: Arc<dyn BlockStore>) -> Result<Self> {
        let header = DatabaseHeader::decode(&store.read(BlockKind::Header, 0)?)?;
        if header.block_size != store.block_size() {
            return Err(Error::invalid_store(format!(
                "header block size {} does not match store block size {}",
                header.block_size,
                store.block_size()
            )));
        }
        if header.block_count > store.block_count() {
            return Err(Error::invalid_store(format!(
                "header block count {} exceeds store capacity {}",
                header.block_count,
                store.block_count()
            )));
        }
        let geometry = Geometry::new(header.block_size, header.block_count)?;

        debug!(
            name = %header.name,
            groups = geometry.group_count(),
            "allocator ready"
        );
        Ok(Self {
            store,
            geometry,
            header,
            state: Mutex::new(AllocatorState::default()),
            bitmap_lock: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub const fn header(&self) -> &DatabaseHeader {
        &self.header
    }

    pub const fn block_size(&self) -> u32 {
        self.header.block_size
    }

    pub const fn block_count(&self) -> u64 {
        self.header.block_count
    }

    /// Claim `count` free addresses for `op`, returned ascending
    ///
    /// The scan starts at the group of `hint` (or the first cached group when
    /// the hint is 0), walks forward to the last group and then backward.
    /// Groups locked by other operations are skipped; forced strategies take
    /// a second pass over them. On failure nothing stays claimed.
    pub fn allocate(
        &self,
        op: OperationId,
        hint: BlockAddress,
        strategy: AllocationStrategy,
        count: usize,
    ) -> Result<Vec<BlockAddress>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock();
        let AllocatorState { groups, locks } = &mut *state;

        let group_count = self.geometry.group_count();
        let start = if hint == 0 {
            groups.keys().next().copied().unwrap_or(0)
        } else {
            self.geometry.locate(hint).group.min(group_count - 1)
        };
        let order: Vec<u64> = (start..group_count).chain((0..start).rev()).collect();

        let mut claimed = Vec::with_capacity(count);
        let mut newly_locked = Vec::new();

        for &idx in &order {
            if claimed.len() == count {
                break;
            }
            let info = self.cached_group(groups, idx)?;
            if info.locked_by.is_some_and(|owner| owner != op) || info.free.is_empty() {
                continue;
            }
            take_offsets(info, count - claimed.len(), &mut claimed);
            if info.locked_by.is_none() {
                info.locked_by = Some(op);
                newly_locked.push(idx);
            }
        }

        if claimed.len() < count && strategy.is_forced() {
            for &idx in &order {
                if claimed.len() == count {
                    break;
                }
                let info = self.cached_group(groups, idx)?;
                if info.locked_by.is_some_and(|owner| owner != op) && !info.free.is_empty() {
                    take_offsets(info, count - claimed.len(), &mut claimed);
                }
            }
        }

        if claimed.len() < count {
            let granted = claimed.len() as u64;
            self.reinsert(groups, &mut claimed);
            for idx in newly_locked {
                if let Some(info) = groups.get_mut(&idx) {
                    info.locked_by = None;
                }
            }
            warn!(
                %op,
                ?strategy,
                requested = count,
                available = granted,
                "allocation failed"
            );
            return Err(Error::OutOfSpace {
                requested: count as u64,
                available: granted,
            });
        }

        if !newly_locked.is_empty() {
            locks.entry(op).or_default().extend(newly_locked);
        }
        claimed.sort_unstable();
        debug!(%op, ?strategy, hint, count, first = claimed[0], "allocated blocks");
        Ok(claimed)
    }

    /// Make freed addresses available again. Groups that were never scanned
    /// are skipped: their on-disk bitmap already says the blocks are free.
    pub fn memory_freed(&self, addresses: &[BlockAddress]) {
        if addresses.is_empty() {
            return;
        }
        let mut addresses = addresses.to_vec();
        let mut state = self.state.lock();
        self.reinsert(&mut state.groups, &mut addresses);
        debug!(count = addresses.len(), "freed blocks returned to cache");
    }

    /// Give back addresses `op` reserved but did not use, and release every
    /// group lock `op` holds
    pub fn return_allocations(&self, op: OperationId, unused: &[BlockAddress]) {
        let mut addresses = unused.to_vec();
        let mut state = self.state.lock();
        let AllocatorState { groups, locks } = &mut *state;

        self.reinsert(groups, &mut addresses);
        let released = locks.remove(&op).unwrap_or_default();
        for idx in &released {
            if let Some(info) = groups.get_mut(idx)
                && info.locked_by == Some(op)
            {
                info.locked_by = None;
            }
        }
        debug!(
            %op,
            returned = unused.len(),
            unlocked = released.len(),
            "allocations returned"
        );
    }

    /// Drop every cached scan. Only valid while no operation is in flight.
    pub fn clear_cache(&self) {
        let mut state = self.state.lock();
        state.groups.clear();
        state.locks.clear();
        debug!("allocation cache cleared");
    }

    /// Count free blocks, scanning every group not yet cached
    pub fn free_blocks(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let mut total = 0u64;
        for idx in 0..self.geometry.group_count() {
            total += self.cached_group(&mut state.groups, idx)?.free.len() as u64;
        }
        Ok(total)
    }

    /// Groups currently locked by `op`
    pub fn locked_groups(&self, op: OperationId) -> Vec<u64> {
        self.state
            .lock()
            .locks
            .get(&op)
            .cloned()
            .unwrap_or_default()
    }

    /// Set (`used`) or clear the on-disk bits of governed addresses, one
    /// read-modify-write per group. Setting a set bit or clearing a clear
    /// one is a no-op, so replays converge.
    pub fn mark_on_disk(&self, addresses: &[BlockAddress], used: bool) -> Result<()> {
        if addresses.is_empty() {
            return Ok(());
        }
        let by_group = self.split_by_group(addresses);

        let _guard = self.bitmap_lock.lock();
        for (group, offsets) in by_group {
            let address = self.geometry.group_address(group);
            let mut bitmap =
                AllocationBitmap::from_block(self.store.read(BlockKind::AllocationBitmap, address)?);
            for offset in offsets {
                if used {
                    bitmap.set(offset - 1);
                } else {
                    bitmap.clear(offset - 1);
                }
            }
            self.store
                .write(BlockKind::AllocationBitmap, address, bitmap.as_bytes())?;
        }
        Ok(())
    }

    /// Whether the on-disk bitmap marks an address as used
    pub fn is_used_on_disk(&self, address: BlockAddress) -> Result<bool> {
        if !self.geometry.is_governed(address) {
            return Ok(true);
        }
        let slot = self.geometry.locate(address);
        let bitmap = AllocationBitmap::from_block(self.store.read(
            BlockKind::AllocationBitmap,
            self.geometry.group_address(slot.group),
        )?);
        Ok(bitmap.is_set(slot.offset - 1))
    }

    fn cached_group<'a>(
        &self,
        groups: &'a mut BTreeMap<u64, GroupInfo>,
        idx: u64,
    ) -> Result<&'a mut GroupInfo> {
        if !groups.contains_key(&idx) {
            let address = self.geometry.group_address(idx);
            let bitmap =
                AllocationBitmap::from_block(self.store.read(BlockKind::AllocationBitmap, address)?);
            let free = bitmap.free_offsets(self.geometry.usable_offsets(idx));
            debug!(group = idx, free = free.len(), "scanned group bitmap");
            groups.insert(
                idx,
                GroupInfo {
                    address,
                    free,
                    locked_by: None,
                },
            );
        }
        groups
            .get_mut(&idx)
            .ok_or_else(|| Error::storage(format!("group {idx} missing from cache")))
    }

    /// Group governed addresses by group index, dropping reserved ones
    fn split_by_group(&self, addresses: &[BlockAddress]) -> BTreeMap<u64, Vec<u64>> {
        let mut by_group: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for &address in addresses {
            if !self.geometry.is_governed(address) {
                warn!(address, "ignoring address outside any allocation group");
                continue;
            }
            let slot = self.geometry.locate(address);
            by_group.entry(slot.group).or_default().push(slot.offset);
        }
        by_group
    }

    /// Merge addresses back into cached free lists, keeping them sorted and
    /// free of duplicates
    fn reinsert(&self, groups: &mut BTreeMap<u64, GroupInfo>, addresses: &mut Vec<BlockAddress>) {
        addresses.sort_unstable();
        addresses.dedup();
        for (group, offsets) in self.split_by_group(addresses) {
            let Some(info) = groups.get_mut(&group) else {
                continue;
            };
            info.free.extend(offsets.into_iter().map(|offset| offset as u32));
            info.free.sort_unstable();
            info.free.dedup();
        }
    }
}

/// Move the smallest `wanted` free offsets of a group into `out` as addresses
fn take_offsets(info: &mut GroupInfo, wanted: usize, out: &mut Vec<BlockAddress>) {
    let take = wanted.min(info.free.len());
    let base = info.address;
    out.extend(info.free.drain(..take).map(|offset| base + u64::from(offset)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::formatted_store;
    use std::collections::HashSet;

    fn allocator(block_count: u64) -> Allocator {
        Allocator::new(formatted_store(block_count, 0)).unwrap()
    }

    #[test]
    fn test_rejects_unformatted_store() {
        let store: Arc<dyn BlockStore> =
            Arc::new(crate::store::MemoryStore::new(512, 9000).unwrap());
        assert!(matches!(
            Allocator::new(store),
            Err(Error::InvalidStore(_))
        ));
    }

    #[test]
    fn test_allocate_smallest_first() {
        let alloc = allocator(9000);
        let op = OperationId::new();

        // offset 1 of group 0 is the journal sector
        let blocks = alloc.allocate(op, 0, AllocationStrategy::Normal, 3).unwrap();
        assert_eq!(blocks, vec![4, 5, 6]);
        assert_eq!(alloc.locked_groups(op), vec![0]);
    }

    #[test]
    fn test_locked_group_is_skipped() {
        let alloc = allocator(9000);
        let a = OperationId::new();
        let b = OperationId::new();

        alloc.allocate(a, 0, AllocationStrategy::Normal, 1).unwrap();
        let blocks = alloc.allocate(b, 0, AllocationStrategy::Normal, 1).unwrap();
        assert_eq!(alloc.geometry().locate(blocks[0]).group, 1);

        // after `a` is done its group is open again
        alloc.return_allocations(a, &[]);
        assert!(alloc.locked_groups(a).is_empty());
        let c = OperationId::new();
        let blocks = alloc.allocate(c, 0, AllocationStrategy::Normal, 1).unwrap();
        assert_eq!(alloc.geometry().locate(blocks[0]).group, 0);
    }

    #[test]
    fn test_hint_scans_forward_then_backward() {
        let alloc = allocator(9000);
        let geo = *alloc.geometry();
        let op = OperationId::new();

        // group 2 holds fewer blocks than requested, the rest comes from 1
        let usable = geo.usable_offsets(2) as usize;
        let blocks = alloc
            .allocate(op, geo.address_of(2, 5), AllocationStrategy::Normal, usable + 2)
            .unwrap();
        let groups: HashSet<u64> = blocks.iter().map(|&a| geo.locate(a).group).collect();
        assert_eq!(groups, HashSet::from([1, 2]));
        assert!(blocks.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_normal_failure_rolls_back() {
        let alloc = allocator(9000);
        let before = alloc.free_blocks().unwrap();
        let op = OperationId::new();

        let err = alloc
            .allocate(op, 0, AllocationStrategy::Normal, before as usize + 1)
            .unwrap_err();
        assert!(err.is_out_of_space());
        assert_eq!(alloc.free_blocks().unwrap(), before);
        assert!(alloc.locked_groups(op).is_empty());

        // nothing stayed locked either
        let other = OperationId::new();
        alloc
            .allocate(other, 0, AllocationStrategy::Normal, before as usize)
            .unwrap();
    }

    #[test]
    fn test_forced_strategy_draws_from_locked_groups() {
        let alloc = allocator(9000);
        let holder = OperationId::new();
        let total = alloc.free_blocks().unwrap() as usize;

        // lock every group while leaving most of their blocks free
        let held: Vec<u64> = (0..3)
            .map(|g| {
                let hint = alloc.geometry().address_of(g, 10);
                alloc.allocate(holder, hint, AllocationStrategy::Normal, 1).unwrap()[0]
            })
            .collect();

        let op = OperationId::new();
        assert!(alloc.allocate(op, 0, AllocationStrategy::Normal, 1).is_err());

        let forced = alloc
            .allocate(op, 0, AllocationStrategy::JournalAllocation, total - 3)
            .unwrap();
        assert_eq!(forced.len(), total - 3);
        assert!(held.iter().all(|h| !forced.contains(h)));
        // locks stay with their owner
        assert!(alloc.locked_groups(op).is_empty());

        assert!(
            alloc
                .allocate(op, 0, AllocationStrategy::DynamicAllocation, 1)
                .is_err()
        );
    }

    #[test]
    fn test_disjoint_across_threads() {
        let alloc = allocator(20_000);
        let results = parking_lot::Mutex::new(Vec::new());

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let op = OperationId::new();
                    for _ in 0..20 {
                        let blocks = alloc
                            .allocate(op, 0, AllocationStrategy::DynamicAllocation, 7)
                            .unwrap();
                        results.lock().extend(blocks);
                    }
                });
            }
        });

        let all = results.into_inner();
        let unique: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(all.len(), 8 * 20 * 7);
        assert_eq!(unique.len(), all.len());
        assert!(all.iter().all(|&a| alloc.geometry().is_governed(a)));
    }

    #[test]
    fn test_memory_freed_keeps_lists_sorted() {
        let alloc = allocator(9000);
        let op = OperationId::new();
        let before = alloc.free_blocks().unwrap();

        let blocks = alloc.allocate(op, 0, AllocationStrategy::Normal, 10).unwrap();
        alloc.memory_freed(&[blocks[7], blocks[2], blocks[2]]);
        alloc.return_allocations(op, &blocks[..2]);
        assert_eq!(alloc.free_blocks().unwrap(), before - 10 + 4);

        // smallest free addresses come back first, without duplicates
        let again = alloc.allocate(op, 0, AllocationStrategy::Normal, 3).unwrap();
        assert_eq!(again, vec![blocks[0], blocks[1], blocks[2]]);
    }

    #[test]
    fn test_memory_freed_skips_uncached_groups() {
        let alloc = allocator(9000);
        let address = alloc.geometry().address_of(2, 1);
        alloc.memory_freed(&[address, 1]);
        let free = alloc.free_blocks().unwrap();
        // no duplicate was introduced by the early free
        assert_eq!(free, alloc.geometry().usable_offsets(2) + 4096 * 2 - 1);
    }

    #[test]
    fn test_mark_on_disk_is_idempotent() {
        let alloc = allocator(9000);
        let blocks = [5u64, 6, 4200];

        alloc.mark_on_disk(&blocks, true).unwrap();
        alloc.mark_on_disk(&blocks, true).unwrap();
        for &b in &blocks {
            assert!(alloc.is_used_on_disk(b).unwrap());
        }

        alloc.mark_on_disk(&blocks, false).unwrap();
        alloc.mark_on_disk(&blocks, false).unwrap();
        for &b in &blocks {
            assert!(!alloc.is_used_on_disk(b).unwrap());
        }
        // the journal sector bit is untouched
        assert!(alloc.is_used_on_disk(3).unwrap());
    }

    #[test]
    fn test_clear_cache_rescans_disk() {
        let alloc = allocator(9000);
        let op = OperationId::new();
        let before = alloc.free_blocks().unwrap();

        let blocks = alloc.allocate(op, 0, AllocationStrategy::Normal, 4).unwrap();
        alloc.mark_on_disk(&blocks, true).unwrap();
        alloc.return_allocations(op, &[]);

        alloc.clear_cache();
        assert_eq!(alloc.free_blocks().unwrap(), before - 4);
    }
}
