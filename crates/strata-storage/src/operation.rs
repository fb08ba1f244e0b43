//! Client contract for staged operations
//!
//! An operation is run by a journal in two phases. `prepare` inspects the
//! store read-only and estimates how many blocks the operation will need;
//! the journal reserves them. Then every stage runs against a [`Service`]
//! that records allocations, frees and writes. Under the safe journal each
//! stage is committed atomically before the next one starts.

use crate::context::AllocationContext;
use crate::store::BlockStore;
use std::sync::Arc;
use strata_common::{BlockAddress, BlockKind, Result};

/// Allocation estimate returned by [`Operation::prepare`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Prepared {
    /// Address near which blocks should be reserved, 0 for no preference
    pub hint: BlockAddress,
    /// Blocks reserved up front
    pub blocks_required: usize,
    /// Whether the reservation may grow while stages run
    pub allow_dynamic: bool,
}

impl Prepared {
    #[must_use]
    pub const fn new(hint: BlockAddress, blocks_required: usize) -> Self {
        Self {
            hint,
            blocks_required,
            allow_dynamic: false,
        }
    }

    #[must_use]
    pub const fn with_dynamic(mut self, allow_dynamic: bool) -> Self {
        self.allow_dynamic = allow_dynamic;
        self
    }

    /// Combine the estimates of two sub-operations. The first estimate's
    /// hint is kept even when it is 0; block counts add up and growth is
    /// allowed if either allows it.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            hint: self.hint,
            blocks_required: self.blocks_required + other.blocks_required,
            allow_dynamic: self.allow_dynamic || other.allow_dynamic,
        }
    }
}

/// Read access to the store
pub trait ReadService {
    fn block_size(&self) -> u32;

    /// Read a block as the current operation sees it
    fn read(&self, kind: BlockKind, address: BlockAddress) -> Result<Vec<u8>>;
}

/// Mutation surface handed to a running stage
pub trait Service: ReadService {
    /// Record that `address` becomes used when the stage commits
    fn allocate(&mut self, address: BlockAddress);

    /// Record that `address` becomes free when the stage commits. Repeated
    /// calls for one address count once.
    fn deallocate(&mut self, address: BlockAddress);

    /// Write a block
    fn write(&mut self, kind: BlockKind, address: BlockAddress, data: &[u8]) -> Result<()>;

    /// The operation's block reservation
    fn allocation_context(&mut self) -> &mut AllocationContext;
}

/// A unit of work executed by a journal
pub trait Operation {
    /// Estimate the blocks the operation needs
    fn prepare(&mut self, reader: &dyn ReadService) -> Result<Prepared>;

    /// Number of stages, each committed on its own under the safe journal
    fn stage_count(&self) -> usize;

    /// Run one stage
    fn execute(&mut self, stage: usize, service: &mut dyn Service) -> Result<()>;
}

/// Reads straight from the store
#[derive(Clone)]
pub struct StoreReader {
    store: Arc<dyn BlockStore>,
}

impl StoreReader {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }
}

impl ReadService for StoreReader {
    fn block_size(&self) -> u32 {
        self.store.block_size()
    }

    fn read(&self, kind: BlockKind, address: BlockAddress) -> Result<Vec<u8>> {
        self.store.read(kind, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prepared() {
        let a = Prepared::new(0, 3);
        let b = Prepared::new(900, 2).with_dynamic(true);

        // no preference in the first estimate stays no preference
        let merged = a.merge(b);
        assert_eq!(merged.hint, 0);
        assert_eq!(merged.blocks_required, 5);
        assert!(merged.allow_dynamic);

        let merged = b.merge(Prepared::new(12, 1));
        assert_eq!(merged.hint, 900);
    }
}
